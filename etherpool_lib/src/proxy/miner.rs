// Copyright (C) 2024, 2025 Etherpool Developers (see AUTHORS)
//
// This file is part of Etherpool
//
// Etherpool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Etherpool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Etherpool. If not, see <https://www.gnu.org/licenses/>.

//! Share verification and persistence.

use super::template::{BlockTemplate, HeaderDetail};
use super::ProxyServer;
use crate::hasher::PowHasher;
use crate::util::{
    bytes_to_hex32, diff_to_float, diff_to_target, hex_to_bytes32, hex_to_u64, max_uint256,
};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use tracing::{debug, error, info, warn};

/// Minimum plausible share difficulty (NiceHash float form); anything lower
/// is garbage input, not mining.
const MIN_SHARE_DIFF_FLOAT: f64 = 0.0001;

/// Verdict of pure share verification, before any persistence.
#[derive(Debug)]
pub enum ShareOutcome {
    /// params are not a well-formed share
    Malformed,
    /// header hash not in the template's window
    Stale,
    /// result below the sanity floor
    TooLow,
    /// claimed mix digest does not match the recomputed one
    BadMixDigest,
    /// above the share target
    Invalid,
    /// meets share target; ready for the share write path
    Valid {
        submit_params: Vec<String>,
        header: HeaderDetail,
    },
    /// additionally meets the block target
    BlockCandidate {
        submit_params: Vec<String>,
        header: HeaderDetail,
    },
}

/// Recompute the Ethash seal and classify the share. For Stratum the miner
/// sends no mix digest, so both digest and hash are recomputed and the
/// submit params rewritten; over HTTP the claimed digest must agree.
pub fn verify_share(
    hasher: &dyn PowHasher,
    template: &BlockTemplate,
    pool_diff: u64,
    params: &[String],
    stratum: bool,
) -> ShareOutcome {
    if params.len() != 3 {
        warn!("Share params length must be 3, got {}", params.len());
        return ShareOutcome::Malformed;
    }
    let (nonce_hex, mut hash_no_nonce, mix_digest) =
        (params[0].clone(), params[1].clone(), params[2].clone());
    let nonce = match hex_to_u64(&nonce_hex) {
        Some(nonce) => nonce,
        None => return ShareOutcome::Malformed,
    };

    let mut submit_params = vec![nonce_hex, hash_no_nonce.clone(), mix_digest.clone()];
    let result = if stratum {
        // Stratum submits carry the header hash where HTTP carries the mix
        let header_bytes = match hex_to_bytes32(&mix_digest) {
            Some(b) => b,
            None => return ShareOutcome::Malformed,
        };
        let (mix, result) = hasher.compute(template.height, &header_bytes, nonce);
        hash_no_nonce = bytes_to_hex32(&header_bytes);
        submit_params[1] = hash_no_nonce.clone();
        submit_params[2] = bytes_to_hex32(&mix);
        result
    } else {
        let header_bytes = match hex_to_bytes32(&hash_no_nonce) {
            Some(b) => b,
            None => return ShareOutcome::Malformed,
        };
        let (mix, result) = hasher.compute(template.height, &header_bytes, nonce);
        if !bytes_to_hex32(&mix).eq_ignore_ascii_case(&mix_digest) {
            return ShareOutcome::BadMixDigest;
        }
        result
    };

    let result = BigUint::from_bytes_be(&result);
    let share_diff = if result > BigUint::from(0u32) {
        max_uint256() / &result
    } else {
        max_uint256()
    };
    if diff_to_float(&share_diff) < MIN_SHARE_DIFF_FLOAT {
        warn!("Share difficulty too low from result {:x}", result);
        return ShareOutcome::TooLow;
    }

    let header = match template.header_detail(&hash_no_nonce) {
        Some(header) => header.clone(),
        None => return ShareOutcome::Stale,
    };

    debug!(
        "Difficulty pool/block/share = {} / {} / {}",
        pool_diff, header.diff, share_diff
    );

    let share_target = diff_to_target(&BigUint::from(pool_diff));
    if result > share_target {
        return ShareOutcome::Invalid;
    }

    let block_target = diff_to_target(&header.diff);
    if result <= block_target {
        ShareOutcome::BlockCandidate {
            submit_params,
            header,
        }
    } else {
        ShareOutcome::Valid {
            submit_params,
            header,
        }
    }
}

impl ProxyServer {
    /// Full share intake: verify, submit blocks upstream, persist. Returns
    /// `(exist, valid)`: `exist` flags a duplicate, `valid` whether the
    /// share counted.
    pub async fn process_share(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        template: &BlockTemplate,
        params: &[String],
        stratum: bool,
    ) -> (bool, bool) {
        let pool_diff = self.config.proxy.difficulty;
        let outcome = verify_share(self.hasher.as_ref(), template, pool_diff, params, stratum);

        match outcome {
            ShareOutcome::Malformed | ShareOutcome::TooLow | ShareOutcome::BadMixDigest => {
                (false, false)
            }
            ShareOutcome::Stale => {
                warn!("Stale share from {}@{}", login, ip);
                (false, false)
            }
            ShareOutcome::Invalid => (false, false),
            ShareOutcome::Valid {
                submit_params,
                header,
            } => {
                match self
                    .backend
                    .write_share(
                        login,
                        worker,
                        &submit_params,
                        pool_diff,
                        header.height,
                        self.config.proxy.hashrate_expiration,
                    )
                    .await
                {
                    Ok(true) => (true, false),
                    Ok(false) => (false, true),
                    Err(e) => {
                        error!("Failed to insert share data into backend: {}", e);
                        (false, true)
                    }
                }
            }
            ShareOutcome::BlockCandidate {
                submit_params,
                header,
            } => {
                match self.rpc().submit_block(&submit_params).await {
                    Err(e) => {
                        error!(
                            "Block submission failure at height {} for {}: {}",
                            header.height, template.header, e
                        );
                        (false, false)
                    }
                    Ok(false) => {
                        error!(
                            "Block rejected at height {} for {}",
                            header.height, template.header
                        );
                        (false, false)
                    }
                    Ok(true) => {
                        self.fetch_block_template().await;
                        let block_diff = header.diff.to_u64().unwrap_or(u64::MAX);
                        match self
                            .backend
                            .write_block(
                                login,
                                worker,
                                &submit_params,
                                pool_diff,
                                block_diff,
                                header.height,
                                self.config.proxy.hashrate_expiration,
                            )
                            .await
                        {
                            Ok(true) => (true, false),
                            Ok(false) => {
                                info!(
                                    "Block found by miner {}@{} at height {}",
                                    login, ip, header.height
                                );
                                (false, true)
                            }
                            Err(e) => {
                                error!(
                                    "Failed to insert block candidate into backend: {}",
                                    e
                                );
                                (false, true)
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::MockPowHasher;
    use crate::util::get_target_hex;

    const HEADER: &str = "0x34365c6e44e848d7f5f06cea8607b7be2a3f6e3fdf9163312ffd0b09baff0f37";
    const POOL_DIFF: u64 = 2_000_000_000;
    const BLOCK_DIFF: u64 = 7_000_000_000;

    fn template() -> BlockTemplate {
        BlockTemplate::next(
            None,
            HEADER.to_string(),
            "0x290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563".to_string(),
            get_target_hex(BLOCK_DIFF),
            1000,
        )
    }

    /// A result that just meets difficulty `diff`
    fn result_for_diff(diff: u64) -> [u8; 32] {
        let r = max_uint256() / BigUint::from(diff) - BigUint::from(1u32);
        let bytes = r.to_bytes_be();
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        out
    }

    fn share_params(mix: &[u8; 32]) -> Vec<String> {
        vec![
            "0x72d683b55b1e1627".to_string(),
            HEADER.to_string(),
            bytes_to_hex32(mix),
        ]
    }

    fn mock_hasher(mix: [u8; 32], result: [u8; 32]) -> MockPowHasher {
        let mut hasher = MockPowHasher::new();
        hasher
            .expect_compute()
            .returning(move |_, _, _| (mix, result));
        hasher
    }

    #[test]
    fn test_wrong_param_count_is_malformed() {
        let hasher = MockPowHasher::new();
        let outcome = verify_share(
            &hasher,
            &template(),
            POOL_DIFF,
            &["0x1".to_string()],
            false,
        );
        assert!(matches!(outcome, ShareOutcome::Malformed));
    }

    #[test]
    fn test_mix_digest_mismatch_is_rejected() {
        let mix = [0x11u8; 32];
        let hasher = mock_hasher(mix, result_for_diff(POOL_DIFF * 2));
        let mut params = share_params(&mix);
        params[2] = bytes_to_hex32(&[0x22u8; 32]);
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &params, false);
        assert!(matches!(outcome, ShareOutcome::BadMixDigest));
    }

    #[test]
    fn test_unknown_header_is_stale() {
        let mix = [0x11u8; 32];
        let hasher = mock_hasher(mix, result_for_diff(POOL_DIFF * 2));
        let mut params = share_params(&mix);
        params[1] = "0x0000000000000000000000000000000000000000000000000000000000000bad"
            .to_string();
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &params, false);
        assert!(matches!(outcome, ShareOutcome::Stale));
    }

    #[test]
    fn test_rolled_template_still_accepts_previous_header() {
        // template advanced but H1 is still in the headers map
        let t1 = template();
        let t2 = BlockTemplate::next(
            Some(&t1),
            "0x1111111111111111111111111111111111111111111111111111111111111111".to_string(),
            t1.seed.clone(),
            get_target_hex(BLOCK_DIFF),
            1001,
        );
        let mix = [0x11u8; 32];
        let hasher = mock_hasher(mix, result_for_diff(POOL_DIFF * 2));
        let outcome = verify_share(&hasher, &t2, POOL_DIFF, &share_params(&mix), false);
        assert!(matches!(outcome, ShareOutcome::Valid { .. }));
    }

    #[test]
    fn test_low_difficulty_result_is_invalid() {
        let mix = [0x11u8; 32];
        // result difficulty is half the pool difficulty
        let hasher = mock_hasher(mix, result_for_diff(POOL_DIFF / 2));
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &share_params(&mix), false);
        assert!(matches!(outcome, ShareOutcome::Invalid));
    }

    #[test]
    fn test_tiny_difficulty_hits_sanity_floor() {
        let mix = [0x11u8; 32];
        let hasher = mock_hasher(mix, result_for_diff(1));
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &share_params(&mix), false);
        assert!(matches!(outcome, ShareOutcome::TooLow));
    }

    #[test]
    fn test_share_above_pool_diff_is_valid() {
        let mix = [0x11u8; 32];
        let hasher = mock_hasher(mix, result_for_diff(POOL_DIFF * 2));
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &share_params(&mix), false);
        match outcome {
            ShareOutcome::Valid { header, .. } => assert_eq!(header.height, 1000),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn test_share_meeting_block_target_is_candidate() {
        let mix = [0x11u8; 32];
        let hasher = mock_hasher(mix, result_for_diff(BLOCK_DIFF + 1));
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &share_params(&mix), false);
        match outcome {
            ShareOutcome::BlockCandidate { header, .. } => {
                assert_eq!(header.height, 1000);
                assert_eq!(header.diff, BigUint::from(BLOCK_DIFF));
            }
            other => panic!("expected BlockCandidate, got {other:?}"),
        }
    }

    #[test]
    fn test_stratum_submit_rewrites_params() {
        let mix = [0x33u8; 32];
        let hasher = mock_hasher(mix, result_for_diff(POOL_DIFF * 2));
        // stratum submits [nonce, headerHash, headerHash]
        let params = vec![
            "0x72d683b55b1e1627".to_string(),
            HEADER.to_string(),
            HEADER.to_string(),
        ];
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &params, true);
        match outcome {
            ShareOutcome::Valid { submit_params, .. } => {
                assert_eq!(submit_params[1], HEADER);
                assert_eq!(submit_params[2], bytes_to_hex32(&mix));
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_nonce_is_malformed() {
        let hasher = MockPowHasher::new();
        let params = vec![
            "0xnotahexnonce".to_string(),
            HEADER.to_string(),
            HEADER.to_string(),
        ];
        let outcome = verify_share(&hasher, &template(), POOL_DIFF, &params, false);
        assert!(matches!(outcome, ShareOutcome::Malformed));
    }
}
