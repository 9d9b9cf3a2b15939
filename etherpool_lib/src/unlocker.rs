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

//! Block unlocker: reconciles candidates recorded at discovery time with
//! canonical chain state some confirmations later.
//!
//! The node cannot give a consistent height+job pair at discovery, so the
//! stored round height is only a reference point. Each candidate is
//! searched for across a 16-block window in both directions, as a block or
//! as an uncle of a window block; first match wins. A `null` block inside
//! the scan halts the whole pass: the store must never be credited from a
//! half-readable chain.

use crate::config::{Network, UnlockerConfig};
use crate::rewards::{
    self, biguint_to_rational, wei_to_shannon, MonetaryPolicy,
};
use crate::store::{BlockData, Store};
use crate::supervisor::RoutineGroup;
use crate::util::{hex_to_biguint, hex_to_u64};
use gethrpc::{GetBlockReply, GethRpcClient};
use num_bigint::BigUint;
use num_rational::BigRational;
use num_traits::Zero;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Candidates younger than this are never scanned.
const MIN_DEPTH: u64 = 16;

/// The store-free half of the unlocker: chain window scanning and reward
/// computation for one candidate at a time.
pub struct CandidateScanner {
    rpc: GethRpcClient,
    policy: MonetaryPolicy,
    keep_tx_fees: bool,
}

pub struct BlockUnlocker {
    config: UnlockerConfig,
    backend: Store,
    scanner: CandidateScanner,
    halt: AtomicBool,
    last_fail: Mutex<Option<String>>,
}

#[derive(Debug, Default)]
pub struct UnlockResult {
    pub matured_blocks: Vec<BlockData>,
    pub orphaned_blocks: Vec<BlockData>,
    pub orphans: usize,
    pub uncles: usize,
    pub blocks: usize,
}

impl BlockUnlocker {
    pub fn new(
        config: &UnlockerConfig,
        network: Network,
        backend: Store,
    ) -> Result<Arc<Self>, gethrpc::RpcError> {
        let rpc = GethRpcClient::new("BlockUnlocker", &config.daemon, config.timeout)?;
        Ok(Arc::new(Self {
            config: config.clone(),
            backend,
            scanner: CandidateScanner::new(rpc, network, config.keep_tx_fees),
            halt: AtomicBool::new(false),
            last_fail: Mutex::new(None),
        }))
    }

    pub async fn start(self: &Arc<Self>, group: &Arc<RoutineGroup>) {
        info!("Starting block unlocker");
        let interval = self.config.interval;
        info!("Set block unlock interval to {:?}", interval);

        // Immediately unlock after start
        self.unlock_pending_blocks().await;
        self.unlock_and_credit_miners().await;

        let unlocker = self.clone();
        let token = group.token();
        group
            .go_recover(move || {
                let unlocker = unlocker.clone();
                let token = token.clone();
                async move {
                    let mut timer = tokio::time::interval(interval);
                    timer.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => {
                                info!("Stopping unlocker working module");
                                return;
                            }
                            _ = timer.tick() => {
                                unlocker.unlock_pending_blocks().await;
                                unlocker.unlock_and_credit_miners().await;
                            }
                        }
                    }
                }
            })
            .await;
    }

    fn set_fail(&self, err: String) {
        error!("{}", err);
        self.halt.store(true, Ordering::SeqCst);
        *self.last_fail.lock() = Some(err);
    }

    fn halted(&self) -> bool {
        if self.halt.load(Ordering::SeqCst) {
            error!(
                "Unlocking suspended due to last critical error: {:?}",
                self.last_fail.lock().as_deref().unwrap_or("unknown")
            );
            return true;
        }
        false
    }

    async fn chain_tip(&self) -> Option<u64> {
        let current = match self.scanner.rpc.get_latest_block().await {
            Ok(block) => block,
            Err(e) => {
                self.set_fail(format!(
                    "Unable to get current blockchain height from node: {e}"
                ));
                return None;
            }
        };
        match hex_to_u64(&current.number) {
            Some(height) => Some(height),
            None => {
                self.set_fail(format!(
                    "Can't parse latest block number {:?}",
                    current.number
                ));
                None
            }
        }
    }

    /// Pass A: candidates deep enough to classify, credited as immature.
    pub async fn unlock_pending_blocks(&self) {
        if self.halted() {
            return;
        }
        let Some(current_height) = self.chain_tip().await else {
            return;
        };

        let candidates = match self
            .backend
            .get_candidates(current_height.saturating_sub(self.config.immature_depth))
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                self.set_fail(format!("Failed to get block candidates from backend: {e}"));
                return;
            }
        };
        if candidates.is_empty() {
            info!("No block candidates to unlock");
            return;
        }

        let result = match self.scanner.unlock_candidates(candidates).await {
            Ok(result) => result,
            Err(e) => {
                self.set_fail(format!("Failed to unlock blocks: {e}"));
                return;
            }
        };
        info!(
            "Immature {} blocks, {} uncles, {} orphans",
            result.blocks, result.uncles, result.orphans
        );

        if let Err(e) = self.backend.write_pending_orphans(&result.orphaned_blocks).await {
            self.set_fail(format!("Failed to insert orphaned blocks into backend: {e}"));
            return;
        }
        if result.orphans > 0 {
            warn!("Inserted {} orphaned blocks to backend", result.orphans);
        }

        let mut total_revenue = BigRational::zero();
        let mut total_miners = BigRational::zero();
        let mut total_pool = BigRational::zero();
        for block in &result.matured_blocks {
            let (revenue, miners_profit, pool_profit, round_rewards) =
                match self.calculate_rewards(block).await {
                    Ok(split) => split,
                    Err(e) => {
                        self.set_fail(format!(
                            "Failed to calculate rewards for round {}: {e}",
                            block.round_key()
                        ));
                        return;
                    }
                };
            if let Err(e) = self.backend.write_immature_block(block, &round_rewards).await {
                self.set_fail(format!(
                    "Failed to credit rewards for round {}: {e}",
                    block.round_key()
                ));
                return;
            }
            total_revenue += &revenue;
            total_miners += &miners_profit;
            total_pool += &pool_profit;
            info!(
                "IMMATURE {}: revenue {}, miners profit {}, pool profit: {}",
                block.round_key(),
                wei_to_shannon(&revenue),
                wei_to_shannon(&miners_profit),
                wei_to_shannon(&pool_profit),
            );
        }
        info!(
            "IMMATURE SESSION: revenue {}, miners profit {}, pool profit: {} Shannon",
            wei_to_shannon(&total_revenue),
            wei_to_shannon(&total_miners),
            wei_to_shannon(&total_pool),
        );
    }

    /// Pass B: immature rows past full maturity depth, finally credited.
    pub async fn unlock_and_credit_miners(&self) {
        if self.halted() {
            return;
        }
        let Some(current_height) = self.chain_tip().await else {
            return;
        };

        let immature = match self
            .backend
            .get_immature_blocks(current_height.saturating_sub(self.config.depth))
            .await
        {
            Ok(immature) => immature,
            Err(e) => {
                self.set_fail(format!("Failed to get immature blocks from backend: {e}"));
                return;
            }
        };
        if immature.is_empty() {
            info!("No immature blocks to credit miners");
            return;
        }

        let result = match self.scanner.unlock_candidates(immature).await {
            Ok(result) => result,
            Err(e) => {
                self.set_fail(format!("Failed to unlock blocks: {e}"));
                return;
            }
        };
        info!(
            "Unlocked {} blocks, {} uncles, {} orphans",
            result.blocks, result.uncles, result.orphans
        );

        for block in &result.orphaned_blocks {
            if let Err(e) = self.backend.write_orphan(block).await {
                self.set_fail(format!("Failed to insert orphaned block into backend: {e}"));
                return;
            }
        }
        if result.orphans > 0 {
            info!("Inserted {} orphaned blocks to backend", result.orphans);
        }

        let mut total_revenue = BigRational::zero();
        let mut total_miners = BigRational::zero();
        let mut total_pool = BigRational::zero();
        for block in &result.matured_blocks {
            let (revenue, miners_profit, pool_profit, round_rewards) =
                match self.calculate_rewards(block).await {
                    Ok(split) => split,
                    Err(e) => {
                        self.set_fail(format!(
                            "Failed to calculate rewards for round {}: {e}",
                            block.round_key()
                        ));
                        return;
                    }
                };
            if let Err(e) = self.backend.write_matured_block(block, &round_rewards).await {
                self.set_fail(format!(
                    "Failed to credit rewards for round {}: {e}",
                    block.round_key()
                ));
                return;
            }
            total_revenue += &revenue;
            total_miners += &miners_profit;
            total_pool += &pool_profit;
            info!(
                "MATURED {}: revenue {}, miners profit {}, pool profit: {}",
                block.round_key(),
                wei_to_shannon(&revenue),
                wei_to_shannon(&miners_profit),
                wei_to_shannon(&pool_profit),
            );
        }
        info!(
            "MATURE SESSION: revenue {}, miners profit {}, pool profit: {} Shannon",
            wei_to_shannon(&total_revenue),
            wei_to_shannon(&total_miners),
            wei_to_shannon(&total_pool),
        );
    }

    /// Split one matured block's revenue into the per-login Shannon credits.
    pub async fn calculate_rewards(
        &self,
        block: &BlockData,
    ) -> Result<(BigRational, BigRational, BigRational, HashMap<String, i64>), String> {
        let mut revenue = biguint_to_rational(&block.reward);
        let (miners_profit, mut pool_profit) =
            rewards::charge_fee(&revenue, self.config.pool_fee);

        let (shares, total) = self
            .backend
            .get_round_shares(block.round_height, &block.nonce)
            .await
            .map_err(|e| format!("Failed to get round shares: {e}"))?;

        let mut round_rewards = rewards::rewards_for_shares(&shares, total, &miners_profit);

        if !block.extra_reward.is_zero() {
            let extra = biguint_to_rational(&block.extra_reward);
            pool_profit += &extra;
            revenue += &extra;
        }

        if !self.config.pool_fee_address.is_empty() {
            let address = self.config.pool_fee_address.to_lowercase();
            *round_rewards.entry(address).or_insert(0) += wei_to_shannon(&pool_profit);
        }

        Ok((revenue, miners_profit, pool_profit, round_rewards))
    }
}

impl CandidateScanner {
    pub fn new(rpc: GethRpcClient, network: Network, keep_tx_fees: bool) -> Self {
        Self {
            rpc,
            policy: MonetaryPolicy::for_network(network),
            keep_tx_fees,
        }
    }

    /// Scan the chain window around each candidate and classify it. Errors
    /// abort the whole pass; the caller halts.
    pub async fn unlock_candidates(
        &self,
        candidates: Vec<BlockData>,
    ) -> Result<UnlockResult, String> {
        let mut result = UnlockResult::default();

        'candidates: for mut candidate in candidates {
            // avoid scanning the first blocks of the chain
            if candidate.height < MIN_DEPTH {
                continue;
            }
            for i in -(MIN_DEPTH as i64)..MIN_DEPTH as i64 {
                let height = candidate.height as i64 + i;
                if height < 0 {
                    continue;
                }
                let height = height as u64;

                let block = self
                    .rpc
                    .get_block_by_height(height)
                    .await
                    .map_err(|e| format!("Error while retrieving block {height} from node: {e}"))?
                    .ok_or_else(|| {
                        format!("Error while retrieving block {height} from node, wrong node height")
                    })?;

                if match_candidate(&block, &candidate) {
                    self.handle_block(&block, &mut candidate).await?;
                    result.blocks += 1;
                    info!(
                        "Mature block {} with {} tx, hash: {}",
                        candidate.height,
                        block.transactions.len(),
                        &candidate.hash[..10.min(candidate.hash.len())]
                    );
                    result.matured_blocks.push(candidate);
                    continue 'candidates;
                }

                for uncle_index in 0..block.uncles.len() {
                    let uncle = self
                        .rpc
                        .get_uncle_by_block_number_and_index(height, uncle_index)
                        .await
                        .map_err(|e| {
                            format!("Error while retrieving uncle of block {height} from node: {e}")
                        })?
                        .ok_or_else(|| {
                            format!("Error while retrieving uncle of block {height} from node")
                        })?;

                    if match_candidate(&uncle, &candidate) {
                        self.handle_uncle(height, &uncle, &mut candidate)?;
                        result.uncles += 1;
                        info!(
                            "Mature uncle {}/{} with hash: {}",
                            candidate.height,
                            candidate.uncle_height,
                            &candidate.hash[..10.min(candidate.hash.len())]
                        );
                        result.matured_blocks.push(candidate);
                        continue 'candidates;
                    }
                }
            }

            // lost: nothing in the window matched as block or uncle
            warn!("Orphaned block {}:{}", candidate.round_height, candidate.nonce);
            candidate.orphan = true;
            result.orphans += 1;
            result.orphaned_blocks.push(candidate);
        }
        Ok(result)
    }

    async fn handle_block(
        &self,
        block: &GetBlockReply,
        candidate: &mut BlockData,
    ) -> Result<(), String> {
        let correct_height = hex_to_u64(&block.number)
            .ok_or_else(|| format!("Can't parse block number {:?}", block.number))?;
        candidate.height = correct_height;

        let uncle_count = BigUint::from(block.uncles.len() as u64);
        let mut reward = match self.policy.network {
            Network::Classic | Network::Mordor => {
                let era = rewards::block_era(correct_height, self.policy.ecip1017_era_rounds);
                let base = rewards::const_reward_classic(era);
                let for_uncles = rewards::uncle_inclusion_reward(&base) * &uncle_count;
                base + for_uncles
            }
            Network::Ubiq => {
                let base = rewards::const_reward_ubiq(correct_height);
                let for_uncles = rewards::uncle_inclusion_reward(&base) * &uncle_count;
                base + for_uncles
            }
            Network::Ethereum | Network::Ropsten => {
                let base_fee = hex_to_biguint(&block.base_fee_per_gas).unwrap_or_default();
                let gas_used = hex_to_biguint(&block.gas_used).unwrap_or_default();
                let base = rewards::const_reward_ethereum(
                    correct_height,
                    &base_fee,
                    &gas_used,
                    &self.policy,
                );
                let stat = rewards::static_reward_ethereum(correct_height, &self.policy);
                let for_uncles = rewards::uncle_inclusion_reward(&stat) * &uncle_count;
                base + for_uncles
            }
        };

        let extra_tx_reward = self.get_extra_reward_for_tx(block).await?;
        if self.keep_tx_fees {
            candidate.extra_reward = extra_tx_reward;
        } else {
            reward += extra_tx_reward;
        }

        candidate.orphan = false;
        candidate.hash = block.hash.clone();
        candidate.reward = reward;
        Ok(())
    }

    fn handle_uncle(
        &self,
        height: u64,
        uncle: &GetBlockReply,
        candidate: &mut BlockData,
    ) -> Result<(), String> {
        let uncle_height = hex_to_u64(&uncle.number)
            .ok_or_else(|| format!("Can't parse uncle block number {:?}", uncle.number))?;

        let reward = match self.policy.network {
            Network::Classic | Network::Mordor => {
                let era = rewards::block_era(height, self.policy.ecip1017_era_rounds);
                rewards::uncle_reward_classic(
                    uncle_height,
                    height,
                    era,
                    &rewards::const_reward_classic(era),
                )
            }
            Network::Ubiq => rewards::uncle_reward_ubiq(
                uncle_height,
                height,
                &rewards::const_reward_ubiq(height),
            ),
            Network::Ethereum | Network::Ropsten => rewards::uncle_reward_ethereum(
                uncle_height,
                height,
                &rewards::static_reward_ethereum(height, &self.policy),
            ),
        };

        candidate.height = height;
        candidate.uncle_height = uncle_height;
        candidate.orphan = false;
        candidate.hash = uncle.hash.clone();
        candidate.reward = reward;
        Ok(())
    }

    /// Fees of every transaction in the block, from the receipts.
    async fn get_extra_reward_for_tx(&self, block: &GetBlockReply) -> Result<BigUint, String> {
        let mut amount = BigUint::zero();
        for tx in &block.transactions {
            let receipt = self
                .rpc
                .get_tx_receipt(&tx.hash)
                .await
                .map_err(|e| format!("Error while fetching TX receipt: {e}"))?;
            if let Some(receipt) = receipt {
                let gas_used = hex_to_biguint(&receipt.gas_used).unwrap_or_default();
                let gas_price = hex_to_biguint(&tx.gas_price).unwrap_or_default();
                amount += gas_used * gas_price;
            }
        }
        Ok(amount)
    }
}

/// Matching order: known hash first, then geth-style nonce, then Parity
/// seal fields.
fn match_candidate(block: &GetBlockReply, candidate: &BlockData) -> bool {
    if !candidate.hash.is_empty() && candidate.hash.eq_ignore_ascii_case(&block.hash) {
        return true;
    }
    if !block.nonce.is_empty() {
        return block.nonce.eq_ignore_ascii_case(&candidate.nonce);
    }
    if block.seal_fields.len() == 2 {
        return candidate.nonce.eq_ignore_ascii_case(&block.seal_fields[1]);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use gethrpc::test_utils::{mock_method, setup_mock_node};
    use wiremock::MockServer;

    const NONCE: &str = "0x72d683b55b1e1627";

    fn candidate(height: u64) -> BlockData {
        BlockData {
            round_height: height,
            height,
            nonce: NONCE.to_string(),
            pow_hash: "0x34365c6e44e848d7f5f06cea8607b7be2a3f6e3fdf9163312ffd0b09baff0f37"
                .to_string(),
            mix_digest: "0xb57e87e72e9e4bb5b520ba80a6f75f5852a0a3928b17c77b33a6d5dc8d07faaf"
                .to_string(),
            timestamp: 1_700_000_000,
            difficulty: 123_456,
            total_shares: 1000,
            ..Default::default()
        }
    }

    fn block_json(height: u64, nonce: &str, uncles: Vec<&str>) -> serde_json::Value {
        serde_json::json!({
            "number": format!("0x{height:x}"),
            "hash": format!("0x{height:064x}"),
            "nonce": nonce,
            "difficulty": "0x1e240",
            "gasUsed": "0x0",
            "uncles": uncles,
            "transactions": [],
        })
    }

    async fn mount_window(server: &MockServer, center: u64, special: Option<(u64, serde_json::Value)>) {
        for height in center.saturating_sub(MIN_DEPTH)..center + MIN_DEPTH {
            let body = match &special {
                Some((h, body)) if *h == height => body.clone(),
                _ => block_json(height, "0x0000000000000001", vec![]),
            };
            mock_method(
                server,
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{height:x}"), true]),
                body,
            )
            .await;
        }
    }

    #[test]
    fn test_match_candidate_precedence() {
        let mut block = GetBlockReply {
            hash: "0xAABB".to_string(),
            nonce: NONCE.to_uppercase(),
            ..Default::default()
        };
        let mut cand = candidate(100);

        // nonce matching is case-insensitive
        assert!(match_candidate(&block, &cand));

        // known hash short-circuits
        cand.hash = "0xaabb".to_string();
        block.nonce = "0xdeadbeef00000000".to_string();
        assert!(match_candidate(&block, &cand));

        // parity seal fields
        cand.hash = String::new();
        block.nonce = String::new();
        block.seal_fields = vec!["0x".to_string(), NONCE.to_string()];
        assert!(match_candidate(&block, &cand));

        block.seal_fields = vec![];
        assert!(!match_candidate(&block, &cand));
    }

    #[tokio::test]
    async fn test_candidate_matched_as_block() {
        let (server, rpc) = setup_mock_node().await;
        mount_window(
            &server,
            1000,
            Some((1000, block_json(1000, NONCE, vec![]))),
        )
        .await;

        let unlocker = test_unlocker(&server, rpc);
        let result = unlocker
            .unlock_candidates(vec![candidate(1000)])
            .await
            .unwrap();

        assert_eq!(result.blocks, 1);
        assert_eq!(result.orphans, 0);
        let block = &result.matured_blocks[0];
        assert_eq!(block.height, 1000);
        assert!(!block.orphan);
        // classic era 0 static reward, no uncles, no fees
        assert_eq!(block.reward, BigUint::from(5_000_000_000_000_000_000u64));
        assert_eq!(block.hash, format!("0x{:064x}", 1000u64));
    }

    #[tokio::test]
    async fn test_candidate_matched_as_uncle() {
        let (server, rpc) = setup_mock_node().await;
        // block 1001 includes our candidate as uncle index 0
        let including = block_json(1001, "0x0000000000000002", vec!["0xu0"]);
        mount_window(&server, 1000, Some((1001, including))).await;
        mock_method(
            &server,
            "eth_getUncleByBlockNumberAndIndex",
            serde_json::json!(["0x3e9", "0x0"]),
            block_json(1000, NONCE, vec![]),
        )
        .await;

        let unlocker = test_unlocker(&server, rpc);
        let result = unlocker
            .unlock_candidates(vec![candidate(1000)])
            .await
            .unwrap();

        assert_eq!(result.uncles, 1);
        let block = &result.matured_blocks[0];
        assert_eq!(block.height, 1001);
        assert_eq!(block.uncle_height, 1000);
        assert!(!block.orphan);
        // era-0 uncle at depth 1: 7/8 * 5e18
        assert_eq!(block.reward, BigUint::from(4_375_000_000_000_000_000u64));
    }

    #[tokio::test]
    async fn test_candidate_without_match_is_orphaned() {
        let (server, rpc) = setup_mock_node().await;
        mount_window(&server, 5000, None).await;

        let unlocker = test_unlocker(&server, rpc);
        let result = unlocker
            .unlock_candidates(vec![candidate(5000)])
            .await
            .unwrap();

        assert_eq!(result.blocks, 0);
        assert_eq!(result.uncles, 0);
        assert_eq!(result.orphans, 1);
        assert!(result.orphaned_blocks[0].orphan);
    }

    #[tokio::test]
    async fn test_null_block_in_window_fails_the_pass() {
        let (server, rpc) = setup_mock_node().await;
        // mount only part of the window; the missing height returns null
        for height in 984..=990u64 {
            mock_method(
                &server,
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{height:x}"), true]),
                block_json(height, "0x0000000000000001", vec![]),
            )
            .await;
        }
        mock_method(
            &server,
            "eth_getBlockByNumber",
            serde_json::json!(["0x3df", true]),
            serde_json::Value::Null,
        )
        .await;

        let unlocker = test_unlocker(&server, rpc);
        let err = unlocker
            .unlock_candidates(vec![candidate(1000)])
            .await
            .unwrap_err();
        assert!(err.contains("wrong node height"), "{err}");
    }

    #[tokio::test]
    async fn test_young_candidates_are_skipped() {
        let (server, rpc) = setup_mock_node().await;
        let unlocker = test_unlocker(&server, rpc);
        let result = unlocker
            .unlock_candidates(vec![candidate(10)])
            .await
            .unwrap();
        assert_eq!(result.blocks + result.uncles + result.orphans, 0);
    }

    fn test_unlocker(_server: &MockServer, rpc: GethRpcClient) -> CandidateScanner {
        CandidateScanner::new(rpc, Network::Classic, false)
    }
}
