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

//! Ethash-family light verification.
//!
//! Shares are verified against the light cache only; the pool never builds
//! the full DAG. The cache for an epoch is generated on first use and the
//! three most recent epochs are kept around so verification keeps working
//! across an epoch transition.

use crate::config::Network;
use parking_lot::Mutex;
use sha3::{Digest, Keccak256, Keccak512};
use std::collections::HashMap;
use std::sync::Arc;

const WORD_BYTES: usize = 4;
const HASH_BYTES: usize = 64;
const MIX_BYTES: usize = 128;
const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;
const CACHE_ROUNDS: usize = 3;
const DATASET_PARENTS: u32 = 256;
const ACCESSES: usize = 64;
const FNV_PRIME: u32 = 0x01000193;

const EPOCH_LENGTH: u64 = 30_000;
const EPOCH_LENGTH_ECIP1099: u64 = 60_000;

/// ECIP-1099 activation heights
pub const ECIP1099_FBLOCK_CLASSIC: u64 = 11_700_000;
pub const ECIP1099_FBLOCK_MORDOR: u64 = 2_520_000;
/// UIP-1F activation epoch on Ubiq mainnet
pub const UIP1_EPOCH_UBIQ: u64 = 22;

/// Proof-of-work seal verification, `(mix_digest, result)` for a share.
/// One instance per process, selected by network.
#[cfg_attr(test, mockall::automock)]
pub trait PowHasher: Send + Sync {
    fn compute(&self, height: u64, header_hash: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]);
}

/// Etchash light hasher. With `ecip1099_fblock` set, the epoch length
/// doubles from the fork block on; with `uip1_epoch` set the seed sequence
/// forks off the Ethash one at that epoch (Ubqhash).
pub struct Etchash {
    ecip1099_fblock: Option<u64>,
    uip1_epoch: Option<u64>,
    caches: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
}

impl Etchash {
    pub fn new(ecip1099_fblock: Option<u64>, uip1_epoch: Option<u64>) -> Self {
        Self {
            ecip1099_fblock,
            uip1_epoch,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide hasher for a network. Ethereum/Ropsten deliberately
    /// share Classic's fork height, matching the upstream deployment this
    /// pool is run against.
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Classic => Self::new(Some(ECIP1099_FBLOCK_CLASSIC), None),
            Network::Mordor => Self::new(Some(ECIP1099_FBLOCK_MORDOR), None),
            Network::Ubiq => Self::new(None, Some(UIP1_EPOCH_UBIQ)),
            Network::Ethereum | Network::Ropsten => {
                Self::new(Some(ECIP1099_FBLOCK_CLASSIC), None)
            }
        }
    }

    fn epoch_length(&self, height: u64) -> u64 {
        match self.ecip1099_fblock {
            Some(fork) if height >= fork => EPOCH_LENGTH_ECIP1099,
            _ => EPOCH_LENGTH,
        }
    }

    fn cache_for(&self, epoch: u64, epoch_length: u64) -> Arc<Vec<u8>> {
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(&epoch) {
            return cache.clone();
        }
        let seed = seed_hash(epoch, epoch_length, self.uip1_epoch);
        let size = cache_size(epoch);
        tracing::info!(
            "Generating ethash light cache for epoch {} ({} bytes)",
            epoch,
            size
        );
        let cache = Arc::new(make_cache(size as usize, seed));
        caches.insert(epoch, cache.clone());
        // keep only the most recent epochs
        if caches.len() > 3 {
            let oldest = *caches.keys().min().unwrap();
            caches.remove(&oldest);
        }
        cache
    }
}

impl PowHasher for Etchash {
    fn compute(&self, height: u64, header_hash: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
        let epoch_length = self.epoch_length(height);
        let epoch = height / epoch_length;
        let cache = self.cache_for(epoch, epoch_length);
        let full_size = dataset_size(epoch);
        hashimoto_light(full_size, &cache, header_hash, nonce)
    }
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

fn keccak512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Keccak512::digest(data));
    out
}

fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(FNV_PRIME) ^ b
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut i = 3u64;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// Light cache size in bytes for an epoch.
pub fn cache_size(epoch: u64) -> u64 {
    let mut sz = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch - HASH_BYTES as u64;
    while !is_prime(sz / HASH_BYTES as u64) {
        sz -= 2 * HASH_BYTES as u64;
    }
    sz
}

/// Full dataset size in bytes for an epoch. Verification only needs the
/// number, not the dataset.
pub fn dataset_size(epoch: u64) -> u64 {
    let mut sz = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch - MIX_BYTES as u64;
    while !is_prime(sz / MIX_BYTES as u64) {
        sz -= 2 * MIX_BYTES as u64;
    }
    sz
}

/// Seed for an epoch's cache: keccak256 iterated once per 30000-block legacy
/// epoch, so doubled ECIP-1099 epochs continue the legacy seed sequence.
/// From the UIP-1F activation epoch every step hashes twice, which forks the
/// Ubiq cache/DAG sequence away from Ethash for all later epochs.
pub fn seed_hash(epoch: u64, epoch_length: u64, uip1_epoch: Option<u64>) -> [u8; 32] {
    let rounds = epoch * (epoch_length / EPOCH_LENGTH);
    let mut seed = [0u8; 32];
    for i in 0..rounds {
        seed = keccak256(&seed);
        if matches!(uip1_epoch, Some(fork) if i + 1 >= fork) {
            seed = keccak256(&seed);
        }
    }
    seed
}

fn make_cache(size: usize, seed: [u8; 32]) -> Vec<u8> {
    let n = size / HASH_BYTES;
    let mut cache = vec![0u8; n * HASH_BYTES];

    let mut prev = keccak512(&seed);
    cache[..HASH_BYTES].copy_from_slice(&prev);
    for i in 1..n {
        prev = keccak512(&prev);
        cache[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&prev);
    }

    // RandMemoHash rounds (Sergio Lerner's strict memory-hard function)
    let mut temp = [0u8; HASH_BYTES];
    for _ in 0..CACHE_ROUNDS {
        for i in 0..n {
            let src = u32::from_le_bytes(
                cache[i * HASH_BYTES..i * HASH_BYTES + 4].try_into().unwrap(),
            ) as usize
                % n;
            let dst = (i + n - 1) % n;
            for j in 0..HASH_BYTES {
                temp[j] = cache[dst * HASH_BYTES + j] ^ cache[src * HASH_BYTES + j];
            }
            let hashed = keccak512(&temp);
            cache[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&hashed);
        }
    }
    cache
}

fn cache_words(cache: &[u8], item: usize) -> [u32; 16] {
    let mut words = [0u32; 16];
    let base = item * HASH_BYTES;
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_le_bytes(cache[base + i * 4..base + i * 4 + 4].try_into().unwrap());
    }
    words
}

/// One 64-byte dataset item derived from the light cache.
fn calc_dataset_item(cache: &[u8], index: u32) -> [u32; 16] {
    let n = cache.len() / HASH_BYTES;
    let r = (HASH_BYTES / WORD_BYTES) as u32; // 16

    let mut mix = cache_words(cache, index as usize % n);
    mix[0] ^= index;

    let mut mix_bytes = [0u8; HASH_BYTES];
    for (i, w) in mix.iter().enumerate() {
        mix_bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    let hashed = keccak512(&mix_bytes);
    for (i, w) in mix.iter_mut().enumerate() {
        *w = u32::from_le_bytes(hashed[i * 4..i * 4 + 4].try_into().unwrap());
    }

    for j in 0..DATASET_PARENTS {
        let parent = fnv(index ^ j, mix[(j % r) as usize]) as usize % n;
        let parent_words = cache_words(cache, parent);
        for (m, p) in mix.iter_mut().zip(parent_words.iter()) {
            *m = fnv(*m, *p);
        }
    }

    for (i, w) in mix.iter().enumerate() {
        mix_bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    let hashed = keccak512(&mix_bytes);
    let mut out = [0u32; 16];
    for (i, w) in out.iter_mut().enumerate() {
        *w = u32::from_le_bytes(hashed[i * 4..i * 4 + 4].try_into().unwrap());
    }
    out
}

/// Hashimoto over the light cache: `(mix_digest, result)`.
fn hashimoto_light(
    full_size: u64,
    cache: &[u8],
    header_hash: &[u8; 32],
    nonce: u64,
) -> ([u8; 32], [u8; 32]) {
    let n = full_size as usize / HASH_BYTES;
    let w = MIX_BYTES / WORD_BYTES; // 32
    let mix_hashes = MIX_BYTES / HASH_BYTES; // 2

    // seed = keccak512(header ++ nonce-little-endian)
    let mut seed_input = [0u8; 40];
    seed_input[..32].copy_from_slice(header_hash);
    seed_input[32..].copy_from_slice(&nonce.to_le_bytes());
    let seed = keccak512(&seed_input);

    let seed_words: Vec<u32> = seed
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let mut mix = [0u32; MIX_BYTES / WORD_BYTES];
    for i in 0..w {
        mix[i] = seed_words[i % 16];
    }

    let rows = (n / mix_hashes) as u32;
    for i in 0..ACCESSES as u32 {
        let p = fnv(i ^ seed_words[0], mix[i as usize % w]) % rows * mix_hashes as u32;
        let mut newdata = [0u32; MIX_BYTES / WORD_BYTES];
        for j in 0..mix_hashes {
            let item = calc_dataset_item(cache, p + j as u32);
            newdata[j * 16..(j + 1) * 16].copy_from_slice(&item);
        }
        for (m, d) in mix.iter_mut().zip(newdata.iter()) {
            *m = fnv(*m, *d);
        }
    }

    // fold the 128-byte mix into the 32-byte digest
    let mut cmix = [0u32; 8];
    for i in 0..8 {
        cmix[i] = fnv(
            fnv(fnv(mix[i * 4], mix[i * 4 + 1]), mix[i * 4 + 2]),
            mix[i * 4 + 3],
        );
    }
    let mut mix_digest = [0u8; 32];
    for (i, wd) in cmix.iter().enumerate() {
        mix_digest[i * 4..i * 4 + 4].copy_from_slice(&wd.to_le_bytes());
    }

    let mut result_input = [0u8; 96];
    result_input[..64].copy_from_slice(&seed);
    result_input[64..].copy_from_slice(&mix_digest);
    let result = keccak256(&result_input);

    (mix_digest, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_and_dataset_sizes_epoch_zero() {
        // known table values
        assert_eq!(cache_size(0), 16_776_896);
        assert_eq!(dataset_size(0), 1_073_739_904);
    }

    #[test]
    fn test_seed_hash_sequence() {
        assert_eq!(seed_hash(0, EPOCH_LENGTH, None), [0u8; 32]);
        let epoch1 = seed_hash(1, EPOCH_LENGTH, None);
        assert_eq!(
            hex::encode(epoch1),
            "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );
        // a doubled ECIP-1099 epoch continues the legacy seed sequence
        assert_eq!(
            seed_hash(1, EPOCH_LENGTH_ECIP1099, None),
            seed_hash(2, EPOCH_LENGTH, None)
        );
    }

    #[test]
    fn test_uip1_seed_schedule_forks_at_activation() {
        // identical to ethash before the activation epoch
        for epoch in [0, 1, 21] {
            assert_eq!(
                seed_hash(epoch, EPOCH_LENGTH, Some(UIP1_EPOCH_UBIQ)),
                seed_hash(epoch, EPOCH_LENGTH, None)
            );
        }
        // the activation epoch hashes once more, later epochs keep diverging
        let ethash_22 = seed_hash(22, EPOCH_LENGTH, None);
        let ubiq_22 = seed_hash(22, EPOCH_LENGTH, Some(UIP1_EPOCH_UBIQ));
        assert_eq!(ubiq_22, keccak256(&ethash_22));
        assert_ne!(
            seed_hash(23, EPOCH_LENGTH, Some(UIP1_EPOCH_UBIQ)),
            seed_hash(23, EPOCH_LENGTH, None)
        );
    }

    #[test]
    fn test_epoch_length_switches_at_fork() {
        let hasher = Etchash::new(Some(ECIP1099_FBLOCK_CLASSIC), None);
        assert_eq!(hasher.epoch_length(ECIP1099_FBLOCK_CLASSIC - 1), 30_000);
        assert_eq!(hasher.epoch_length(ECIP1099_FBLOCK_CLASSIC), 60_000);

        let ubiq = Etchash::new(None, Some(UIP1_EPOCH_UBIQ));
        assert_eq!(ubiq.epoch_length(10_000_000), 30_000);
    }

    #[test]
    fn test_fnv() {
        assert_eq!(fnv(0, 0), 0);
        assert_eq!(fnv(1, 2), FNV_PRIME ^ 2);
    }

    #[test]
    #[ignore = "generates the 16 MiB epoch-0 light cache; slow in debug builds"]
    fn test_known_ethash_vector() {
        // block 22 of the Ethereum proof-of-work test fixtures
        let hasher = Etchash::new(None, None);
        let header =
            crate::util::hex_to_bytes32(
                "0x372eca2454ead349c3df0ab5d00b0b706b23e49d469387db91811cee0358fc6d",
            )
            .unwrap();
        let nonce = u64::from_str_radix("495732e0ed7a801c", 16).unwrap();
        let (mix, result) = hasher.compute(22, &header, nonce);
        assert_eq!(
            hex::encode(mix),
            "2f74cdeb198af0b9abe65d22d372e22fb2d474371774a9583c1cc427a07939f5"
        );
        assert_eq!(
            hex::encode(result),
            "00000b184f1fdd88bfd94c86c39e65db0c36144d5e43f745f722196e730cb614"
        );
    }
}
