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

//! Redis-backed durable state.
//!
//! Keys live under a `{coin}:` prefix. Round shares accumulate in
//! `shares:roundCurrent` until a block is found, at which point the hash is
//! renamed to `shares:round{height}:{nonce}` and a candidate row enters the
//! `blocks:candidates` zset. The unlocker moves rows through
//! `blocks:immature` into `blocks:matured`, crediting `miners:{login}`
//! hashes. Multi-step mutations run in MULTI/EXEC pipelines.

use crate::config::StoreConfig;
use crate::util::{make_timestamp_ms, now_unix_secs};
use num_bigint::BigUint;
use num_traits::Zero;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt row: {0}")]
    Parse(String),
    #[error("payouts are locked")]
    Locked,
}

/// One found-block row through its candidate → immature → matured life.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockData {
    /// Pool's view of the height at discovery; the round identifier
    pub round_height: u64,
    /// Actual chain height, filled in at unlock time
    pub height: u64,
    pub nonce: String,
    pub pow_hash: String,
    pub mix_digest: String,
    pub timestamp: u64,
    /// Block difficulty at discovery
    pub difficulty: u64,
    pub total_shares: u64,
    pub uncle_height: u64,
    pub orphan: bool,
    /// Block or uncle hash once resolved
    pub hash: String,
    /// Reward in wei, computed at unlock time
    pub reward: BigUint,
    /// TX fees kept by the pool when keepTxFees is set
    pub extra_reward: BigUint,
    /// Original zset members, kept for ZREM
    pub candidate_key: String,
    pub immature_key: String,
}

const NO_HASH: &str = "0x0";

impl BlockData {
    pub fn round_key(&self) -> String {
        format!("{}:{}", self.round_height, self.nonce)
    }

    fn candidate_member(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.nonce,
            self.pow_hash,
            self.mix_digest,
            self.timestamp,
            self.difficulty,
            self.total_shares
        )
    }

    fn immature_member(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.height,
            self.nonce,
            self.pow_hash,
            self.mix_digest,
            self.timestamp,
            self.difficulty,
            self.total_shares,
            self.uncle_height,
            self.orphan as u8,
            if self.hash.is_empty() { NO_HASH } else { &self.hash },
        )
    }

    fn matured_member(&self) -> String {
        format!("{}:{}", self.immature_member(), self.reward)
    }

    fn from_candidate(member: &str, score: u64) -> Result<Self, StoreError> {
        let fields: Vec<&str> = member.split(':').collect();
        if fields.len() != 6 {
            return Err(StoreError::Parse(format!("candidate row {member:?}")));
        }
        let parse = |s: &str| -> Result<u64, StoreError> {
            s.parse()
                .map_err(|_| StoreError::Parse(format!("candidate row {member:?}")))
        };
        Ok(Self {
            round_height: score,
            height: score,
            nonce: fields[0].to_string(),
            pow_hash: fields[1].to_string(),
            mix_digest: fields[2].to_string(),
            timestamp: parse(fields[3])?,
            difficulty: parse(fields[4])?,
            total_shares: parse(fields[5])?,
            candidate_key: member.to_string(),
            ..Default::default()
        })
    }

    fn from_immature(member: &str, score: u64) -> Result<Self, StoreError> {
        let fields: Vec<&str> = member.split(':').collect();
        if fields.len() != 10 {
            return Err(StoreError::Parse(format!("immature row {member:?}")));
        }
        let parse = |s: &str| -> Result<u64, StoreError> {
            s.parse()
                .map_err(|_| StoreError::Parse(format!("immature row {member:?}")))
        };
        Ok(Self {
            round_height: score,
            height: parse(fields[0])?,
            nonce: fields[1].to_string(),
            pow_hash: fields[2].to_string(),
            mix_digest: fields[3].to_string(),
            timestamp: parse(fields[4])?,
            difficulty: parse(fields[5])?,
            total_shares: parse(fields[6])?,
            uncle_height: parse(fields[7])?,
            orphan: fields[8] == "1",
            hash: if fields[9] == NO_HASH {
                String::new()
            } else {
                fields[9].to_string()
            },
            immature_key: member.to_string(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayment {
    pub address: String,
    /// Shannon
    pub amount: i64,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
    prefix: String,
}

impl Store {
    pub async fn new(cfg: &StoreConfig, coin: &str) -> Result<Self, StoreError> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}/{}", cfg.endpoint, cfg.database)
        } else {
            format!("redis://:{}@{}/{}", cfg.password, cfg.endpoint, cfg.database)
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: coin.to_string(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    pub async fn check(&self) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong)
    }

    pub async fn bg_save(&self) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("BGSAVE").query_async(&mut conn).await?;
        Ok(reply)
    }

    pub async fn write_node_state(
        &self,
        name: &str,
        height: u64,
        difficulty: &BigUint,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let now = now_unix_secs();
        let _: () = conn
            .hset_multiple(
                self.key("nodes"),
                &[
                    (format!("{name}:name"), name.to_string()),
                    (format!("{name}:height"), height.to_string()),
                    (format!("{name}:difficulty"), difficulty.to_string()),
                    (format!("{name}:lastBeat"), now.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Record a valid share. Returns true when the share is a duplicate.
    pub async fn write_share(
        &self,
        login: &str,
        worker: &str,
        params: &[String],
        share_diff: u64,
        round_height: u64,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        if self.is_duplicate(&mut conn, params, window).await? {
            return Ok(true);
        }
        let ms = make_timestamp_ms();
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.push_share_cmds(&mut pipe, login, worker, params, share_diff, round_height, ms, window);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(false)
    }

    /// Record a block candidate: closes the current round and snapshots it
    /// under the round key. Returns true when the block is a duplicate.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_block(
        &self,
        login: &str,
        worker: &str,
        params: &[String],
        share_diff: u64,
        block_diff: u64,
        round_height: u64,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        if self.is_duplicate(&mut conn, params, window).await? {
            return Ok(true);
        }

        let current: HashMap<String, u64> =
            conn.hgetall(self.key("shares:roundCurrent")).await?;
        let total_shares: u64 = current.values().sum::<u64>() + share_diff;

        let ms = make_timestamp_ms();
        let block = BlockData {
            round_height,
            height: round_height,
            nonce: params[0].clone(),
            pow_hash: params[1].clone(),
            mix_digest: params[2].clone(),
            timestamp: (ms / 1000) as u64,
            difficulty: block_diff,
            total_shares,
            ..Default::default()
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        self.push_share_cmds(&mut pipe, login, worker, params, share_diff, round_height, ms, window);
        pipe.cmd("RENAME")
            .arg(self.key("shares:roundCurrent"))
            .arg(self.key(&format!("shares:round{}:{}", round_height, params[0])))
            .ignore();
        pipe.zadd(
            self.key("blocks:candidates"),
            block.candidate_member(),
            round_height,
        )
        .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(false)
    }

    async fn is_duplicate(
        &self,
        conn: &mut ConnectionManager,
        params: &[String],
        window: Duration,
    ) -> Result<bool, StoreError> {
        let seen_key = self.key("shares:seen");
        let member = format!("{}:{}", params[0], params[1]);
        let added: i64 = conn.sadd(&seen_key, member).await?;
        if added == 0 {
            return Ok(true);
        }
        let _: () = conn.expire(&seen_key, window.as_secs() as i64).await?;
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_share_cmds(
        &self,
        pipe: &mut redis::Pipeline,
        login: &str,
        worker: &str,
        params: &[String],
        share_diff: u64,
        round_height: u64,
        ms: i64,
        window: Duration,
    ) {
        let hashrate_member = format!(
            "{}:{}:{}:{}:{}:{}",
            share_diff, round_height, params[0], login, worker, ms
        );
        pipe.hincr(self.key("shares:roundCurrent"), login, share_diff)
            .ignore();
        pipe.zadd(self.key("hashrate"), &hashrate_member, ms).ignore();
        pipe.zadd(
            self.key(&format!("hashrate:{login}")),
            &hashrate_member,
            ms,
        )
        .ignore();
        pipe.expire(
            self.key(&format!("hashrate:{login}")),
            window.as_secs() as i64,
        )
        .ignore();
    }

    pub async fn get_candidates(&self, max_height: u64) -> Result<Vec<BlockData>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(self.key("blocks:candidates"), "-inf", max_height)
            .await?;
        rows.iter()
            .map(|(member, score)| BlockData::from_candidate(member, *score as u64))
            .collect()
    }

    pub async fn get_immature_blocks(
        &self,
        max_height: u64,
    ) -> Result<Vec<BlockData>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(self.key("blocks:immature"), "-inf", max_height)
            .await?;
        rows.iter()
            .map(|(member, score)| BlockData::from_immature(member, *score as u64))
            .collect()
    }

    /// Pass-A orphans: moved out of candidates into the immature set with
    /// the orphan flag raised, so the mature pass gets a second look at
    /// them before they are finalized.
    pub async fn write_pending_orphans(
        &self,
        blocks: &[BlockData],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        for block in blocks {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.zrem(self.key("blocks:candidates"), &block.candidate_key)
                .ignore();
            pipe.zadd(
                self.key("blocks:immature"),
                block.immature_member(),
                block.round_height,
            )
            .ignore();
            let _: () = pipe.query_async(&mut conn).await?;
        }
        Ok(())
    }

    /// Keyed by round, which is stable even if a later pass re-matches the
    /// block at a different height or hash.
    fn immature_credits_key(&self, block: &BlockData) -> String {
        self.key(&format!("credits:immature:{}", block.round_key()))
    }

    /// Move a matched candidate into the immature set and credit the round
    /// rewards as immature balances. The credits are remembered so they can
    /// be reversed when the block matures or orphans.
    pub async fn write_immature_block(
        &self,
        block: &BlockData,
        rewards: &HashMap<String, i64>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(self.key("blocks:candidates"), &block.candidate_key)
            .ignore();
        pipe.zadd(
            self.key("blocks:immature"),
            block.immature_member(),
            block.round_height,
        )
        .ignore();
        for (login, amount) in rewards {
            pipe.hincr(self.key(&format!("miners:{login}")), "immature", *amount)
                .ignore();
            pipe.hset(self.immature_credits_key(block), login, *amount)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Final credit: reverse the immature amounts and add the final rewards
    /// to spendable balances.
    pub async fn write_matured_block(
        &self,
        block: &BlockData,
        rewards: &HashMap<String, i64>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let credits: HashMap<String, i64> =
            conn.hgetall(self.immature_credits_key(block)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(self.key("blocks:immature"), &block.immature_key)
            .ignore();
        pipe.zadd(
            self.key("blocks:matured"),
            block.matured_member(),
            block.round_height,
        )
        .ignore();
        for (login, amount) in &credits {
            pipe.hincr(self.key(&format!("miners:{login}")), "immature", -*amount)
                .ignore();
        }
        pipe.del(self.immature_credits_key(block)).ignore();
        for (login, amount) in rewards {
            pipe.hincr(self.key(&format!("miners:{login}")), "balance", *amount)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Finalize an orphan: reverse any immature credits and merge the
    /// round's shares back into the current round.
    pub async fn write_orphan(&self, block: &BlockData) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let credits: HashMap<String, i64> =
            conn.hgetall(self.immature_credits_key(block)).await?;
        let round_shares_key = self.key(&format!("shares:round{}", block.round_key()));
        let shares: HashMap<String, u64> = conn.hgetall(&round_shares_key).await?;

        let mut orphaned = block.clone();
        orphaned.orphan = true;
        orphaned.reward = BigUint::zero();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(self.key("blocks:immature"), &block.immature_key)
            .ignore();
        pipe.zadd(
            self.key("blocks:matured"),
            orphaned.matured_member(),
            block.round_height,
        )
        .ignore();
        for (login, amount) in &credits {
            pipe.hincr(self.key(&format!("miners:{login}")), "immature", -*amount)
                .ignore();
        }
        pipe.del(self.immature_credits_key(block)).ignore();
        for (login, n) in &shares {
            pipe.hincr(self.key("shares:roundCurrent"), login, *n).ignore();
        }
        pipe.del(&round_shares_key).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_round_shares(
        &self,
        round_height: u64,
        nonce: &str,
    ) -> Result<(HashMap<String, u64>, u64), StoreError> {
        let mut conn = self.conn.clone();
        let shares: HashMap<String, u64> = conn
            .hgetall(self.key(&format!("shares:round{round_height}:{nonce}")))
            .await?;
        let total = shares.values().sum();
        Ok((shares, total))
    }

    pub async fn get_balance(&self, login: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let balance: Option<i64> = conn
            .hget(self.key(&format!("miners:{login}")), "balance")
            .await?;
        Ok(balance.unwrap_or(0))
    }

    /// Every login with a miners hash, regardless of balance; the payout
    /// pass applies the threshold.
    pub async fn get_payees(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = self.key("miners:*");
        let stripped = self.key("miners:");
        let mut payees = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await?;
            for key in keys {
                if let Some(login) = key.strip_prefix(&stripped) {
                    payees.push(login.to_string());
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(payees)
    }

    /// Debit a balance ahead of a payment; the amount moves to pending and
    /// the payment is recorded as outstanding.
    pub async fn update_balance(&self, login: &str, amount: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hincr(self.key(&format!("miners:{login}")), "balance", -amount)
            .ignore();
        pipe.hincr(self.key(&format!("miners:{login}")), "pending", amount)
            .ignore();
        pipe.zadd(
            self.key("payments:pending"),
            format!("{login}:{amount}"),
            now_unix_secs(),
        )
        .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Reverse of a prior debit of the identical amount.
    pub async fn rollback_balance(&self, login: &str, amount: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hincr(self.key(&format!("miners:{login}")), "balance", amount)
            .ignore();
        pipe.hincr(self.key(&format!("miners:{login}")), "pending", -amount)
            .ignore();
        pipe.zrem(self.key("payments:pending"), format!("{login}:{amount}"))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Record the mined payment and clear the outstanding state.
    pub async fn write_payment(
        &self,
        login: &str,
        tx_hash: &str,
        amount: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let ts = now_unix_secs();
        let record = format!("{tx_hash}:{amount}:{ts}");
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hincr(self.key(&format!("miners:{login}")), "pending", -amount)
            .ignore();
        pipe.hincr(self.key(&format!("miners:{login}")), "paid", amount)
            .ignore();
        pipe.zrem(self.key("payments:pending"), format!("{login}:{amount}"))
            .ignore();
        pipe.del(self.key("payments:lock")).ignore();
        pipe.lpush(self.key("payments:all"), &record).ignore();
        pipe.lpush(self.key(&format!("payments:{login}")), &record)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_pending_payments(&self) -> Result<Vec<PendingPayment>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = conn
            .zrange_withscores(self.key("payments:pending"), 0, -1)
            .await?;
        rows.iter()
            .map(|(member, score)| {
                let (address, amount) = member
                    .rsplit_once(':')
                    .ok_or_else(|| StoreError::Parse(format!("pending payment {member:?}")))?;
                Ok(PendingPayment {
                    address: address.to_string(),
                    amount: amount
                        .parse()
                        .map_err(|_| StoreError::Parse(format!("pending payment {member:?}")))?,
                    timestamp: *score as i64,
                })
            })
            .collect()
    }

    pub async fn lock_payouts(&self, login: &str, amount: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let acquired: bool = conn
            .set_nx(self.key("payments:lock"), format!("{login}:{amount}"))
            .await?;
        if !acquired {
            return Err(StoreError::Locked);
        }
        Ok(())
    }

    pub async fn is_payouts_locked(&self) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.key("payments:lock")).await?;
        Ok(exists)
    }

    pub async fn unlock_payouts(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key("payments:lock")).await?;
        Ok(())
    }

    pub async fn get_blacklist(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.key("blacklist")).await?)
    }

    pub async fn get_whitelist(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.key("whitelist")).await?)
    }

    #[cfg(test)]
    pub(crate) async fn flush_db(&self) {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    }
}
