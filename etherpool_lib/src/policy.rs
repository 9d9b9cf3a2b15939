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

//! Per-IP rate and abuse policy.
//!
//! Counters are atomics; the valid/invalid share pair is a compound
//! read-modify-write and sits behind its own small mutex. The stats map has
//! a distinct lock. Bans fan out through a bounded channel to workers that
//! invoke the OS firewall.

use crate::config::PolicyConfig;
use crate::store::Store;
use crate::supervisor::RoutineGroup;
use crate::util::make_timestamp_ms;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Capacity of the ban dispatch channel.
const BAN_CHAN_SIZE: usize = 64;

#[derive(Default)]
struct ShareCounts {
    valid: i32,
    invalid: i32,
}

pub struct Stats {
    last_beat: AtomicI64,
    banned_at: AtomicI64,
    malformed: AtomicI32,
    conn_limit: AtomicI32,
    banned: AtomicI32,
    shares: Mutex<ShareCounts>,
}

impl Stats {
    fn new(conn_limit: i32) -> Self {
        let stats = Self {
            last_beat: AtomicI64::new(0),
            banned_at: AtomicI64::new(0),
            malformed: AtomicI32::new(0),
            conn_limit: AtomicI32::new(conn_limit),
            banned: AtomicI32::new(0),
            shares: Mutex::new(ShareCounts::default()),
        };
        stats.heartbeat();
        stats
    }

    fn heartbeat(&self) {
        self.last_beat.store(make_timestamp_ms(), Ordering::SeqCst);
    }

    fn incr_malformed(&self) -> i32 {
        self.malformed.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn incr_limit(&self, n: i32) {
        self.conn_limit.fetch_add(n, Ordering::SeqCst);
    }

    fn decr_limit(&self) -> i32 {
        self.conn_limit.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::SeqCst) > 0
    }
}

pub struct PolicyServer {
    config: PolicyConfig,
    stats: Mutex<HashMap<String, Arc<Stats>>>,
    blacklist: RwLock<Vec<String>>,
    whitelist: RwLock<Vec<String>>,
    ban_tx: mpsc::Sender<String>,
    ban_rx: Mutex<Option<mpsc::Receiver<String>>>,
    started_at: i64,
    grace_ms: i64,
    reset_timeout_ms: i64,
}

impl PolicyServer {
    pub fn new(config: PolicyConfig) -> Arc<Self> {
        let (ban_tx, ban_rx) = mpsc::channel(BAN_CHAN_SIZE);
        Arc::new(Self {
            grace_ms: config.limits.grace.as_millis() as i64,
            reset_timeout_ms: config.reset_interval.as_millis() as i64,
            config,
            stats: Mutex::new(HashMap::new()),
            blacklist: RwLock::new(Vec::new()),
            whitelist: RwLock::new(Vec::new()),
            ban_tx,
            ban_rx: Mutex::new(Some(ban_rx)),
            started_at: make_timestamp_ms(),
        })
    }

    /// Spawn the reset/refresh loop and the ban workers.
    pub async fn start(self: &Arc<Self>, store: Store, group: &RoutineGroup) {
        self.refresh_state(&store).await;

        let server = self.clone();
        let refresh_store = store.clone();
        let token = group.token();
        info!(
            "Set policy stats reset every {:?}, state refresh every {:?}",
            self.config.reset_interval, self.config.refresh_interval
        );
        group
            .go_recover(move || {
                let server = server.clone();
                let store = refresh_store.clone();
                let token = token.clone();
                async move {
                    let mut reset = tokio::time::interval(server.config.reset_interval);
                    let mut refresh = tokio::time::interval(server.config.refresh_interval);
                    reset.tick().await;
                    refresh.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => {
                                info!("Stopping policy state refresh");
                                return;
                            }
                            _ = reset.tick() => server.reset_stats(),
                            _ = refresh.tick() => server.refresh_state(&store).await,
                        }
                    }
                }
            })
            .await;

        let ban_rx = self.ban_rx.lock().take();
        if let Some(ban_rx) = ban_rx {
            let ban_rx = Arc::new(tokio::sync::Mutex::new(ban_rx));
            for id in 0..self.config.workers {
                let server = self.clone();
                let ban_rx = ban_rx.clone();
                let token = group.token();
                group
                    .go_recover(move || {
                        let server = server.clone();
                        let ban_rx = ban_rx.clone();
                        let token = token.clone();
                        async move {
                            loop {
                                let ip = {
                                    let mut rx = ban_rx.lock().await;
                                    tokio::select! {
                                        _ = token.cancelled() => {
                                            info!("Stopping ban worker, id: {}", id);
                                            return;
                                        }
                                        ip = rx.recv() => ip,
                                    }
                                };
                                match ip {
                                    Some(ip) => server.do_ban(&ip).await,
                                    None => return,
                                }
                            }
                        }
                    })
                    .await;
            }
            info!("Running with {} policy workers", self.config.workers);
        }
    }

    fn get(&self, ip: &str) -> Arc<Stats> {
        let mut stats = self.stats.lock();
        match stats.get(ip) {
            Some(entry) => {
                entry.heartbeat();
                entry.clone()
            }
            None => {
                let entry = Arc::new(Stats::new(self.config.limits.limit));
                stats.insert(ip.to_string(), entry.clone());
                entry
            }
        }
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.get(ip).is_banned()
    }

    pub fn ban_client(&self, ip: &str) {
        let stats = self.get(ip);
        self.force_ban(&stats, ip);
    }

    /// Blacklisted logins get their IP banned outright.
    pub fn apply_login_policy(&self, login: &str, ip: &str) -> bool {
        if self.in_blacklist(login) {
            let stats = self.get(ip);
            self.force_ban(&stats, ip);
            return false;
        }
        true
    }

    pub fn apply_malformed_policy(&self, ip: &str) -> bool {
        let stats = self.get(ip);
        let n = stats.incr_malformed();
        if n >= self.config.banning.malformed_limit {
            self.force_ban(&stats, ip);
            return false;
        }
        true
    }

    /// Per-request connection allowance, active after the startup grace
    /// period.
    pub fn apply_limit_policy(&self, ip: &str) -> bool {
        if !self.config.limits.enabled {
            return true;
        }
        if make_timestamp_ms() - self.started_at > self.grace_ms {
            return self.get(ip).decr_limit() > 0;
        }
        true
    }

    /// Track a share verdict; after a full sample the invalid ratio decides
    /// a ban. Valid shares credit the connection allowance back.
    pub fn apply_share_policy(&self, ip: &str, valid_share: bool) -> bool {
        let stats = self.get(ip);
        let ratio = {
            let mut shares = stats.shares.lock();
            if valid_share {
                shares.valid += 1;
                if self.config.limits.enabled {
                    stats.incr_limit(self.config.limits.limit_jump);
                }
            } else {
                shares.invalid += 1;
            }
            if shares.valid + shares.invalid < self.config.banning.check_threshold {
                return true;
            }
            let ratio = shares.invalid as f32 / shares.valid.max(1) as f32;
            shares.valid = 0;
            shares.invalid = 0;
            ratio
        };
        if ratio >= self.config.banning.invalid_percent / 100.0 {
            self.force_ban(&stats, ip);
            return false;
        }
        true
    }

    fn force_ban(&self, stats: &Stats, ip: &str) {
        if !self.config.banning.enabled || self.in_whitelist(ip) {
            return;
        }
        stats.banned_at.store(make_timestamp_ms(), Ordering::SeqCst);

        if stats
            .banned
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if self.config.banning.ipset.is_empty() {
                info!("Banned peer {}", ip);
            } else if let Err(e) = self.ban_tx.try_send(ip.to_string()) {
                error!("Ban channel is full, dropping ban for {}: {}", ip, e);
            }
        }
    }

    /// Drop expired bans and evict idle stats entries.
    fn reset_stats(&self) {
        let now = make_timestamp_ms();
        let banning_timeout = self.config.banning.timeout * 1000;
        let mut total = 0;
        let mut stats = self.stats.lock();
        stats.retain(|key, entry| {
            let last_beat = entry.last_beat.load(Ordering::SeqCst);
            let banned_at = entry.banned_at.load(Ordering::SeqCst);
            if entry.is_banned() && now - banned_at >= banning_timeout {
                entry.banned_at.store(0, Ordering::SeqCst);
                if entry
                    .banned
                    .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    info!("Ban dropped for {}", key);
                    total += 1;
                    return false;
                }
            }
            if now - last_beat >= self.reset_timeout_ms {
                total += 1;
                return false;
            }
            true
        });
        info!("Flushed stats for {} IP addresses", total);
    }

    async fn refresh_state(&self, store: &Store) {
        match store.get_blacklist().await {
            Ok(blacklist) => *self.blacklist.write() = blacklist,
            Err(e) => error!("Failed to get blacklist from backend: {}", e),
        }
        match store.get_whitelist().await {
            Ok(whitelist) => *self.whitelist.write() = whitelist,
            Err(e) => error!("Failed to get whitelist from backend: {}", e),
        }
        info!("Policy state refresh complete");
    }

    fn in_blacklist(&self, login: &str) -> bool {
        self.blacklist.read().iter().any(|a| a == login)
    }

    fn in_whitelist(&self, ip: &str) -> bool {
        self.whitelist.read().iter().any(|a| a == ip)
    }

    async fn do_ban(&self, ip: &str) {
        let set = &self.config.banning.ipset;
        let timeout = self.config.banning.timeout;
        info!("Banned {} with timeout {} on ipset {}", ip, timeout, set);

        let output = tokio::process::Command::new("sudo")
            .args(["ipset", "add", set, ip, "timeout", &timeout.to_string(), "-!"])
            .output()
            .await;
        if let Err(e) = output {
            error!("CMD Error: {}", e);
        }
    }

    #[cfg(test)]
    fn take_ban_rx(&self) -> mpsc::Receiver<String> {
        self.ban_rx.lock().take().expect("ban channel already taken")
    }

    #[cfg(test)]
    fn set_whitelist(&self, list: Vec<String>) {
        *self.whitelist.write() = list;
    }

    #[cfg(test)]
    fn set_blacklist(&self, list: Vec<String>) {
        *self.blacklist.write() = list;
    }
}
