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

//! The mining proxy: work dispatch, share intake over HTTP JSON-RPC and
//! Stratum, upstream failover.

pub mod miner;
pub mod server;
pub mod stratum;
pub mod template;

use crate::config::Config;
use crate::hasher::PowHasher;
use crate::policy::PolicyServer;
use crate::store::Store;
use crate::supervisor::RoutineGroup;
use crate::util::{get_target_hex, hex_to_u64};
use gethrpc::GethRpcClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use stratum::Session;
use template::BlockTemplate;
use tracing::{error, info};

pub struct ProxyServer {
    pub(crate) config: Arc<Config>,
    pub(crate) backend: Store,
    pub(crate) policy: Arc<PolicyServer>,
    pub(crate) hasher: Arc<dyn PowHasher>,
    upstreams: Vec<GethRpcClient>,
    upstream: AtomicUsize,
    template: RwLock<Option<Arc<BlockTemplate>>>,
    /// Share target hex served to getWork clients
    pub(crate) diff_hex: String,
    fails_count: AtomicI64,
    job_counter: AtomicU64,
    pub(crate) sessions: tokio::sync::RwLock<HashMap<u64, Arc<Session>>>,
}

impl ProxyServer {
    pub fn new(
        config: Arc<Config>,
        backend: Store,
        policy: Arc<PolicyServer>,
        hasher: Arc<dyn PowHasher>,
    ) -> Result<Arc<Self>, gethrpc::RpcError> {
        let mut upstreams = Vec::with_capacity(config.upstream.len());
        for u in &config.upstream {
            upstreams.push(GethRpcClient::new(&u.name, &u.url, u.timeout)?);
            info!("Upstream: {} => {}", u.name, u.url);
        }

        let proxy = Arc::new(Self {
            diff_hex: get_target_hex(config.proxy.difficulty),
            backend,
            policy,
            hasher,
            upstreams,
            upstream: AtomicUsize::new(0),
            template: RwLock::new(None),
            fails_count: AtomicI64::new(0),
            job_counter: AtomicU64::new(1),
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            config,
        });
        info!("Default upstream: {}", proxy.rpc().name);
        Ok(proxy)
    }

    pub(crate) fn rpc(&self) -> &GethRpcClient {
        &self.upstreams[self.upstream.load(Ordering::SeqCst)]
    }

    pub fn current_block_template(&self) -> Option<Arc<BlockTemplate>> {
        self.template.read().expect("template lock poisoned").clone()
    }

    /// Refresh work from the current upstream and publish the new template
    /// when the header moved.
    pub async fn fetch_block_template(&self) {
        let work = match self.rpc().get_work().await {
            Ok(work) if work.len() >= 3 => work,
            Ok(work) => {
                error!("Malformed eth_getWork reply of {} items", work.len());
                self.mark_sick();
                return;
            }
            Err(e) => {
                error!("Error while refreshing block template: {}", e);
                self.mark_sick();
                return;
            }
        };

        let current = self.current_block_template();
        if let Some(current) = &current {
            if current.header.eq_ignore_ascii_case(&work[0]) {
                return;
            }
        }

        let height = match work.get(3).and_then(|h| hex_to_u64(h)) {
            Some(height) => height,
            None => match self.rpc().block_number().await {
                Ok(n) => n + 1,
                Err(e) => {
                    error!("Error while fetching pending height: {}", e);
                    self.mark_sick();
                    return;
                }
            },
        };

        let template = Arc::new(BlockTemplate::next(
            current.as_deref(),
            work[0].clone(),
            work[1].clone(),
            work[2].clone(),
            height,
        ));
        info!(
            "New block to mine on {} at height {} / {}",
            self.rpc().name,
            template.height,
            &template.header[..10.min(template.header.len())]
        );
        *self.template.write().expect("template lock poisoned") = Some(template.clone());
        self.mark_ok();

        self.broadcast_job(&template).await;
    }

    /// Select the first healthy upstream, in declared order.
    pub async fn check_upstreams(&self) {
        let mut candidate = 0usize;
        for (i, upstream) in self.upstreams.iter().enumerate() {
            if upstream.check().await {
                candidate = i;
                break;
            }
        }
        if self.upstream.load(Ordering::SeqCst) != candidate {
            info!("Switching to upstream {}", self.upstreams[candidate].name);
            self.upstream.store(candidate, Ordering::SeqCst);
        }
    }

    pub(crate) fn next_job_id(&self) -> String {
        format!("{:x}", self.job_counter.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn mark_sick(&self) {
        self.fails_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_ok(&self) {
        self.fails_count.store(0, Ordering::SeqCst);
    }

    pub fn is_sick(&self) -> bool {
        let fails = self.fails_count.load(Ordering::SeqCst);
        self.config.proxy.health_check && fails >= self.config.proxy.max_fails
    }

    /// Spawn the proxy's long-running loops: template refresh, upstream
    /// probing, node-state updates, the HTTP endpoint and the Stratum
    /// listener.
    pub async fn start(self: &Arc<Self>, group: &Arc<RoutineGroup>) {
        self.fetch_block_template().await;

        let refresh_interval = self.config.proxy.block_refresh_interval;
        info!("Set block refresh every {:?}", refresh_interval);
        let proxy = self.clone();
        let token = group.token();
        group
            .go_recover(move || {
                let proxy = proxy.clone();
                let token = token.clone();
                async move {
                    let mut timer = tokio::time::interval(refresh_interval);
                    timer.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => {
                                info!("Stopping block template refresh");
                                return;
                            }
                            _ = timer.tick() => proxy.fetch_block_template().await,
                        }
                    }
                }
            })
            .await;

        let check_interval = self.config.upstream_check_interval;
        let proxy = self.clone();
        let token = group.token();
        group
            .go_recover(move || {
                let proxy = proxy.clone();
                let token = token.clone();
                async move {
                    let mut timer = tokio::time::interval(check_interval);
                    timer.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => {
                                info!("Stopping upstream check");
                                return;
                            }
                            _ = timer.tick() => proxy.check_upstreams().await,
                        }
                    }
                }
            })
            .await;

        let state_interval = self.config.proxy.state_update_interval;
        let proxy = self.clone();
        let token = group.token();
        group
            .go_recover(move || {
                let proxy = proxy.clone();
                let token = token.clone();
                async move {
                    let mut timer = tokio::time::interval(state_interval);
                    timer.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => {
                                info!("Stopping node state updates");
                                return;
                            }
                            _ = timer.tick() => {
                                if let Some(t) = proxy.current_block_template() {
                                    match proxy
                                        .backend
                                        .write_node_state(&proxy.config.name, t.height, &t.difficulty)
                                        .await
                                    {
                                        Ok(()) => proxy.mark_ok(),
                                        Err(e) => {
                                            error!("Failed to write node state to backend: {}", e);
                                            proxy.mark_sick();
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            })
            .await;

        server::start_http(self.clone(), group).await;

        if self.config.proxy.stratum.enabled {
            stratum::start_tcp(self.clone(), group).await;
        }
    }
}
