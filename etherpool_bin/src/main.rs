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

use clap::Parser;
use etherpool_lib::config::Config;
use etherpool_lib::hasher::{Etchash, PowHasher};
use etherpool_lib::logging::setup_logging;
use etherpool_lib::payouts::PayoutsProcessor;
use etherpool_lib::policy::PolicyServer;
use etherpool_lib::proxy::ProxyServer;
use etherpool_lib::store::Store;
use etherpool_lib::supervisor::RoutineGroup;
use etherpool_lib::unlocker::BlockUnlocker;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ethash-family mining pool server", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(default_value = "./config.json")]
    config: String,
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load config {}: {}", args.config, e);
            exit(1);
        }
    };

    let _log_guards = match setup_logging(&config.logger, config.runlevel) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            exit(1);
        }
    };
    info!("Loading config complete: instance {}", config.name);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.threads > 0 {
        builder.worker_threads(config.threads);
        info!("Running with {} threads", config.threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build runtime: {e}");
            exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("{}", e);
        exit(1);
    }
}

async fn run(config: Arc<Config>) -> Result<(), String> {
    let backend = Store::new(&config.redis, &config.coin)
        .await
        .map_err(|e| format!("Can't establish connection to backend: {e}"))?;
    match backend.check().await {
        Ok(pong) => info!("Backend check reply: {}", pong),
        Err(e) => return Err(format!("Can't establish connection to backend: {e}")),
    }

    let group = RoutineGroup::new(config.max_routine);

    if config.proxy.enabled {
        let policy = PolicyServer::new(config.proxy.policy.clone());
        policy.start(backend.clone(), &group).await;

        let hasher: Arc<dyn PowHasher> = Arc::new(Etchash::for_network(config.network));
        let proxy = ProxyServer::new(config.clone(), backend.clone(), policy, hasher)
            .map_err(|e| format!("Failed to build proxy: {e}"))?;
        proxy.start(&group).await;
    }

    if config.unlocker.enabled {
        let unlocker = BlockUnlocker::new(&config.unlocker, config.network, backend.clone())
            .map_err(|e| format!("Failed to build unlocker: {e}"))?;
        unlocker.start(&group).await;
    }

    if config.payouts.enabled {
        let payouts = PayoutsProcessor::new(&config.payouts, backend.clone())
            .map_err(|e| format!("Failed to build payouts: {e}"))?;
        payouts.start(&group).await;
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for shutdown signal: {e}"))?;
    info!("Shutdown signal received, stopping workers");
    group.cancel();
    group.wait().await;
    info!("All workers stopped, bye");
    Ok(())
}
