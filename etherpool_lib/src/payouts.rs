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

//! Payout processor.
//!
//! Strictly one payment in flight: debit, send, wait for the receipt, move
//! on. Any failure after a debit halts the module; the operator restarts
//! with RESOLVE_PAYOUT=1 to roll the pending debits back. Accounting is
//! fail-closed by design: nothing here retries a payment on its own.

use crate::config::PayoutsConfig;
use crate::store::{PendingPayment, Store};
use crate::supervisor::RoutineGroup;
use crate::util::{hex_to_biguint, shannon};
use gethrpc::GethRpcClient;
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TX_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Set to "1" to roll back pending payments instead of paying.
const RESOLVE_PAYOUT_ENV: &str = "RESOLVE_PAYOUT";

pub struct PayoutsProcessor {
    config: PayoutsConfig,
    backend: Store,
    rpc: GethRpcClient,
    halt: AtomicBool,
    last_fail: Mutex<Option<String>>,
}

impl PayoutsProcessor {
    pub fn new(config: &PayoutsConfig, backend: Store) -> Result<Arc<Self>, gethrpc::RpcError> {
        let rpc = GethRpcClient::new("PayoutsProcessor", &config.daemon, config.timeout)?;
        Ok(Arc::new(Self {
            config: config.clone(),
            backend,
            rpc,
            halt: AtomicBool::new(false),
            last_fail: Mutex::new(None),
        }))
    }

    pub async fn start(self: &Arc<Self>, group: &Arc<RoutineGroup>) {
        info!("Starting payouts");

        if must_resolve_payout() {
            warn!("Running with env RESOLVE_PAYOUT=1, now trying to resolve locked payouts");
            self.resolve_payouts().await;
            error!("Now you have to restart payouts module with RESOLVE_PAYOUT=0 for normal run");
            return;
        }

        match self.backend.get_pending_payments().await {
            Ok(payments) if !payments.is_empty() => {
                error!(
                    "Previous payout failed, you have to resolve it. List of failed payments:\n{}",
                    format_pending_payments(&payments)
                );
                return;
            }
            Err(e) => {
                error!("Unable to start payouts: {}", e);
                return;
            }
            _ => {}
        }

        match self.backend.is_payouts_locked().await {
            Ok(true) => {
                info!("Unable to start payouts because they are locked");
                return;
            }
            Err(e) => {
                error!("Unable to start payouts: {}", e);
                return;
            }
            _ => {}
        }

        let interval = self.config.interval;
        info!("Set payouts interval to {:?}", interval);

        // Immediately process payouts after start
        self.process().await;

        let processor = self.clone();
        let token = group.token();
        group
            .go_recover(move || {
                let processor = processor.clone();
                let token = token.clone();
                async move {
                    let mut timer = tokio::time::interval(interval);
                    timer.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => {
                                info!("Stopping payouts working module");
                                return;
                            }
                            _ = timer.tick() => processor.process().await,
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

    pub async fn process(&self) {
        if self.halt.load(Ordering::SeqCst) {
            error!(
                "Payments suspended due to last critical error: {:?}",
                self.last_fail.lock().as_deref().unwrap_or("unknown")
            );
            return;
        }

        let mut must_pay = 0;
        let mut miners_paid = 0;
        let mut total_amount: i64 = 0;

        let payees = match self.backend.get_payees().await {
            Ok(payees) => payees,
            Err(e) => {
                error!("Error while retrieving payees from backend: {}", e);
                return;
            }
        };

        for login in payees {
            let amount = match self.backend.get_balance(&login).await {
                Ok(amount) => amount,
                Err(e) => {
                    self.set_fail(format!("Get {login} balance fail, from backend err: {e}"));
                    break;
                }
            };
            if !self.reached_threshold(amount) {
                continue;
            }
            must_pay += 1;

            // Shannon * 10^9 = wei
            let amount_in_wei = BigUint::from(amount as u64) * shannon();

            if !self.check_peers().await {
                break;
            }
            if !self.is_unlocked_account().await {
                break;
            }

            let pool_balance = match self.rpc.get_balance(&self.config.address).await {
                Ok(hex) => hex_to_biguint(&hex).unwrap_or_default(),
                Err(e) => {
                    self.set_fail(format!("Get pool balance failed, err: {e}"));
                    break;
                }
            };
            if pool_balance < amount_in_wei {
                self.set_fail(format!(
                    "Not enough balance for payment, need {amount_in_wei} Wei, pool has {pool_balance} Wei"
                ));
                break;
            }

            // Lock payments for current payout
            if let Err(e) = self.backend.lock_payouts(&login, amount).await {
                self.set_fail(format!("Failed to lock payment for {login}: {e}"));
                break;
            }
            info!("Locked payment for {}, {} Shannon", login, amount);

            // Debit miner's balance and update stats
            if let Err(e) = self.backend.update_balance(&login, amount).await {
                self.set_fail(format!(
                    "Failed to update balance for {login}, {amount} Shannon: {e}"
                ));
                break;
            }

            let value = format!("0x{amount_in_wei:x}");
            let tx_hash = match self
                .rpc
                .send_transaction(
                    &self.config.address,
                    &login,
                    &self.config.gas,
                    &self.config.gas_price,
                    &value,
                    self.config.auto_gas,
                )
                .await
            {
                Ok(tx_hash) => tx_hash,
                Err(e) => {
                    self.set_fail(format!(
                        "Failed to send payment to {login}, {amount} Shannon: {e}. \
                         Check outgoing tx for {login} in block explorer"
                    ));
                    break;
                }
            };

            if let Err(e) = self.backend.write_payment(&login, &tx_hash, amount).await {
                self.set_fail(format!(
                    "Failed to log payment data for {login}, {amount} Shannon, tx: {tx_hash}: {e}"
                ));
                break;
            }

            miners_paid += 1;
            total_amount += amount;
            info!("Paid {} Shannon to {}, TxHash: {}", amount, login, tx_hash);

            // Wait for TX confirmation before further payouts
            self.wait_for_receipt(&login, &tx_hash).await;
        }

        if must_pay > 0 {
            info!(
                "Paid total {} Shannon to {} of {} payees",
                total_amount, miners_paid, must_pay
            );
        } else {
            info!("No payees that have reached payout threshold");
        }

        if miners_paid > 0 && self.config.bgsave {
            self.bg_save().await;
        }
    }

    async fn wait_for_receipt(&self, login: &str, tx_hash: &str) {
        loop {
            info!("Waiting for tx confirmation: {}", tx_hash);
            tokio::time::sleep(TX_CHECK_INTERVAL).await;
            let receipt = match self.rpc.get_tx_receipt(tx_hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    error!("Failed to get tx receipt for {}: {}", tx_hash, e);
                    continue;
                }
            };
            // Tx has been mined
            if let Some(receipt) = receipt {
                if receipt.confirmed() {
                    if receipt.successful() {
                        info!("Payout tx successful for {}: {}", login, tx_hash);
                    } else {
                        error!(
                            "Payout tx failed for {}: {}. Address contract throws on incoming tx",
                            login, tx_hash
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn is_unlocked_account(&self) -> bool {
        is_unlocked_account(&self.rpc, &self.config.address).await
    }

    async fn check_peers(&self) -> bool {
        check_peers(&self.rpc, self.config.require_peers).await
    }

    fn reached_threshold(&self, amount: i64) -> bool {
        self.config.threshold < amount
    }

    async fn bg_save(&self) {
        match self.backend.bg_save().await {
            Ok(result) => info!("Saving backend state to disk: {}", result),
            Err(e) => error!("Failed to perform BGSAVE on backend: {}", e),
        }
    }

    /// Credit every pending payment back and release the payout lock.
    pub async fn resolve_payouts(&self) {
        let payments = match self.backend.get_pending_payments().await {
            Ok(payments) => payments,
            Err(e) => {
                error!("Failed to read pending payments: {}", e);
                return;
            }
        };

        if !payments.is_empty() {
            info!(
                "Will credit back following balances:\n{}",
                format_pending_payments(&payments)
            );
            for payment in &payments {
                if let Err(e) = self
                    .backend
                    .rollback_balance(&payment.address, payment.amount)
                    .await
                {
                    error!(
                        "Failed to credit {} Shannon back to {}, error is: {}",
                        payment.amount, payment.address, e
                    );
                    return;
                }
                info!(
                    "Credited {} Shannon back to {}",
                    payment.amount, payment.address
                );
            }
            if let Err(e) = self.backend.unlock_payouts().await {
                error!("Failed to unlock payouts: {}", e);
                return;
            }
        } else {
            info!("No pending payments to resolve");
        }

        if self.config.bgsave {
            self.bg_save().await;
        }
        info!("Payouts unlocked");
    }
}

/// Probe by signing; only an unlocked wallet can sign.
async fn is_unlocked_account(rpc: &GethRpcClient, address: &str) -> bool {
    match rpc.sign(address, "0x0").await {
        Ok(_) => true,
        Err(e) => {
            error!("Unable to process payouts: {}", e);
            false
        }
    }
}

async fn check_peers(rpc: &GethRpcClient, require_peers: u64) -> bool {
    match rpc.get_peer_count().await {
        Ok(n) if n >= require_peers => true,
        Ok(_) => {
            warn!(
                "Unable to start payouts, number of peers on a node is less than required {}",
                require_peers
            );
            false
        }
        Err(e) => {
            error!(
                "Unable to start payouts, failed to retrieve number of peers from node: {}",
                e
            );
            false
        }
    }
}

fn must_resolve_payout() -> bool {
    matches!(
        std::env::var(RESOLVE_PAYOUT_ENV).as_deref(),
        Ok("1") | Ok("true")
    )
}

fn format_pending_payments(list: &[PendingPayment]) -> String {
    list.iter()
        .map(|p| {
            format!(
                "\tAddress: {}, Amount: {} Shannon, at unix {}",
                p.address, p.amount, p.timestamp
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
