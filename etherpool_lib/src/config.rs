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

use crate::util::{is_valid_hex_address, parse_duration};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Supported Ethash-family networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Classic,
    Mordor,
    Ethereum,
    Ropsten,
    Ubiq,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Classic => "classic",
            Network::Mordor => "mordor",
            Network::Ethereum => "ethereum",
            Network::Ropsten => "ropsten",
            Network::Ubiq => "ubiq",
        }
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        match s.as_str() {
            "classic" => Ok(Network::Classic),
            "mordor" => Ok(Network::Mordor),
            "ethereum" => Ok(Network::Ethereum),
            "ropsten" => Ok(Network::Ropsten),
            "ubiq" => Ok(Network::Ubiq),
            other => Err(serde::de::Error::custom(format!(
                "unknown network {other:?}, expected classic|mordor|ethereum|ropsten|ubiq"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLevel {
    #[default]
    Production,
    Testing,
    Dev,
}

impl RunLevel {
    pub fn default_log_level(&self) -> &'static str {
        match self {
            RunLevel::Production => "info",
            RunLevel::Testing => "debug",
            RunLevel::Dev => "debug",
        }
    }
}

/// helper to deserialize duration strings like "120ms", "10s", "2m", "1h"
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Instance label, required; also the node-state key in the store
    pub name: String,
    #[serde(default)]
    pub runlevel: RunLevel,
    /// Worker pool size for long-running tasks
    #[serde(default = "default_max_routine")]
    pub max_routine: usize,
    /// Tokio worker threads; 0 means one per core
    #[serde(default)]
    pub threads: usize,
    pub network: Network,
    /// Store key prefix
    pub coin: String,
    pub proxy: ProxyConfig,
    pub upstream: Vec<UpstreamConfig>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub upstream_check_interval: Duration,
    pub redis: StoreConfig,
    #[serde(rename = "unlocker")]
    pub unlocker: UnlockerConfig,
    pub payouts: PayoutsConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Served by a separate process; parsed so shared config files load
    #[serde(default)]
    pub api: Option<serde_json::Value>,
    #[serde(default)]
    pub newrelic_enabled: bool,
    #[serde(default)]
    pub newrelic_name: Option<String>,
    #[serde(default)]
    pub newrelic_key: Option<String>,
    #[serde(default)]
    pub newrelic_verbose: bool,
}

fn default_max_routine() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub listen: String,
    /// Fixed pool share difficulty
    pub difficulty: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub block_refresh_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub state_update_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub hashrate_expiration: Duration,
    #[serde(default = "default_headers_size")]
    pub limit_headers_size: usize,
    #[serde(default = "default_body_size")]
    pub limit_body_size: usize,
    #[serde(default)]
    pub behind_reverse_proxy: bool,
    #[serde(default = "default_max_fails")]
    pub max_fails: i64,
    #[serde(default)]
    pub health_check: bool,
    pub stratum: StratumConfig,
    pub policy: PolicyConfig,
}

fn default_true() -> bool {
    true
}

fn default_headers_size() -> usize {
    1024
}

fn default_body_size() -> usize {
    512
}

fn default_max_fails() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StratumConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub listen: String,
    #[serde(default = "default_stratum_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

fn default_stratum_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_conn() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default = "default_policy_workers")]
    pub workers: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub reset_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub refresh_interval: Duration,
    pub banning: BanningConfig,
    pub limits: LimitsConfig,
}

fn default_policy_workers() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BanningConfig {
    #[serde(default)]
    pub enabled: bool,
    /// OS firewall set to add banned IPs to; empty logs only
    #[serde(default)]
    pub ipset: String,
    /// Ban duration in seconds
    #[serde(default = "default_ban_timeout")]
    pub timeout: i64,
    /// invalid/valid percentage triggering a ban
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: f32,
    /// Shares sampled before the ratio is evaluated
    #[serde(default = "default_check_threshold")]
    pub check_threshold: i32,
    #[serde(default = "default_malformed_limit")]
    pub malformed_limit: i32,
}

fn default_ban_timeout() -> i64 {
    1800
}

fn default_invalid_percent() -> f32 {
    30.0
}

fn default_check_threshold() -> i32 {
    30
}

fn default_malformed_limit() -> i32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Initial connection allowance per IP
    #[serde(default = "default_limit")]
    pub limit: i32,
    /// Startup grace period before limits apply
    #[serde(default = "default_grace", deserialize_with = "deserialize_duration")]
    pub grace: Duration,
    /// Allowance credited back per valid share
    #[serde(default = "default_limit_jump")]
    pub limit_jump: i32,
}

fn default_limit() -> i32 {
    32
}

fn default_grace() -> Duration {
    Duration::from_secs(300)
}

fn default_limit_jump() -> i32 {
    8
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub endpoint: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: i64,
    /// Accepted for config compatibility; the async connection manager
    /// multiplexes a single connection
    #[serde(default)]
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnlockerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Percent of each round kept by the pool
    #[serde(default)]
    pub pool_fee: f64,
    #[serde(default)]
    pub pool_fee_address: String,
    /// Declared by the original config format; unread
    #[serde(default)]
    pub donate: bool,
    pub depth: u64,
    pub immature_depth: u64,
    #[serde(default)]
    pub keep_tx_fees: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    pub daemon: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PayoutsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub require_peers: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    pub daemon: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    pub address: String,
    #[serde(default)]
    pub gas: String,
    #[serde(default)]
    pub gas_price: String,
    #[serde(default)]
    pub auto_gas: bool,
    /// Minimum balance paid out, in Shannon
    pub threshold: i64,
    #[serde(default)]
    pub bgsave: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub err_log_path: Option<String>,
    /// Retention knobs of the original rotator; the daily appender manages
    /// its own files, so these are accepted and unused
    #[serde(default)]
    pub save_days: u64,
    #[serde(default)]
    pub cut_interval: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::with_name(path).format(config::FileFormat::Json))
            .add_source(config::Environment::with_prefix("ETHERPOOL").separator("_"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup validation; violations are fatal before any component runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("you must set an instance name".into()));
        }
        if self.proxy.enabled && self.upstream.is_empty() {
            return Err(ConfigError::Invalid("no upstreams configured".into()));
        }
        if self.proxy.enabled && self.proxy.difficulty == 0 {
            return Err(ConfigError::Invalid("proxy.difficulty must be positive".into()));
        }
        if self.unlocker.enabled {
            if self.unlocker.immature_depth < 16 {
                return Err(ConfigError::Invalid(format!(
                    "immature depth can't be < 16, yours is {}",
                    self.unlocker.immature_depth
                )));
            }
            if self.unlocker.depth < 32 {
                return Err(ConfigError::Invalid(format!(
                    "block maturity depth can't be < 32, yours is {}",
                    self.unlocker.depth
                )));
            }
            if !self.unlocker.pool_fee_address.is_empty()
                && !is_valid_hex_address(&self.unlocker.pool_fee_address)
            {
                return Err(ConfigError::Invalid(format!(
                    "invalid poolFeeAddress: {}",
                    self.unlocker.pool_fee_address
                )));
            }
        }
        if self.payouts.enabled {
            if !is_valid_hex_address(&self.payouts.address) {
                return Err(ConfigError::Invalid(format!(
                    "invalid payouts address: {}",
                    self.payouts.address
                )));
            }
            if self.payouts.threshold <= 0 {
                return Err(ConfigError::Invalid(
                    "payouts threshold must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_json() -> serde_json::Value {
        serde_json::json!({
            "name": "pool-1",
            "network": "classic",
            "coin": "etc",
            "proxy": {
                "listen": "0.0.0.0:8888",
                "difficulty": 2000000000u64,
                "blockRefreshInterval": "120ms",
                "stateUpdateInterval": "3s",
                "hashrateExpiration": "3h",
                "stratum": { "enabled": true, "listen": "0.0.0.0:8008", "timeout": "120s", "maxConn": 8192 },
                "policy": {
                    "workers": 8,
                    "resetInterval": "60m",
                    "refreshInterval": "1m",
                    "banning": { "enabled": false, "ipset": "blacklist", "timeout": 1800,
                                 "invalidPercent": 30, "checkThreshold": 30, "malformedLimit": 5 },
                    "limits": { "enabled": false, "limit": 30, "grace": "5m", "limitJump": 10 }
                }
            },
            "upstream": [
                { "name": "main", "url": "http://127.0.0.1:8545", "timeout": "10s" }
            ],
            "upstreamCheckInterval": "5s",
            "redis": { "endpoint": "127.0.0.1:6379", "password": "", "database": 0, "poolSize": 10 },
            "unlocker": {
                "enabled": true, "poolFee": 1.0, "poolFeeAddress": "",
                "depth": 120, "immatureDepth": 20, "keepTxFees": false,
                "interval": "10m", "daemon": "http://127.0.0.1:8545", "timeout": "10s"
            },
            "payouts": {
                "enabled": false, "requirePeers": 25, "interval": "12h",
                "daemon": "http://127.0.0.1:8545", "timeout": "10s",
                "address": "0xea674fdde714fd979de3edf0f56aa9716b898ec8",
                "gas": "21000", "gasPrice": "50000000000", "autoGas": true,
                "threshold": 500000, "bgsave": false
            }
        })
    }

    fn parse(value: serde_json::Value) -> Result<Config, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[test]
    fn test_minimal_config_parses() {
        let cfg = parse(minimal_config_json()).unwrap();
        assert_eq!(cfg.name, "pool-1");
        assert_eq!(cfg.network, Network::Classic);
        assert_eq!(cfg.proxy.difficulty, 2_000_000_000);
        assert_eq!(
            cfg.proxy.block_refresh_interval,
            Duration::from_millis(120)
        );
        assert_eq!(cfg.proxy.hashrate_expiration, Duration::from_secs(3 * 3600));
        assert_eq!(cfg.unlocker.interval, Duration::from_secs(600));
        assert_eq!(cfg.runlevel, RunLevel::Production);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_network_is_rejected() {
        let mut value = minimal_config_json();
        value["network"] = serde_json::json!("dogecoin");
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_depth_validation() {
        let mut value = minimal_config_json();
        value["unlocker"]["depth"] = serde_json::json!(20);
        let cfg = parse(value).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut value = minimal_config_json();
        value["unlocker"]["immatureDepth"] = serde_json::json!(8);
        let cfg = parse(value).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pool_fee_address_validation() {
        let mut value = minimal_config_json();
        value["unlocker"]["poolFeeAddress"] = serde_json::json!("not-an-address");
        let cfg = parse(value).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_payout_address_validation() {
        let mut value = minimal_config_json();
        value["payouts"]["enabled"] = serde_json::json!(true);
        value["payouts"]["address"] = serde_json::json!("0xdeadbeef");
        let cfg = parse(value).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_name_is_fatal() {
        let mut value = minimal_config_json();
        value["name"] = serde_json::json!("");
        let cfg = parse(value).unwrap();
        assert!(cfg.validate().is_err());
    }
}
