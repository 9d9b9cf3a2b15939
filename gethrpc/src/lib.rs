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

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// A client is reported sick after this many consecutive failed calls.
const MAX_CONSECUTIVE_FAILS: u64 = 3;

/// JSON-RPC 2.0 request structure (go-ethereum format)
#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: String,
    params: serde_json::Value,
    id: u64,
}

/// JSON-RPC 2.0 response structure. `result` is absent or null on error,
/// `error` is absent on success.
#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// Error type for the GethRpcClient
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP error {status_code}: {message}")]
    HttpError { status_code: u16, message: String },
    #[error("Parse error: {message}")]
    ParseError { message: String },
    #[error("RPC error {code}: {message}")]
    RpcError { code: i32, message: String },
    #[error("{0}")]
    Other(String),
}

/// Block reply as returned by eth_getBlockByNumber with full transactions.
/// Hex quantities stay as strings; callers parse what they need.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GetBlockReply {
    pub number: String,
    pub hash: String,
    pub nonce: String,
    pub seal_fields: Vec<String>,
    pub uncles: Vec<String>,
    pub transactions: Vec<TxReply>,
    pub difficulty: String,
    pub gas_used: String,
    pub base_fee_per_gas: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TxReply {
    pub hash: String,
    pub gas_price: String,
}

/// Transaction receipt, reduced to the fields the pool reads.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub gas_used: String,
    pub block_number: Option<String>,
    pub status: String,
}

impl TxReceipt {
    /// The transaction has been mined into a block.
    pub fn confirmed(&self) -> bool {
        matches!(&self.block_number, Some(n) if !n.is_empty())
    }

    /// Post-Byzantium status flag. A reverted transaction still moved funds
    /// out of the sender for gas, so callers must not treat failure as
    /// not-sent.
    pub fn successful(&self) -> bool {
        self.status == "0x1"
    }
}

#[derive(Debug, Clone)]
pub struct GethRpcClient {
    pub name: String,
    pub url: String,
    client: reqwest::Client,
    request_id: Arc<AtomicU64>,
    fails: Arc<AtomicU64>,
}

impl GethRpcClient {
    pub fn new(name: &str, url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
            request_id: Arc::new(AtomicU64::new(0)),
            fails: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Raw JSON-RPC round trip; `null` results are surfaced as `Value::Null`.
    async fn request_value(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
            id,
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.mark_sick();
                error!("HTTP request to {} failed: {}", self.name, e);
                return Err(RpcError::Other(format!("HTTP request failed: {e}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.mark_sick();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!("Upstream {} returned HTTP {}: {}", self.name, status, message);
            return Err(RpcError::HttpError {
                status_code: status.as_u16(),
                message,
            });
        }

        let rpc_response: JsonRpcResponse<serde_json::Value> =
            response.json().await.map_err(|e| {
                self.mark_sick();
                RpcError::ParseError {
                    message: format!("Failed to parse response: {e}"),
                }
            })?;

        if let Some(error) = rpc_response.error {
            // The node answered; a method-level error is not a sickness signal.
            return Err(RpcError::RpcError {
                code: error.code,
                message: error.message,
            });
        }

        self.mark_alive();
        Ok(rpc_response.result.unwrap_or(serde_json::Value::Null))
    }

    pub async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        let value = self.request_value(method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::ParseError {
            message: format!("Failed to decode {method} result: {e}"),
        })
    }

    /// Like `request` but maps a `null` result to `None`. Chain lookups use
    /// this: a missing block or receipt is data, not an error.
    pub async fn request_opt<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, RpcError> {
        let value = self.request_value(method, params).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RpcError::ParseError {
                message: format!("Failed to decode {method} result: {e}"),
            })
    }

    /// eth_getWork: [headerHash, seedHash, target]
    pub async fn get_work(&self) -> Result<Vec<String>, RpcError> {
        self.request("eth_getWork", serde_json::json!([])).await
    }

    /// eth_submitWork with the share's [nonce, powHash, mixDigest]
    pub async fn submit_block(&self, params: &[String]) -> Result<bool, RpcError> {
        self.request("eth_submitWork", serde_json::json!(params)).await
    }

    pub async fn get_latest_block(&self) -> Result<GetBlockReply, RpcError> {
        let reply: Option<GetBlockReply> = self
            .request_opt("eth_getBlockByNumber", serde_json::json!(["latest", false]))
            .await?;
        reply.ok_or(RpcError::Other("No latest block".to_string()))
    }

    /// Full block (transaction objects included) at a height, None when the
    /// node does not have it.
    pub async fn get_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<GetBlockReply>, RpcError> {
        let params = serde_json::json!([format!("0x{:x}", height), true]);
        self.request_opt("eth_getBlockByNumber", params).await
    }

    pub async fn get_uncle_by_block_number_and_index(
        &self,
        height: u64,
        index: usize,
    ) -> Result<Option<GetBlockReply>, RpcError> {
        let params = serde_json::json!([format!("0x{:x}", height), format!("0x{:x}", index)]);
        self.request_opt("eth_getUncleByBlockNumberAndIndex", params)
            .await
    }

    pub async fn get_tx_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, RpcError> {
        self.request_opt("eth_getTransactionReceipt", serde_json::json!([hash]))
            .await
    }

    /// net_peerCount as a number
    pub async fn get_peer_count(&self) -> Result<u64, RpcError> {
        let reply: String = self.request("net_peerCount", serde_json::json!([])).await?;
        u64::from_str_radix(reply.trim_start_matches("0x"), 16).map_err(|e| {
            RpcError::ParseError {
                message: format!("Bad peer count {reply}: {e}"),
            }
        })
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let reply: String = self.request("eth_blockNumber", serde_json::json!([])).await?;
        u64::from_str_radix(reply.trim_start_matches("0x"), 16).map_err(|e| {
            RpcError::ParseError {
                message: format!("Bad block number {reply}: {e}"),
            }
        })
    }

    /// eth_getBalance at latest, hex-encoded wei
    pub async fn get_balance(&self, address: &str) -> Result<String, RpcError> {
        self.request("eth_getBalance", serde_json::json!([address, "latest"]))
            .await
    }

    /// eth_sign; also used as an is-the-wallet-unlocked probe
    pub async fn sign(&self, address: &str, data: &str) -> Result<String, RpcError> {
        self.request("eth_sign", serde_json::json!([address, data]))
            .await
    }

    /// eth_sendTransaction. With auto_gas the node estimates gas and picks
    /// the gas price.
    pub async fn send_transaction(
        &self,
        from: &str,
        to: &str,
        gas: &str,
        gas_price: &str,
        value: &str,
        auto_gas: bool,
    ) -> Result<String, RpcError> {
        let tx = if auto_gas {
            serde_json::json!({ "from": from, "to": to, "value": value })
        } else {
            serde_json::json!({
                "from": from,
                "to": to,
                "gas": gas,
                "gasPrice": gas_price,
                "value": value,
            })
        };
        let hash: String = self
            .request("eth_sendTransaction", serde_json::json!([tx]))
            .await?;
        if hash.len() != 66 {
            return Err(RpcError::Other(format!("Bad tx hash from node: {hash}")));
        }
        Ok(hash)
    }

    /// Probe the node with eth_getWork and update the health flag.
    pub async fn check(&self) -> bool {
        match self.get_work().await {
            Ok(_) => !self.is_sick(),
            Err(_) => false,
        }
    }

    pub fn mark_sick(&self) {
        self.fails.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_alive(&self) {
        self.fails.store(0, Ordering::SeqCst);
    }

    pub fn is_sick(&self) -> bool {
        self.fails.load(Ordering::SeqCst) >= MAX_CONSECUTIVE_FAILS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc_result(result: serde_json::Value, id: u64) -> serde_json::Value {
        serde_json::json!({ "jsonrpc": "2.0", "result": result, "id": id })
    }

    async fn client_for(server: &MockServer) -> GethRpcClient {
        GethRpcClient::new("test", &server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_work() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_getWork",
                "params": [],
                "id": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(
                serde_json::json!([
                    "0x34365c6e44e848d7f5f06cea8607b7be2a3f6e3fdf9163312ffd0b09baff0f37",
                    "0x290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563",
                    "0x0000000112e0be826d694b2e62d01511f12a6061fbaec8bc02357593e70e52ba"
                ]),
                0,
            )))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let work = client.get_work().await.unwrap();

        assert_eq!(work.len(), 3);
        assert!(work[0].starts_with("0x34365c6e"));
    }

    #[tokio::test]
    async fn test_submit_block_accepted() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(rpc_result(serde_json::json!(true), 0)),
            )
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let params = vec![
            "0x72d683b55b1e1627".to_string(),
            "0x34365c6e44e848d7f5f06cea8607b7be2a3f6e3fdf9163312ffd0b09baff0f37".to_string(),
            "0xb57e87e72e9e4bb5b520ba80a6f75f5852a0a3928b17c77b33a6d5dc8d07faaf".to_string(),
        ];
        assert!(client.submit_block(&params).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_block_by_height_missing_is_none() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(rpc_result(serde_json::Value::Null, 0)),
            )
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let reply = client.get_block_by_height(42).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_get_block_by_height_parses_fields() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_getBlockByNumber",
                "params": ["0x3e8", true],
                "id": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(
                serde_json::json!({
                    "number": "0x3e8",
                    "hash": "0x5e9a183768460fbf56eab199a66057375b424bdca195e7ecc808374365a7ea67",
                    "nonce": "0x72d683b55b1e1627",
                    "difficulty": "0x186a0",
                    "gasUsed": "0x5208",
                    "uncles": [],
                    "transactions": [{ "hash": "0xaa", "gasPrice": "0x3b9aca00" }]
                }),
                0,
            )))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let block = client.get_block_by_height(1000).await.unwrap().unwrap();

        assert_eq!(block.number, "0x3e8");
        assert_eq!(block.nonce, "0x72d683b55b1e1627");
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].gas_price, "0x3b9aca00");
    }

    #[tokio::test]
    async fn test_peer_count() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(rpc_result(serde_json::json!("0x19"), 0)),
            )
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        assert_eq!(client.get_peer_count().await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_rpc_error_surface() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "error": { "code": -32601, "message": "method not found" },
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let result = client.get_work().await;

        match result {
            Err(RpcError::RpcError { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("Expected RpcError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sick_after_consecutive_failures() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        assert!(!client.is_sick());
        for _ in 0..3 {
            let _ = client.get_work().await;
        }
        assert!(client.is_sick());
        assert!(!client.check().await);

        client.mark_alive();
        assert!(!client.is_sick());
    }

    #[tokio::test]
    async fn test_send_transaction_auto_gas_omits_gas() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_sendTransaction",
                "params": [{
                    "from": "0xea674fdde714fd979de3edf0f56aa9716b898ec8",
                    "to": "0x4bb96091ee9d802ed039c4d1a5f6216f90f81b01",
                    "value": "0xde0b6b3a7640000",
                }],
                "id": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(
                serde_json::json!(
                    "0x2f1c5c2b44f771e942a8506148e256f94f1a464babc938ae0690c6e34cd79190"
                ),
                0,
            )))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server).await;
        let hash = client
            .send_transaction(
                "0xea674fdde714fd979de3edf0f56aa9716b898ec8",
                "0x4bb96091ee9d802ed039c4d1a5f6216f90f81b01",
                "0x5208",
                "0x3b9aca00",
                "0xde0b6b3a7640000",
                true,
            )
            .await
            .unwrap();
        assert_eq!(hash.len(), 66);
    }
}
