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

//! HTTP JSON-RPC endpoint for getwork miners.
//!
//! Routes: `POST /{login}` and `POST /{login}/{worker}`, plus `GET /health`.
//! A request body may carry several concatenated JSON-RPC objects; replies
//! come back newline-delimited in order.

use super::ProxyServer;
use crate::supervisor::RoutineGroup;
use crate::util::{is_valid_hex_address, is_valid_worker_id};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
pub struct JsonRpcReq {
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResp {
    pub id: serde_json::Value,
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: i32, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

fn result_resp(id: serde_json::Value, result: serde_json::Value) -> JsonRpcResp {
    JsonRpcResp {
        id,
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
    }
}

fn error_resp(id: serde_json::Value, error: ErrorReply) -> JsonRpcResp {
    JsonRpcResp {
        id,
        jsonrpc: "2.0",
        result: None,
        error: Some(error),
    }
}

pub async fn start_http(proxy: Arc<ProxyServer>, group: &Arc<RoutineGroup>) {
    let listen = proxy.config.proxy.listen.clone();
    let limit = proxy.config.proxy.limit_body_size;
    // the hard cap sits above limitBodySize so the handler can still charge
    // the malformed policy for oversized bodies before rejecting them
    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/:login", post(handle_login))
        .route("/:login/:worker", post(handle_login_worker))
        .layer(DefaultBodyLimit::max(limit.max(1) * 2 + 1024))
        .with_state(proxy);

    let token = group.token();
    group
        .go(async move {
            info!("Starting proxy on {}", listen);
            let listener = match tokio::net::TcpListener::bind(&listen).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to start proxy on {}: {}", listen, e);
                    return;
                }
            };
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!("Proxy server error: {}", e);
            }
        })
        .await;
}

async fn handle_health(State(proxy): State<Arc<ProxyServer>>) -> Response {
    if proxy.is_sick() {
        (StatusCode::SERVICE_UNAVAILABLE, "sick\n").into_response()
    } else {
        (StatusCode::OK, "ok\n").into_response()
    }
}

async fn handle_login(
    State(proxy): State<Arc<ProxyServer>>,
    Path(login): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_client(proxy, login, String::new(), addr, headers, body).await
}

async fn handle_login_worker(
    State(proxy): State<Arc<ProxyServer>>,
    Path((login, worker)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_client(proxy, login, worker, addr, headers, body).await
}

fn remote_addr(proxy: &ProxyServer, addr: &SocketAddr, headers: &HeaderMap) -> String {
    if proxy.config.proxy.behind_reverse_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if forwarded.parse::<std::net::IpAddr>().is_ok() {
                return forwarded.to_string();
            }
        }
    }
    addr.ip().to_string()
}

async fn handle_client(
    proxy: Arc<ProxyServer>,
    login: String,
    worker: String,
    addr: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = remote_addr(&proxy, &addr, &headers);
    if proxy.policy.is_banned(&ip) {
        return StatusCode::FORBIDDEN.into_response();
    }
    if !proxy.policy.apply_limit_policy(&ip) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    if body.len() > proxy.config.proxy.limit_body_size {
        warn!("Socket flood from {}", ip);
        proxy.policy.apply_malformed_policy(&ip);
        return (StatusCode::EXPECTATION_FAILED, "Request too large").into_response();
    }

    if !worker.is_empty() && !is_valid_worker_id(&worker) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let login = login.to_lowercase();

    let mut out = String::new();
    let stream = serde_json::Deserializer::from_slice(&body).into_iter::<JsonRpcReq>();
    for req in stream {
        let req = match req {
            Ok(req) => req,
            Err(e) => {
                warn!("Malformed request from {}: {}", ip, e);
                proxy.policy.apply_malformed_policy(&ip);
                break;
            }
        };
        let resp = handle_message(&proxy, &login, &worker, &ip, req).await;
        match resp {
            Some(resp) => {
                out.push_str(&serde_json::to_string(&resp).unwrap_or_default());
                out.push('\n');
            }
            None => break,
        }
    }

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        out,
    )
        .into_response()
}

async fn handle_message(
    proxy: &Arc<ProxyServer>,
    login: &str,
    worker: &str,
    ip: &str,
    req: JsonRpcReq,
) -> Option<JsonRpcResp> {
    let id = match req.id {
        Some(id) if !id.is_null() => id,
        _ => {
            warn!("Missing RPC id from {}", ip);
            proxy.policy.apply_malformed_policy(ip);
            return None;
        }
    };

    if !is_valid_hex_address(login) {
        return Some(error_resp(id, ErrorReply::new(-1, "Invalid login")));
    }
    if !proxy.policy.apply_login_policy(login, ip) {
        return Some(error_resp(id, ErrorReply::new(-1, "You are blacklisted")));
    }

    match req.method.as_str() {
        "eth_getWork" => match proxy.handle_get_work_rpc() {
            Ok(reply) => Some(result_resp(id, serde_json::json!(reply))),
            Err(e) => Some(error_resp(id, e)),
        },
        "eth_submitWork" => {
            let params: Option<Vec<String>> = req
                .params
                .and_then(|p| serde_json::from_value(p).ok());
            match params {
                Some(params) if !params.is_empty() => {
                    match proxy.handle_submit_rpc(login, worker, ip, &params).await {
                        Ok(reply) => Some(result_resp(id, serde_json::json!(reply))),
                        Err(e) => Some(error_resp(id, e)),
                    }
                }
                _ => {
                    proxy.policy.apply_malformed_policy(ip);
                    Some(error_resp(id, ErrorReply::new(-1, "Malformed request")))
                }
            }
        }
        "eth_getBlockByNumber" => {
            Some(result_resp(id, proxy.handle_get_block_by_number_rpc()))
        }
        "eth_submitHashrate" => Some(result_resp(id, serde_json::json!(true))),
        method => {
            error!("Unknown request method {} from {}", method, ip);
            Some(error_resp(id, ErrorReply::new(-3, "Method not found")))
        }
    }
}

impl ProxyServer {
    pub(crate) fn handle_get_work_rpc(&self) -> Result<Vec<String>, ErrorReply> {
        if self.is_sick() {
            return Err(ErrorReply::new(-1, "Node is unhealthy"));
        }
        match self.current_block_template() {
            Some(t) => Ok(vec![
                t.header.clone(),
                t.seed.clone(),
                self.diff_hex.clone(),
            ]),
            None => Err(ErrorReply::new(-1, "Work not ready")),
        }
    }

    pub(crate) async fn handle_submit_rpc(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        params: &[String],
    ) -> Result<bool, ErrorReply> {
        let template = match self.current_block_template() {
            Some(t) => t,
            None => return Err(ErrorReply::new(-1, "Work not ready")),
        };
        if params.len() != 3 {
            self.policy.apply_malformed_policy(ip);
            return Err(ErrorReply::new(-1, "Malformed PoW result"));
        }
        let (exist, valid) = self
            .process_share(login, worker, ip, &template, params, false)
            .await;
        let policy_ok = self.policy.apply_share_policy(ip, valid || exist);
        if !policy_ok {
            return Err(ErrorReply::new(-1, "High rate of invalid shares"));
        }
        Ok(valid)
    }

    /// The pool's view of the chain tip, synthesized from the template.
    pub(crate) fn handle_get_block_by_number_rpc(&self) -> serde_json::Value {
        match self.current_block_template() {
            Some(t) => serde_json::json!({
                "number": format!("0x{:x}", t.height),
                "difficulty": format!("0x{:x}", t.difficulty),
            }),
            None => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reply_shape() {
        let resp = error_resp(
            serde_json::json!(7),
            ErrorReply::new(-3, "Method not found"),
        );
        let encoded = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            encoded,
            r#"{"id":7,"jsonrpc":"2.0","error":{"code":-3,"message":"Method not found"}}"#
        );
    }

    #[test]
    fn test_result_reply_shape() {
        let resp = result_resp(serde_json::json!(1), serde_json::json!(true));
        let encoded = serde_json::to_string(&resp).unwrap();
        assert_eq!(encoded, r#"{"id":1,"jsonrpc":"2.0","result":true}"#);
    }

    #[test]
    fn test_request_stream_parses_concatenated_bodies() {
        let body = br#"{"id":1,"method":"eth_getWork","params":[]}
{"id":2,"method":"eth_submitHashrate","params":["0x0","0x1"]}"#;
        let reqs: Vec<JsonRpcReq> = serde_json::Deserializer::from_slice(body)
            .into_iter::<JsonRpcReq>()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].method, "eth_getWork");
        assert_eq!(reqs[1].method, "eth_submitHashrate");
    }
}
