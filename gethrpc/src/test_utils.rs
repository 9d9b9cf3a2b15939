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

use crate::GethRpcClient;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub async fn setup_mock_node() -> (MockServer, GethRpcClient) {
    let mock_server = MockServer::start().await;
    let client = GethRpcClient::new("mock", &mock_server.uri(), Duration::from_secs(5))
        .expect("mock client");
    (mock_server, client)
}

/// Mount a response for one method + exact params pair. The id is matched
/// loosely because clients number requests sequentially.
pub async fn mock_method(
    mock_server: &MockServer,
    api_method: &str,
    params: serde_json::Value,
    result: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(serde_json::json!({
            "jsonrpc": "2.0",
            "method": api_method,
            "params": params,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": 0,
        })))
        .mount(mock_server)
        .await;
}

/// Mount a response for a method regardless of its params.
pub async fn mock_method_any_params(
    mock_server: &MockServer,
    api_method: &str,
    result: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(serde_json::json!({
            "jsonrpc": "2.0",
            "method": api_method,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": 0,
        })))
        .mount(mock_server)
        .await;
}
