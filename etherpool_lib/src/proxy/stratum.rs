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

//! EthereumStratum/1.0.0 flavoured TCP endpoint.
//!
//! Line-delimited JSON over plain TCP or TLS. Jobs are pushed on template
//! change; each session keeps a short queue of recently replaced jobs so a
//! submit racing a notify still resolves its header.

use super::template::BlockTemplate;
use super::ProxyServer;
use crate::supervisor::RoutineGroup;
use crate::util::{diff_to_float, is_valid_hex_address, is_valid_worker_id};
use num_bigint::BigUint;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::BufReader as StdBufReader;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::TlsAcceptor;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

/// Stratum lines are tiny; anything longer is abuse.
const MAX_LINE_LENGTH: usize = 16 * 1024;
/// Replaced jobs a session will still accept submits against.
const MAX_STALE_JOBS: usize = 3;
/// Outgoing notification queue per session.
const SESSION_QUEUE: usize = 32;

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct JobDetails {
    pub id: String,
    pub seed: String,
    pub header: String,
    pub height: u64,
}

pub struct Session {
    pub id: u64,
    pub ip: String,
    login: Mutex<Option<(String, String)>>,
    pub extranonce: String,
    pub subscription_id: String,
    subscribed: AtomicBool,
    extranonce_sub: AtomicBool,
    job: Mutex<Option<JobDetails>>,
    stale_jobs: Mutex<VecDeque<JobDetails>>,
    tx: mpsc::Sender<String>,
}

impl Session {
    fn new(ip: String, tx: mpsc::Sender<String>) -> Self {
        let mut rng = rand::thread_rng();
        let sub: u64 = rng.gen();
        let extranonce: u16 = rng.gen();
        Self {
            id: SESSION_IDS.fetch_add(1, Ordering::SeqCst),
            ip,
            login: Mutex::new(None),
            extranonce: format!("{extranonce:04x}"),
            subscription_id: format!("{sub:016x}"),
            subscribed: AtomicBool::new(false),
            extranonce_sub: AtomicBool::new(false),
            job: Mutex::new(None),
            stale_jobs: Mutex::new(VecDeque::new()),
            tx,
        }
    }

    fn login(&self) -> Option<(String, String)> {
        self.login.lock().clone()
    }

    /// Install a new current job, retiring the previous one into the
    /// bounded stale queue.
    fn set_job(&self, job: JobDetails) {
        let mut current = self.job.lock();
        if let Some(prev) = current.take() {
            let mut stale = self.stale_jobs.lock();
            stale.push_back(prev);
            while stale.len() > MAX_STALE_JOBS {
                stale.pop_front();
            }
        }
        *current = Some(job);
    }

    fn find_job(&self, job_id: &str) -> Option<JobDetails> {
        if let Some(job) = self.job.lock().as_ref() {
            if job.id == job_id {
                return Some(job.clone());
            }
        }
        self.stale_jobs
            .lock()
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    fn push_message(&self, line: String) {
        if self.tx.try_send(line).is_err() {
            debug!("Dropping notification for slow session {}", self.id);
        }
    }
}

#[derive(Debug, Deserialize)]
struct StratumReq {
    id: Option<serde_json::Value>,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

pub async fn start_tcp(proxy: Arc<ProxyServer>, group: &Arc<RoutineGroup>) {
    let cfg = proxy.config.proxy.stratum.clone();
    let acceptor = if cfg.tls {
        match tls_acceptor(&cfg.cert_file, &cfg.key_file) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!("Failed to load stratum TLS keypair: {}", e);
                return;
            }
        }
    } else {
        None
    };

    let token = group.token();
    group
        .go(async move {
            info!("Starting stratum on {}", cfg.listen);
            let listener = match TcpListener::bind(&cfg.listen).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to start stratum on {}: {}", cfg.listen, e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Stopping stratum listener");
                        return;
                    }
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("Stratum accept failed: {}", e);
                                continue;
                            }
                        };
                        let ip = addr.ip().to_string();
                        if proxy.policy.is_banned(&ip) || !proxy.policy.apply_limit_policy(&ip) {
                            continue;
                        }
                        if proxy.sessions.read().await.len() >= cfg.max_conn {
                            warn!("Stratum connection cap reached, rejecting {}", ip);
                            continue;
                        }
                        let _ = stream.set_nodelay(true);

                        let proxy = proxy.clone();
                        let acceptor = acceptor.clone();
                        let token = token.clone();
                        // miner connections must not consume maxRoutine permits
                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls) => {
                                        handle_connection(proxy, tls, ip, token).await;
                                    }
                                    Err(e) => {
                                        warn!("TLS handshake with {} failed: {}", ip, e);
                                    }
                                },
                                None => handle_connection(proxy, stream, ip, token).await,
                            }
                        });
                    }
                }
            }
        })
        .await;
}

fn tls_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor, String> {
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(
        std::fs::File::open(cert_file).map_err(|e| format!("open {cert_file}: {e}"))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| format!("read certs: {e}"))?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut StdBufReader::new(
        std::fs::File::open(key_file).map_err(|e| format!("open {key_file}: {e}"))?,
    ))
    .map_err(|e| format!("read key: {e}"))?
    .ok_or_else(|| format!("no private key in {key_file}"))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("TLS config: {e}"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn handle_connection<S>(
    proxy: Arc<ProxyServer>,
    stream: S,
    ip: String,
    token: tokio_util::sync::CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut framed = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE);
    let session = Arc::new(Session::new(ip.clone(), tx));
    proxy
        .sessions
        .write()
        .await
        .insert(session.id, session.clone());
    debug!("New stratum session {} from {}", session.id, ip);

    let idle = proxy.config.proxy.stratum.timeout;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(message) = rx.recv() => {
                if writer.write_all(message.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
            line = tokio::time::timeout(idle, framed.next()) => {
                match line {
                    Err(_) => {
                        info!("Idle stratum session from {}, closing", ip);
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!("Stratum read error from {}: {}", ip, e);
                        proxy.policy.apply_malformed_policy(&ip);
                        break;
                    }
                    Ok(Some(Ok(line))) => {
                        if line.is_empty() {
                            continue;
                        }
                        let req: StratumReq = match serde_json::from_str(&line) {
                            Ok(req) => req,
                            Err(e) => {
                                warn!("Malformed stratum request from {}: {}", ip, e);
                                if !proxy.policy.apply_malformed_policy(&ip) {
                                    break;
                                }
                                continue;
                            }
                        };
                        let reply = handle_message(&proxy, &session, req).await;
                        match reply {
                            Some(reply) => {
                                let encoded = serde_json::to_string(&reply).unwrap_or_default();
                                if writer.write_all(encoded.as_bytes()).await.is_err()
                                    || writer.write_all(b"\n").await.is_err()
                                    || writer.flush().await.is_err()
                                {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }
    }

    proxy.sessions.write().await.remove(&session.id);
    debug!("Closed stratum session {} from {}", session.id, ip);
}

async fn handle_message(
    proxy: &Arc<ProxyServer>,
    session: &Arc<Session>,
    req: StratumReq,
) -> Option<serde_json::Value> {
    let id = req.id.unwrap_or(serde_json::Value::Null);
    match req.method.as_str() {
        "mining.subscribe" => {
            session.subscribed.store(true, Ordering::SeqCst);
            Some(serde_json::json!({
                "id": id,
                "result": [
                    ["mining.notify", session.subscription_id, "EthereumStratum/1.0.0"],
                    session.extranonce,
                ],
                "error": serde_json::Value::Null,
            }))
        }
        "mining.authorize" => {
            if !session.subscribed.load(Ordering::SeqCst) {
                return Some(stratum_error(id, 25, "Not subscribed"));
            }
            let params: Vec<String> =
                serde_json::from_value(req.params).unwrap_or_default();
            let full_login = params.first().cloned().unwrap_or_default();
            let (login, worker) = split_login(&full_login);
            if !is_valid_hex_address(&login) {
                return Some(stratum_error(id, -1, "Invalid login"));
            }
            if !worker.is_empty() && !is_valid_worker_id(&worker) {
                return Some(stratum_error(id, -1, "Invalid worker id"));
            }
            if !proxy.policy.apply_login_policy(&login, &session.ip) {
                return Some(stratum_error(id, -1, "You are blacklisted"));
            }
            *session.login.lock() = Some((login, worker));

            // difficulty first, then the current job
            session.push_message(set_difficulty_line(proxy.config.proxy.difficulty));
            if let Some(template) = proxy.current_block_template() {
                let job = JobDetails {
                    id: proxy.next_job_id(),
                    seed: template.seed.clone(),
                    header: template.header.clone(),
                    height: template.height,
                };
                session.set_job(job.clone());
                session.push_message(notify_line(&job, true));
            }
            Some(serde_json::json!({
                "id": id, "result": true, "error": serde_json::Value::Null,
            }))
        }
        "mining.extranonce.subscribe" => {
            session.extranonce_sub.store(true, Ordering::SeqCst);
            session.push_message(
                serde_json::json!({
                    "id": serde_json::Value::Null,
                    "method": "mining.set_extranonce",
                    "params": [session.extranonce],
                })
                .to_string(),
            );
            Some(serde_json::json!({
                "id": id, "result": true, "error": serde_json::Value::Null,
            }))
        }
        "mining.submit" => {
            let params: Vec<String> =
                serde_json::from_value(req.params).unwrap_or_default();
            if params.len() < 3 {
                proxy.policy.apply_malformed_policy(&session.ip);
                return Some(stratum_error(id, -1, "Malformed submit"));
            }
            let (login, worker) = match session.login() {
                Some(pair) => pair,
                None => return Some(stratum_error(id, 24, "Not authorized")),
            };
            // MiningRig-style submits carry login.worker in the first field
            let worker = match split_login(&params[0]) {
                (_, w) if !w.is_empty() => w,
                _ => worker,
            };

            let job = match session.find_job(&params[1]) {
                Some(job) => job,
                None => {
                    proxy.policy.apply_share_policy(&session.ip, false);
                    return Some(stratum_error(id, 21, "Stale share"));
                }
            };

            let nonce = full_nonce(&session.extranonce, &params[2]);
            let template = match proxy.current_block_template() {
                Some(t) => t,
                None => return Some(stratum_error(id, 20, "Work not ready")),
            };
            let share_params = vec![nonce, job.header.clone(), job.header.clone()];
            let (exist, valid) = proxy
                .process_share(&login, &worker, &session.ip, &template, &share_params, true)
                .await;
            let policy_ok = proxy
                .policy
                .apply_share_policy(&session.ip, valid || exist);
            if !policy_ok {
                return Some(stratum_error(id, 23, "High rate of invalid shares"));
            }
            if !valid && !exist {
                return Some(stratum_error(id, 23, "Invalid share"));
            }
            Some(serde_json::json!({
                "id": id, "result": valid, "error": serde_json::Value::Null,
            }))
        }
        method => {
            warn!(
                "Unknown stratum method {} from {}",
                method, session.ip
            );
            Some(stratum_error(id, -3, "Method not found"))
        }
    }
}

fn stratum_error(id: serde_json::Value, code: i32, message: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "result": serde_json::Value::Null,
        "error": { "code": code, "message": message },
    })
}

fn set_difficulty_line(diff: u64) -> String {
    serde_json::json!({
        "id": serde_json::Value::Null,
        "method": "mining.set_difficulty",
        "params": [diff_to_float(&BigUint::from(diff))],
    })
    .to_string()
}

fn notify_line(job: &JobDetails, clean: bool) -> String {
    serde_json::json!({
        "id": serde_json::Value::Null,
        "method": "mining.notify",
        "params": [job.id, job.seed, job.header, clean],
    })
    .to_string()
}

/// `login.worker` → (login, worker)
fn split_login(full: &str) -> (String, String) {
    match full.split_once('.') {
        Some((login, worker)) => (login.to_lowercase(), worker.to_string()),
        None => (full.to_lowercase(), String::new()),
    }
}

/// EthereumStratum miners return only the tail of the nonce; the session
/// extranonce is the prefix.
fn full_nonce(extranonce: &str, submitted: &str) -> String {
    let submitted = submitted.trim_start_matches("0x");
    if extranonce.len() + submitted.len() == 16 {
        format!("0x{extranonce}{submitted}")
    } else {
        format!("0x{submitted}")
    }
}

impl ProxyServer {
    /// Push the new template to every authorized session.
    pub(crate) async fn broadcast_job(&self, template: &BlockTemplate) {
        let sessions = self.sessions.read().await;
        if sessions.is_empty() {
            return;
        }
        let mut count = 0;
        for session in sessions.values() {
            if session.login().is_none() {
                continue;
            }
            let job = JobDetails {
                id: self.next_job_id(),
                seed: template.seed.clone(),
                header: template.header.clone(),
                height: template.height,
            };
            session.set_job(job.clone());
            // remind extranonce subscribers of their prefix with each job
            if session.extranonce_sub.load(Ordering::SeqCst) {
                session.push_message(
                    serde_json::json!({
                        "id": serde_json::Value::Null,
                        "method": "mining.set_extranonce",
                        "params": [session.extranonce],
                    })
                    .to_string(),
                );
            }
            session.push_message(notify_line(&job, true));
            count += 1;
        }
        debug!("Broadcast new job to {} stratum sessions", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(Session::new("10.0.0.1".to_string(), tx))
    }

    fn job(id: &str) -> JobDetails {
        JobDetails {
            id: id.to_string(),
            seed: "0xseed".to_string(),
            header: format!("0xheader-{id}"),
            height: 100,
        }
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = test_session();
        let b = test_session();
        assert_ne!(a.id, b.id);
        assert_eq!(a.extranonce.len(), 4);
        assert_eq!(a.subscription_id.len(), 16);
    }

    #[test]
    fn test_stale_job_queue_is_bounded() {
        let session = test_session();
        for i in 0..6 {
            session.set_job(job(&i.to_string()));
        }
        // current is job 5; stale queue holds 2, 3, 4
        assert!(session.find_job("5").is_some());
        assert!(session.find_job("4").is_some());
        assert!(session.find_job("2").is_some());
        assert!(session.find_job("1").is_none());
        assert!(session.find_job("0").is_none());
    }

    #[test]
    fn test_split_login() {
        let (login, worker) = split_login("0xEA674fddE714fd979de3EdF0F56AA9716B898ec8.rig-1");
        assert_eq!(login, "0xea674fdde714fd979de3edf0f56aa9716b898ec8");
        assert_eq!(worker, "rig-1");

        let (login, worker) = split_login("0xea674fdde714fd979de3edf0f56aa9716b898ec8");
        assert_eq!(worker, "");
        assert!(is_valid_hex_address(&login));
    }

    #[test]
    fn test_full_nonce_prepends_extranonce() {
        assert_eq!(full_nonce("ab12", "345678901234"), "0xab12345678901234");
        // already-complete nonces pass through
        assert_eq!(full_nonce("ab12", "0x72d683b55b1e1627"), "0x72d683b55b1e1627");
    }

    #[test]
    fn test_notify_and_difficulty_lines() {
        let line = notify_line(&job("2a"), true);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "mining.notify");
        assert_eq!(value["params"][0], "2a");
        assert_eq!(value["params"][3], true);

        let diff_line = set_difficulty_line(8_589_934_592);
        let value: serde_json::Value = serde_json::from_str(&diff_line).unwrap();
        assert_eq!(value["method"], "mining.set_difficulty");
        assert_eq!(value["params"][0], 2.0);
    }
}
