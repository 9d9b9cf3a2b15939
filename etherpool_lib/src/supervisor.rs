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

//! Process-wide task supervision.
//!
//! Every long-running component runs under one `RoutineGroup`: a shared
//! cancellation token, a bounded worker pool, and a recovery mailbox. Tasks
//! spawned with `go_recover` are re-spawned by the supervisor when they
//! panic; plain `go` tasks only get their panic logged.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Capacity of the recovery mailbox.
const RECOVER_CHAN_SIZE: usize = 16;

type TaskFactory = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct RoutineGroup {
    token: CancellationToken,
    permits: Arc<Semaphore>,
    recover_tx: mpsc::Sender<TaskFactory>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutineGroup {
    /// Create a group bounded to `max` in-flight tasks and start its
    /// recovery supervisor.
    pub fn new(max: usize) -> Arc<Self> {
        let (recover_tx, mut recover_rx) = mpsc::channel::<TaskFactory>(RECOVER_CHAN_SIZE);
        let group = Arc::new(Self {
            token: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max.max(1))),
            recover_tx,
            handles: Mutex::new(Vec::new()),
        });

        let supervisor = group.clone();
        let token = group.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Stopping recover goroutine working");
                        break;
                    }
                    factory = recover_rx.recv() => {
                        match factory {
                            Some(factory) => supervisor.spawn_recoverable(factory).await,
                            None => break,
                        }
                    }
                }
            }
        });

        group
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Run a future once under the pool. A panic is logged and the slot
    /// released; the task is not restarted.
    pub async fn go<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore closed");
        let handle = tokio::spawn(async move {
            let _permit = permit;
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!("worker exit from a panic: {}", panic_message(&panic));
            }
        });
        self.handles.lock().await.push(handle);
    }

    /// Run a re-spawnable task: on panic the factory is pushed through the
    /// recovery mailbox and the supervisor starts it again under the same
    /// cancellation scope.
    pub async fn go_recover<F, Fut>(&self, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let factory: TaskFactory = Arc::new(move || factory().boxed());
        self.spawn_recoverable(factory).await;
    }

    async fn spawn_recoverable(&self, factory: TaskFactory) {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore closed");
        let recover_tx = self.recover_tx.clone();
        let token = self.token.clone();
        let fut = factory();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!("worker exit from a panic: {}", panic_message(&panic));
                if !token.is_cancelled() {
                    if let Err(e) = recover_tx.try_send(factory) {
                        error!("Failed to schedule worker recovery: {}", e);
                    }
                }
            }
        });
        self.handles.lock().await.push(handle);
    }

    /// Block until every spawned task has observed cancellation and
    /// returned. Tasks spawned during the wait (recoveries) are joined too.
    pub async fn wait(&self) {
        loop {
            let handle = self.handles.lock().await.pop();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
