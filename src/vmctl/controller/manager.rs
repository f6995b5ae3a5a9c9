/*
 * Copyright (C) 2024 The vmctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Lifecycle glue between leader election and the control loop.
//!
//! Everything that touches the compute backend lives inside a
//! [`LeaderTerm`]: the ingestion task, the queue and the workers. A term is
//! started when the elector reports `BecameLeader` and torn down completely
//! before this replica gives the lease up, so a standby replica never calls
//! the backend.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::vmctl::cloud::ComputeBackend;
use crate::vmctl::config::ControllerConfig;
use crate::vmctl::controller::dispatch::Dispatcher;
use crate::vmctl::controller::leader::{LeaderElector, LeaderSignal};
use crate::vmctl::controller::queue::RetryQueue;
use crate::vmctl::controller::reconcile::ReconcileEngine;
use crate::vmctl::controller::worker::WorkerPool;
use crate::vmctl::controller::ControllerError;
use crate::vmctl::k8s::event::EventRecorder;
use crate::vmctl::k8s::store::{Notification, ResourceStore};
use crate::vmctl::logger::{log_error, log_info, log_warn};
use crate::vmctl::observability::metrics::MetricsSink;

const MANAGER_COMPONENT: &str = "controller";

pub struct ControllerManager {
    store: Arc<dyn ResourceStore>,
    backend: Arc<dyn ComputeBackend>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<dyn MetricsSink>,
    config: ControllerConfig,
}

impl ControllerManager {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        backend: Arc<dyn ComputeBackend>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn MetricsSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            backend,
            recorder,
            metrics,
            config,
        }
    }

    /// Drives the elector and reacts to its signals until `shutdown` fires.
    /// On the way out the active term is stopped before the lease is
    /// released.
    pub async fn run(
        self,
        elector: LeaderElector,
        mut signals: mpsc::Receiver<LeaderSignal>,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError> {
        let identity = elector.identity().to_string();
        let elector_cancel = CancellationToken::new();
        let elector_task = tokio::spawn(elector.run(elector_cancel.clone()));

        let mut term: Option<LeaderTerm> = None;
        let mut result = Ok(());

        loop {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => signal,
            };
            match signal {
                Some(LeaderSignal::BecameLeader) => {
                    if term.is_some() {
                        continue;
                    }
                    self.metrics.set_leader(true);
                    let start = self.start_term();
                    tokio::pin!(start);
                    // Keep following shutdown and the elector while the cache
                    // syncs; either can abandon the start.
                    let started = loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break None,
                            started = &mut start => break Some(started),
                            signal = signals.recv() => match signal {
                                Some(LeaderSignal::NewLeader(leader)) => {
                                    observe_leader(&identity, &leader);
                                }
                                Some(LeaderSignal::BecameLeader) => {}
                                Some(LeaderSignal::LostLeadership) | None => break None,
                            },
                        }
                    };
                    match started {
                        Some(Ok(started)) => term = Some(started),
                        Some(Err(err)) => {
                            let error = err.to_string();
                            log_error(
                                MANAGER_COMPONENT,
                                "Failed to start controller",
                                &[("error", error.as_str())],
                            );
                            result = Err(err);
                            break;
                        }
                        None => {
                            log_info(MANAGER_COMPONENT, "Controller start abandoned", &[]);
                            self.metrics.set_leader(false);
                        }
                    }
                }
                Some(LeaderSignal::LostLeadership) => {
                    if let Some(active) = term.take() {
                        active.stop().await;
                    }
                    self.metrics.set_leader(false);
                }
                Some(LeaderSignal::NewLeader(leader)) => observe_leader(&identity, &leader),
                None => {
                    log_warn(MANAGER_COMPONENT, "Leader election ended unexpectedly", &[]);
                    break;
                }
            }
        }

        if let Some(active) = term.take() {
            active.stop().await;
        }
        self.metrics.set_leader(false);
        elector_cancel.cancel();
        // Drain signals so the elector never blocks on a full channel while
        // releasing.
        let drain = tokio::spawn(async move { while signals.recv().await.is_some() {} });
        if let Err(err) = elector_task.await {
            result = result.and(Err(ControllerError::Task(err.to_string())));
        }
        drain.abort();
        log_info(MANAGER_COMPONENT, "Controller stopped", &[]);
        result
    }

    /// Starts the workers once the cache has synced, then the ingestion
    /// task. Nothing is spawned until the sync wait is over, so dropping
    /// this future mid-wait leaves no task behind.
    async fn start_term(&self) -> Result<LeaderTerm, ControllerError> {
        let queue = RetryQueue::new(self.config.retry);
        let engine = Arc::new(ReconcileEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.backend),
            Arc::clone(&self.recorder),
        ));
        let pool = WorkerPool::start(
            self.config.workers,
            queue.clone(),
            engine,
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            self.config.cache_sync_timeout,
        )
        .await?;

        let dispatcher = Dispatcher::new(
            queue,
            Arc::clone(&self.backend),
            Arc::clone(&self.recorder),
            Arc::clone(&self.metrics),
        );
        let cancel = CancellationToken::new();
        let ingestion = tokio::spawn(ingest(
            Arc::clone(&self.store),
            dispatcher,
            cancel.clone(),
        ));

        log_info(MANAGER_COMPONENT, "Controller started", &[]);
        Ok(LeaderTerm {
            cancel,
            ingestion,
            pool,
        })
    }
}

fn observe_leader(identity: &str, leader: &str) {
    if leader != identity {
        log_info(MANAGER_COMPONENT, "Observed new leader", &[("leader", leader)]);
    }
}

/// Resources bound to one period of leadership.
struct LeaderTerm {
    cancel: CancellationToken,
    ingestion: JoinHandle<()>,
    pool: WorkerPool,
}

impl LeaderTerm {
    /// Stops ingestion, then the queue and workers. Returns once nothing
    /// from this term can reach the backend any more.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.ingestion.await {
            let error = err.to_string();
            log_error(
                MANAGER_COMPONENT,
                "Ingestion task ended abnormally",
                &[("error", error.as_str())],
            );
        }
        self.pool.stop().await;
        log_info(MANAGER_COMPONENT, "Controller term ended", &[]);
    }
}

/// Replays the current cache as additions, then follows the store's
/// notification stream until cancelled.
async fn ingest(store: Arc<dyn ResourceStore>, dispatcher: Dispatcher, cancel: CancellationToken) {
    let mut stream = BroadcastStream::new(store.subscribe());

    for vm in store.list() {
        if cancel.is_cancelled() {
            return;
        }
        dispatcher.dispatch(Notification::Added(vm)).await;
    }

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(notification)) => dispatcher.dispatch(notification).await,
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                let skipped = skipped.to_string();
                log_warn(
                    MANAGER_COMPONENT,
                    "Notification stream lagged; resyncing",
                    &[("skipped", skipped.as_str())],
                );
                dispatcher.resync(&store.list());
            }
            None => return,
        }
    }
}
