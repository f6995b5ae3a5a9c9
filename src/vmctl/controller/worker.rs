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

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::vmctl::controller::queue::RetryQueue;
use crate::vmctl::controller::reconcile::{ReconcileOutcome, Reconciler};
use crate::vmctl::controller::ControllerError;
use crate::vmctl::k8s::store::ResourceStore;
use crate::vmctl::logger::{log_debug, log_error, log_info, log_warn};
use crate::vmctl::observability::metrics::{MetricsSink, ReconcileResult};

const WORKER_COMPONENT: &str = "worker";
pub const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Fixed set of tasks draining a [`RetryQueue`].
pub struct WorkerPool {
    queue: RetryQueue,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Waits for `store` to finish its initial sync, then spawns `workers`
    /// tasks. Fails if the store is still unsynced after `sync_timeout`.
    pub async fn start(
        workers: usize,
        queue: RetryQueue,
        reconciler: Arc<dyn Reconciler>,
        store: Arc<dyn ResourceStore>,
        metrics: Arc<dyn MetricsSink>,
        sync_timeout: Duration,
    ) -> Result<Self, ControllerError> {
        wait_for_cache_sync(store.as_ref(), sync_timeout).await?;

        let count = workers.max(1);
        let handles = (0..count)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    queue.clone(),
                    Arc::clone(&reconciler),
                    Arc::clone(&metrics),
                ))
            })
            .collect();

        let count = count.to_string();
        log_info(WORKER_COMPONENT, "Started workers", &[("count", count.as_str())]);
        Ok(Self { queue, handles })
    }

    /// Shuts the queue down and returns once every worker has finished its
    /// current key. Keys still pending are not reconciled.
    pub async fn stop(self) {
        self.queue.shutdown();
        for handle in self.handles {
            if let Err(err) = handle.await {
                let error = err.to_string();
                log_error(
                    WORKER_COMPONENT,
                    "Worker task ended abnormally",
                    &[("error", error.as_str())],
                );
            }
        }
        log_info(WORKER_COMPONENT, "Stopped workers", &[]);
    }
}

async fn wait_for_cache_sync(
    store: &dyn ResourceStore,
    sync_timeout: Duration,
) -> Result<(), ControllerError> {
    let deadline = Instant::now() + sync_timeout;
    while !store.has_synced() {
        if Instant::now() >= deadline {
            return Err(ControllerError::CacheSyncTimeout(sync_timeout));
        }
        sleep(CACHE_SYNC_POLL).await;
    }
    Ok(())
}

async fn run_worker(
    id: usize,
    queue: RetryQueue,
    reconciler: Arc<dyn Reconciler>,
    metrics: Arc<dyn MetricsSink>,
) {
    let worker = id.to_string();
    while let Some(key) = queue.dequeue().await {
        metrics.set_queue_depth(queue.len());

        let outcome = AssertUnwindSafe(reconciler.reconcile(&key))
            .catch_unwind()
            .await;

        match outcome {
            Ok(ReconcileOutcome::Converged) => {
                queue.clear_backoff(&key);
                metrics.record_reconcile(ReconcileResult::Converged);
                log_debug(
                    WORKER_COMPONENT,
                    "Key converged",
                    &[("worker", worker.as_str()), ("key", key.as_str())],
                );
            }
            Ok(ReconcileOutcome::Dropped(reason)) => {
                queue.clear_backoff(&key);
                metrics.record_reconcile(ReconcileResult::Dropped);
                let reason = reason.to_string();
                log_info(
                    WORKER_COMPONENT,
                    "Dropped key",
                    &[("key", key.as_str()), ("reason", reason.as_str())],
                );
            }
            Ok(ReconcileOutcome::Retry(err)) => {
                queue.schedule_retry(&key);
                metrics.record_retry();
                metrics.record_reconcile(ReconcileResult::Retry);
                let error = err.to_string();
                let attempt = queue.retries(&key).to_string();
                log_warn(
                    WORKER_COMPONENT,
                    "Reconcile failed; retrying with backoff",
                    &[
                        ("key", key.as_str()),
                        ("attempt", attempt.as_str()),
                        ("error", error.as_str()),
                    ],
                );
            }
            Err(_) => {
                log_error(
                    WORKER_COMPONENT,
                    "Reconcile panicked; retrying with backoff",
                    &[("worker", worker.as_str()), ("key", key.as_str())],
                );
                queue.schedule_retry(&key);
                metrics.record_retry();
                metrics.record_reconcile(ReconcileResult::Panicked);
            }
        }

        queue.mark_done(&key);
    }
    log_debug(WORKER_COMPONENT, "Worker exiting", &[("worker", worker.as_str())]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmctl::controller::queue::RetryPolicy;
    use crate::vmctl::controller::reconcile::{ReconcileError, ReconcileFuture};
    use crate::vmctl::k8s::store::{InMemoryResourceStore, StoreError};
    use crate::vmctl::test_support::CountingMetrics;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails a key a fixed number of times, panics on keys starting with
    /// `panic`, and tracks how many calls run at once per key.
    #[derive(Default)]
    struct ScriptedReconciler {
        failures_left: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
        in_flight: Mutex<HashMap<String, usize>>,
        overlap: AtomicUsize,
        extra_delay: Duration,
    }

    impl ScriptedReconciler {
        fn failing(key: &str, times: u32) -> Self {
            let reconciler = Self::default();
            reconciler
                .failures_left
                .lock()
                .unwrap()
                .insert(key.to_string(), times);
            reconciler
        }

        fn slow(extra_delay: Duration) -> Self {
            Self {
                extra_delay,
                ..Self::default()
            }
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls_for(&self, key: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
        }
    }

    impl Reconciler for ScriptedReconciler {
        fn reconcile<'a>(&'a self, key: &'a str) -> ReconcileFuture<'a> {
            Box::pin(async move {
                {
                    let mut in_flight = self.in_flight.lock().unwrap();
                    let count = in_flight.entry(key.to_string()).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        self.overlap.fetch_add(1, Ordering::SeqCst);
                    }
                }
                self.calls.lock().unwrap().push(key.to_string());
                sleep(Duration::from_millis(5) + self.extra_delay).await;
                *self
                    .in_flight
                    .lock()
                    .unwrap()
                    .get_mut(key)
                    .expect("in flight") -= 1;

                if key.starts_with("panic") {
                    panic!("scripted panic for {key}");
                }
                let mut failures = self.failures_left.lock().unwrap();
                match failures.get_mut(key) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        ReconcileOutcome::Retry(ReconcileError::Store(StoreError::Unavailable(
                            "scripted".to_string(),
                        )))
                    }
                    _ => ReconcileOutcome::Converged,
                }
            })
        }
    }

    fn synced_store() -> Arc<dyn ResourceStore> {
        let store = InMemoryResourceStore::new();
        store.mark_synced();
        Arc::new(store)
    }

    fn fast_queue() -> RetryQueue {
        RetryQueue::new(RetryPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_then_clears_backoff() {
        let queue = fast_queue();
        let reconciler = Arc::new(ScriptedReconciler::failing("default/a", 3));
        let metrics = Arc::new(CountingMetrics::default());
        let pool = WorkerPool::start(
            2,
            queue.clone(),
            reconciler.clone(),
            synced_store(),
            metrics.clone(),
            Duration::from_secs(1),
        )
        .await
        .expect("start");

        queue.enqueue("default/a");
        sleep(Duration::from_millis(500)).await;
        pool.stop().await;

        assert_eq!(reconciler.calls_for("default/a"), 4);
        assert_eq!(queue.retries("default/a"), 0);
        assert_eq!(metrics.retries(), 3);
        assert_eq!(metrics.reconciles(ReconcileResult::Converged), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_is_contained_and_rescheduled() {
        let queue = fast_queue();
        let reconciler = Arc::new(ScriptedReconciler::default());
        let metrics = Arc::new(CountingMetrics::default());
        let pool = WorkerPool::start(
            1,
            queue.clone(),
            reconciler.clone(),
            synced_store(),
            metrics.clone(),
            Duration::from_secs(1),
        )
        .await
        .expect("start");

        queue.enqueue("panic/a");
        queue.enqueue("default/b");
        sleep(Duration::from_millis(300)).await;

        assert!(reconciler.calls_for("panic/a") >= 2, "panicking key is retried");
        assert_eq!(reconciler.calls_for("default/b"), 1, "worker survives the panic");
        assert!(metrics.reconciles(ReconcileResult::Panicked) >= 1);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn one_key_is_never_processed_twice_at_once() {
        let queue = fast_queue();
        let reconciler = Arc::new(ScriptedReconciler::default());
        let pool = WorkerPool::start(
            4,
            queue.clone(),
            reconciler.clone(),
            synced_store(),
            Arc::new(CountingMetrics::default()),
            Duration::from_secs(1),
        )
        .await
        .expect("start");

        for _ in 0..20 {
            queue.enqueue("default/hot");
            queue.enqueue("default/other");
            sleep(Duration::from_millis(2)).await;
        }
        sleep(Duration::from_millis(500)).await;
        pool.stop().await;

        assert_eq!(reconciler.overlap.load(Ordering::SeqCst), 0);
        assert!(reconciler.calls_for("default/hot") >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_skips_pending_keys() {
        let queue = fast_queue();
        let reconciler = Arc::new(ScriptedReconciler::slow(Duration::from_secs(1)));
        let pool = WorkerPool::start(
            1,
            queue.clone(),
            reconciler.clone(),
            synced_store(),
            Arc::new(CountingMetrics::default()),
            Duration::from_secs(1),
        )
        .await
        .expect("start");

        for i in 0..10 {
            queue.enqueue(&format!("default/vm-{i}"));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(reconciler.total_calls(), 1);

        let started = Instant::now();
        pool.stop().await;

        assert_eq!(reconciler.total_calls(), 1, "no reconcile starts after stop");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn start_fails_when_cache_never_syncs() {
        let store: Arc<dyn ResourceStore> = Arc::new(InMemoryResourceStore::new());
        let result = WorkerPool::start(
            1,
            fast_queue(),
            Arc::new(ScriptedReconciler::default()),
            store,
            Arc::new(CountingMetrics::default()),
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(result, Err(ControllerError::CacheSyncTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_joins_idle_workers() {
        let queue = fast_queue();
        let pool = WorkerPool::start(
            3,
            queue.clone(),
            Arc::new(ScriptedReconciler::default()),
            synced_store(),
            Arc::new(CountingMetrics::default()),
            Duration::from_secs(1),
        )
        .await
        .expect("start");
        pool.stop().await;
        assert!(queue.is_shutting_down());
    }
}
