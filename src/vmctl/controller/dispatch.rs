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

//! Fan-in for store notifications. Adds and updates become queue keys;
//! deletions are handled inline because the object is already gone from the
//! cache and a reconcile would only see "not found".

use std::sync::Arc;

use crate::vmctl::cloud::ComputeBackend;
use crate::vmctl::controller::queue::RetryQueue;
use crate::vmctl::k8s::event::{EventKind, EventRecorder, REASON_DELETE_FAILED};
use crate::vmctl::k8s::store::{key_for, Notification};
use crate::vmctl::k8s::vm::VirtualMachine;
use crate::vmctl::logger::{log_debug, log_error, log_info, log_warn};
use crate::vmctl::observability::metrics::MetricsSink;

const DISPATCH_COMPONENT: &str = "dispatch";

#[derive(Clone)]
pub struct Dispatcher {
    queue: RetryQueue,
    backend: Arc<dyn ComputeBackend>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(
        queue: RetryQueue,
        backend: Arc<dyn ComputeBackend>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            queue,
            backend,
            recorder,
            metrics,
        }
    }

    pub async fn dispatch(&self, notification: Notification) {
        self.metrics.record_notification(notification.kind());
        match notification {
            Notification::Added(vm) | Notification::Updated { new: vm, .. } => self.enqueue(&vm),
            Notification::Deleted(vm) => self.delete(&vm).await,
        }
    }

    /// Re-queues every object without counting it as a notification. Used
    /// after the subscription fell behind and changes may have been missed.
    pub fn resync(&self, objects: &[VirtualMachine]) {
        for vm in objects {
            self.enqueue(vm);
        }
    }

    fn enqueue(&self, vm: &VirtualMachine) {
        match key_for(vm) {
            Ok(key) => {
                log_debug(DISPATCH_COMPONENT, "Enqueueing key", &[("key", key.as_str())]);
                self.queue.enqueue(&key);
                self.metrics.set_queue_depth(self.queue.len());
            }
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    DISPATCH_COMPONENT,
                    "Ignoring notification for unnamed object",
                    &[("error", error.as_str())],
                );
            }
        }
    }

    /// One-shot backend deletion. Failures are reported, never retried.
    async fn delete(&self, vm: &VirtualMachine) {
        let key = key_for(vm).unwrap_or_default();
        let backend_name = vm.spec.backend_name.trim();
        if backend_name.is_empty() {
            log_debug(
                DISPATCH_COMPONENT,
                "Deleted object had no backend server",
                &[("key", key.as_str())],
            );
            return;
        }

        match self.backend.delete_server(backend_name).await {
            Ok(()) => log_info(
                DISPATCH_COMPONENT,
                "Deleted backend server",
                &[("key", key.as_str()), ("backend_name", backend_name)],
            ),
            Err(err) => {
                let error = err.to_string();
                log_error(
                    DISPATCH_COMPONENT,
                    "Failed to delete backend server",
                    &[
                        ("key", key.as_str()),
                        ("backend_name", backend_name),
                        ("error", error.as_str()),
                    ],
                );
                let message = format!("failed to delete server '{backend_name}': {err}");
                self.recorder
                    .record(vm, EventKind::Warning, REASON_DELETE_FAILED, &message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmctl::k8s::event::InMemoryEventRecorder;
    use crate::vmctl::k8s::store::NotificationKind;
    use crate::vmctl::test_support::{BackendCall, CountingMetrics, FakeBackend};

    fn dispatcher() -> (Dispatcher, RetryQueue, FakeBackend, InMemoryEventRecorder, Arc<CountingMetrics>) {
        let queue = RetryQueue::default();
        let backend = FakeBackend::new();
        let recorder = InMemoryEventRecorder::new();
        let metrics = Arc::new(CountingMetrics::default());
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(backend.clone()),
            Arc::new(recorder.clone()),
            metrics.clone(),
        );
        (dispatcher, queue, backend, recorder, metrics)
    }

    #[tokio::test]
    async fn adds_and_updates_enqueue_the_key() {
        let (dispatcher, queue, backend, _, metrics) = dispatcher();
        let vm = VirtualMachine::new("team", "vm1", "alice");

        dispatcher.dispatch(Notification::Added(vm.clone())).await;
        dispatcher
            .dispatch(Notification::Updated {
                old: vm.clone(),
                new: vm.clone(),
            })
            .await;

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await.as_deref(), Some("team/vm1"));
        assert!(backend.calls().is_empty());
        assert_eq!(metrics.notifications(NotificationKind::Added), 1);
        assert_eq!(metrics.notifications(NotificationKind::Updated), 1);
    }

    #[tokio::test]
    async fn delete_removes_backend_server_without_queueing() {
        let (dispatcher, queue, backend, _, metrics) = dispatcher();
        backend.seed_server("alice", 10);

        dispatcher
            .dispatch(Notification::Deleted(VirtualMachine::new("default", "vm1", "alice")))
            .await;

        assert!(queue.is_empty());
        assert_eq!(backend.servers_named("alice"), 0);
        assert!(backend
            .calls()
            .contains(&BackendCall::Delete("alice".to_string())));
        assert_eq!(metrics.notifications(NotificationKind::Deleted), 1);
    }

    #[tokio::test]
    async fn failed_delete_is_reported_once() {
        let (dispatcher, queue, backend, recorder, _) = dispatcher();

        dispatcher
            .dispatch(Notification::Deleted(VirtualMachine::new("default", "vm1", "ghost")))
            .await;

        assert!(queue.is_empty());
        let events = recorder.events_for("default", "vm1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, REASON_DELETE_FAILED);
        assert_eq!(events[0].kind, EventKind::Warning);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn resync_enqueues_without_counting() {
        let (dispatcher, queue, _, _, metrics) = dispatcher();
        dispatcher.resync(&[
            VirtualMachine::new("default", "vm1", "alice"),
            VirtualMachine::new("default", "vm2", "bob"),
        ]);
        assert_eq!(queue.len(), 2);
        assert_eq!(metrics.notifications(NotificationKind::Added), 0);
    }

    #[tokio::test]
    async fn delete_without_backend_name_skips_backend() {
        let (dispatcher, _, backend, recorder, _) = dispatcher();
        dispatcher
            .dispatch(Notification::Deleted(VirtualMachine::new("default", "vm1", "")))
            .await;
        assert!(backend.calls().is_empty());
        assert!(recorder.events().is_empty());
    }
}
