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

//! Convergence step for a single VirtualMachine key.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::vmctl::cloud::{BackendError, CheckResult, ComputeBackend};
use crate::vmctl::k8s::event::{
    EventKind, EventRecorder, MESSAGE_SYNCED, REASON_CREATED, REASON_CREATE_FAILED,
    REASON_INVALID_SPEC, REASON_PROHIBITED, REASON_SYNCED, REASON_SYNC_FAILED,
};
use crate::vmctl::k8s::store::{split_key, ResourceStore, StoreError};
use crate::vmctl::k8s::vm::VirtualMachine;
use crate::vmctl::logger::{log_debug, log_info, log_warn};
use crate::vmctl::observability::tracing::with_span;

const RECONCILE_COMPONENT: &str = "controller";

/// Why a key was dropped without retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    MalformedKey(String),
    NotFound,
    InvalidSpec,
    Prohibited,
    CreateFailed(BackendError),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MalformedKey(key) => write!(f, "malformed key '{key}'"),
            DropReason::NotFound => write!(f, "resource no longer exists"),
            DropReason::InvalidSpec => write!(f, "spec.backendName is empty"),
            DropReason::Prohibited => write!(f, "backend name is on the deny list"),
            DropReason::CreateFailed(err) => write!(f, "server creation failed: {err}"),
        }
    }
}

/// Transient failure that warrants another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    Check(BackendError),
    Status(BackendError),
    Store(StoreError),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Check(err) => write!(f, "name check failed: {err}"),
            ReconcileError::Status(err) => write!(f, "status lookup failed: {err}"),
            ReconcileError::Store(err) => write!(f, "resource store failed: {err}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Converged,
    Dropped(DropReason),
    Retry(ReconcileError),
}

pub type ReconcileFuture<'a> = Pin<Box<dyn Future<Output = ReconcileOutcome> + Send + 'a>>;

/// Anything the worker pool can drive with a work key.
pub trait Reconciler: Send + Sync {
    fn reconcile<'a>(&'a self, key: &'a str) -> ReconcileFuture<'a>;
}

pub struct ReconcileEngine {
    store: Arc<dyn ResourceStore>,
    backend: Arc<dyn ComputeBackend>,
    recorder: Arc<dyn EventRecorder>,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        backend: Arc<dyn ComputeBackend>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            store,
            backend,
            recorder,
        }
    }

    pub async fn reconcile_key(&self, key: &str) -> ReconcileOutcome {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(_) => {
                log_warn(RECONCILE_COMPONENT, "Dropping malformed key", &[("key", key)]);
                return ReconcileOutcome::Dropped(DropReason::MalformedKey(key.to_string()));
            }
        };

        let vm = match self.store.get(&namespace, &name) {
            Ok(Some(vm)) => vm,
            Ok(None) => {
                log_debug(
                    RECONCILE_COMPONENT,
                    "Resource vanished before reconcile",
                    &[("key", key)],
                );
                return ReconcileOutcome::Dropped(DropReason::NotFound);
            }
            Err(err) => return ReconcileOutcome::Retry(ReconcileError::Store(err)),
        };

        let backend_name = vm.spec.backend_name.trim().to_string();
        if backend_name.is_empty() {
            self.recorder.record(
                &vm,
                EventKind::Warning,
                REASON_INVALID_SPEC,
                "spec.backendName must be set",
            );
            return ReconcileOutcome::Dropped(DropReason::InvalidSpec);
        }

        match self.backend.check(&backend_name).await {
            Ok(CheckResult::Exists) => {}
            Ok(CheckResult::Denied) => {
                let message = format!("backend name '{backend_name}' is prohibited");
                self.recorder
                    .record(&vm, EventKind::Warning, REASON_PROHIBITED, &message);
                return ReconcileOutcome::Dropped(DropReason::Prohibited);
            }
            Ok(CheckResult::Absent) => {
                if let Err(err) = self.backend.create_server(&backend_name).await {
                    let message = format!("failed to create server '{backend_name}': {err}");
                    self.recorder
                        .record(&vm, EventKind::Warning, REASON_CREATE_FAILED, &message);
                    return ReconcileOutcome::Dropped(DropReason::CreateFailed(err));
                }
                let message = format!("created server '{backend_name}'");
                self.recorder
                    .record(&vm, EventKind::Normal, REASON_CREATED, &message);
            }
            Err(err) => return self.retry(&vm, ReconcileError::Check(err)),
        }

        let observed = match self.backend.server_status(&backend_name).await {
            Ok(status) => status,
            Err(err) => return self.retry(&vm, ReconcileError::Status(err)),
        };

        if let Err(err) = self.write_status(&vm, &observed.id, observed.cpu_utilization).await {
            return self.retry(&vm, ReconcileError::Store(err));
        }

        self.recorder
            .record(&vm, EventKind::Normal, REASON_SYNCED, MESSAGE_SYNCED);
        ReconcileOutcome::Converged
    }

    fn retry(&self, vm: &VirtualMachine, err: ReconcileError) -> ReconcileOutcome {
        self.recorder
            .record(vm, EventKind::Warning, REASON_SYNC_FAILED, &err.to_string());
        ReconcileOutcome::Retry(err)
    }

    /// Writes a copy of `vm` carrying the observed status. An unchanged
    /// status is not written so the store raises no follow-up notification.
    async fn write_status(
        &self,
        vm: &VirtualMachine,
        backend_id: &str,
        cpu_utilization: i64,
    ) -> Result<(), StoreError> {
        if vm.status.backend_id == backend_id && vm.status.cpu_utilization == cpu_utilization {
            return Ok(());
        }
        let updated = vm.with_status(backend_id, cpu_utilization);
        self.store.update(updated).await?;
        let cpu = cpu_utilization.to_string();
        log_info(
            RECONCILE_COMPONENT,
            "Updated VirtualMachine status",
            &[
                ("name", vm.name().unwrap_or_default()),
                ("backend_id", backend_id),
                ("cpu_utilization", cpu.as_str()),
            ],
        );
        Ok(())
    }
}

impl Reconciler for ReconcileEngine {
    fn reconcile<'a>(&'a self, key: &'a str) -> ReconcileFuture<'a> {
        Box::pin(with_span(
            RECONCILE_COMPONENT,
            format!("reconcile {key}"),
            self.reconcile_key(key),
        ))
    }
}
