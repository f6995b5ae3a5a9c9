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

//! In-process fakes shared by unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::vmctl::cloud::{
    BackendError, BackendFuture, CheckResult, ComputeBackend, ServerStatus, ServerSummary,
};
use crate::vmctl::controller::leader::{
    InMemoryLeaseStore, LeaseError, LeaseFuture, LeaseRecord, LeaseStore, VersionedLease,
};
use crate::vmctl::k8s::store::NotificationKind;
use crate::vmctl::observability::metrics::{MetricsSink, ReconcileResult};

/// Every request the fake backend has served, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Check(String),
    List,
    Create(String),
    Status(String),
    Delete(String),
}

#[derive(Default)]
struct FakeBackendState {
    servers: Vec<ServerSummary>,
    cpu: HashMap<String, i64>,
    denied: HashSet<String>,
    calls: Vec<BackendCall>,
    next_id: u64,
    fail_checks: bool,
    fail_creates: bool,
    fail_status: bool,
    fail_deletes: bool,
}

/// Compute backend kept in memory. Clones share state.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeBackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeBackendState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn deny(&self, name: &str) {
        self.state().denied.insert(name.to_string());
    }

    /// Registers an existing server and returns its id.
    pub fn seed_server(&self, name: &str, cpu: i64) -> String {
        let mut state = self.state();
        state.cpu.insert(name.to_string(), cpu);
        insert_server(&mut state, name)
    }

    /// Utilization reported for `name`, now or once it is created.
    pub fn set_cpu(&self, name: &str, cpu: i64) {
        self.state().cpu.insert(name.to_string(), cpu);
    }

    pub fn servers_named(&self, name: &str) -> usize {
        self.state()
            .servers
            .iter()
            .filter(|server| server.name == name)
            .count()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn fail_checks(&self, fail: bool) {
        self.state().fail_checks = fail;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state().fail_creates = fail;
    }

    pub fn fail_status(&self, fail: bool) {
        self.state().fail_status = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state().fail_deletes = fail;
    }
}

fn insert_server(state: &mut FakeBackendState, name: &str) -> String {
    state.next_id += 1;
    let id = format!("srv-{}", state.next_id);
    state.servers.push(ServerSummary {
        id: id.clone(),
        name: name.to_string(),
    });
    id
}

fn find_id(state: &FakeBackendState, name: &str) -> Result<String, BackendError> {
    crate::vmctl::cloud::find_server_id(&state.servers, name)
}

impl ComputeBackend for FakeBackend {
    fn check<'a>(&'a self, name: &'a str) -> BackendFuture<'a, CheckResult> {
        Box::pin(async move {
            let mut state = self.state();
            state.calls.push(BackendCall::Check(name.to_string()));
            if state.fail_checks {
                return Err(BackendError::Transport("connection refused".to_string()));
            }
            if state.denied.contains(name) {
                Ok(CheckResult::Denied)
            } else if state.servers.iter().any(|server| server.name == name) {
                Ok(CheckResult::Exists)
            } else {
                Ok(CheckResult::Absent)
            }
        })
    }

    fn list_servers<'a>(&'a self) -> BackendFuture<'a, Vec<ServerSummary>> {
        Box::pin(async move {
            let mut state = self.state();
            state.calls.push(BackendCall::List);
            Ok(state.servers.clone())
        })
    }

    fn create_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            state.calls.push(BackendCall::Create(name.to_string()));
            if state.fail_creates {
                return Err(BackendError::UnexpectedStatus {
                    operation: "create server",
                    status: 500,
                });
            }
            insert_server(&mut state, name);
            Ok(())
        })
    }

    fn server_status<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ServerStatus> {
        Box::pin(async move {
            let mut state = self.state();
            state.calls.push(BackendCall::Status(name.to_string()));
            if state.fail_status {
                return Err(BackendError::Transport("status endpoint timed out".to_string()));
            }
            let id = find_id(&state, name)?;
            let cpu_utilization = state.cpu.get(name).copied().unwrap_or(0);
            Ok(ServerStatus {
                id,
                cpu_utilization,
            })
        })
    }

    fn delete_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            state.calls.push(BackendCall::Delete(name.to_string()));
            if state.fail_deletes {
                return Err(BackendError::UnexpectedStatus {
                    operation: "delete server",
                    status: 500,
                });
            }
            let id = find_id(&state, name)?;
            state.servers.retain(|server| server.id != id);
            Ok(())
        })
    }
}

#[derive(Deserialize)]
struct CreateServerBody {
    name: String,
}

async fn http_check(State(backend): State<FakeBackend>, Path(name): Path<String>) -> StatusCode {
    match backend.check(&name).await {
        Ok(CheckResult::Exists) => StatusCode::OK,
        Ok(CheckResult::Denied) => StatusCode::FORBIDDEN,
        _ => StatusCode::NOT_FOUND,
    }
}

async fn http_list(State(backend): State<FakeBackend>) -> Json<Vec<ServerSummary>> {
    let mut state = backend.state();
    state.calls.push(BackendCall::List);
    Json(state.servers.clone())
}

async fn http_create(
    State(backend): State<FakeBackend>,
    Json(body): Json<CreateServerBody>,
) -> StatusCode {
    match backend.create_server(&body.name).await {
        Ok(()) => StatusCode::CREATED,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn http_status(State(backend): State<FakeBackend>, Path(id): Path<String>) -> Response {
    let mut state = backend.state();
    let name = state
        .servers
        .iter()
        .find(|server| server.id == id)
        .map(|server| server.name.clone());
    let Some(name) = name else {
        return StatusCode::NOT_FOUND.into_response();
    };
    state.calls.push(BackendCall::Status(name.clone()));
    if state.fail_status {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let cpu = state.cpu.get(&name).copied().unwrap_or(0);
    Json(json!({ "cpuUtilization": cpu })).into_response()
}

async fn http_delete(State(backend): State<FakeBackend>, Path(id): Path<String>) -> StatusCode {
    let mut state = backend.state();
    let Some(position) = state.servers.iter().position(|server| server.id == id) else {
        return StatusCode::NOT_FOUND;
    };
    let name = state.servers[position].name.clone();
    state.calls.push(BackendCall::Delete(name));
    if state.fail_deletes {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.servers.remove(position);
    StatusCode::NO_CONTENT
}

/// Serves a [`FakeBackend`] over the compute backend's REST protocol on a
/// loopback port.
pub struct FakeCloudServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl FakeCloudServer {
    pub async fn start(backend: FakeBackend) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = Router::new()
            .route("/check/:name", get(http_check))
            .route("/servers", get(http_list).post(http_create))
            .route("/servers/:id/status", get(http_status))
            .route("/servers/:id", axum::routing::delete(http_delete))
            .with_state(backend);
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
        });
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Metrics sink that only counts.
#[derive(Default)]
pub struct CountingMetrics {
    notifications: Mutex<HashMap<NotificationKind, u64>>,
    reconciles: Mutex<HashMap<ReconcileResult, u64>>,
    retries: AtomicU64,
    depth: AtomicUsize,
    leading: AtomicBool,
}

impl CountingMetrics {
    pub fn notifications(&self, kind: NotificationKind) -> u64 {
        let counts = self
            .notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn reconciles(&self, result: ReconcileResult) -> u64 {
        let counts = self
            .reconciles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counts.get(&result).copied().unwrap_or(0)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }
}

impl MetricsSink for CountingMetrics {
    fn record_notification(&self, kind: NotificationKind) {
        let mut counts = self
            .notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(kind).or_insert(0) += 1;
    }

    fn record_reconcile(&self, result: ReconcileResult) {
        let mut counts = self
            .reconciles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(result).or_insert(0) += 1;
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn set_queue_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    fn set_leader(&self, leading: bool) {
        self.leading.store(leading, Ordering::SeqCst);
    }
}

/// Lease store that can be switched into an unreachable state.
#[derive(Clone, Default)]
pub struct FlakyLeaseStore {
    inner: InMemoryLeaseStore,
    unavailable: Arc<AtomicBool>,
}

impl FlakyLeaseStore {
    pub fn new(inner: InMemoryLeaseStore) -> Self {
        Self {
            inner,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LeaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LeaseError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

impl LeaseStore for FlakyLeaseStore {
    fn get(&self) -> LeaseFuture<'_, Option<VersionedLease>> {
        Box::pin(async move {
            self.check()?;
            self.inner.get().await
        })
    }

    fn create(&self, record: LeaseRecord) -> LeaseFuture<'_, VersionedLease> {
        Box::pin(async move {
            self.check()?;
            self.inner.create(record).await
        })
    }

    fn update(
        &self,
        record: LeaseRecord,
        expected_version: u64,
    ) -> LeaseFuture<'_, VersionedLease> {
        Box::pin(async move {
            self.check()?;
            self.inner.update(record, expected_version).await
        })
    }
}
