use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use vmctl::vmctl::cloud::HttpComputeBackend;
use vmctl::vmctl::config::ControllerConfig;
use vmctl::vmctl::controller::leader::{InMemoryLeaseStore, LeaderElector};
use vmctl::vmctl::controller::reconcile::{DropReason, ReconcileEngine, ReconcileOutcome};
use vmctl::vmctl::controller::{ControllerError, ControllerManager, RetryPolicy};
use vmctl::vmctl::k8s::event::{
    EventKind, InMemoryEventRecorder, REASON_DELETE_FAILED, REASON_INVALID_SPEC,
    REASON_PROHIBITED, REASON_SYNCED,
};
use vmctl::vmctl::k8s::store::{InMemoryResourceStore, ResourceStore};
use vmctl::vmctl::k8s::vm::VirtualMachine;
use vmctl::vmctl::observability::metrics::ReconcileResult;
use vmctl::vmctl::test_support::{BackendCall, CountingMetrics, FakeBackend, FakeCloudServer};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

struct Harness {
    store: InMemoryResourceStore,
    backend: FakeBackend,
    recorder: InMemoryEventRecorder,
    metrics: Arc<CountingMetrics>,
    server: FakeCloudServer,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ControllerError>>,
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        retry: RetryPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(200),
        },
        cache_sync_timeout: Duration::from_secs(5),
        ..ControllerConfig::default()
    }
}

async fn start(backend: FakeBackend, seed: Vec<VirtualMachine>) -> Harness {
    let server = FakeCloudServer::start(backend.clone())
        .await
        .expect("fake cloud");
    let client = HttpComputeBackend::new(&server.base_url(), Duration::from_secs(5))
        .expect("client");

    let store = InMemoryResourceStore::new();
    for vm in seed {
        store.apply(vm).expect("seed");
    }
    store.mark_synced();

    let recorder = InMemoryEventRecorder::new();
    let metrics = Arc::new(CountingMetrics::default());
    let config = test_config();
    let (elector, signals) =
        LeaderElector::new("scenario", Arc::new(InMemoryLeaseStore::new()), config.lease);
    let manager = ControllerManager::new(
        Arc::new(store.clone()),
        Arc::new(client),
        Arc::new(recorder.clone()),
        metrics.clone(),
        config,
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(manager.run(elector, signals, shutdown.clone()));

    Harness {
        store,
        backend,
        recorder,
        metrics,
        server,
        shutdown,
        task,
    }
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        self.task
            .await
            .expect("manager task")
            .expect("manager result");
        self.server.stop().await;
    }

    fn has_event(&self, name: &str, reason: &str) -> bool {
        self.recorder
            .events_for("default", name)
            .iter()
            .any(|event| event.reason == reason)
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn count(backend: &FakeBackend, matches: impl Fn(&BackendCall) -> bool) -> usize {
    backend.calls().iter().filter(|call| matches(call)).count()
}

#[tokio::test]
async fn missing_server_is_created_once_and_status_recorded() {
    let backend = FakeBackend::new();
    backend.set_cpu("alice", 63);
    let h = start(
        backend,
        vec![VirtualMachine::new("default", "vm-a", "alice")],
    )
    .await;

    wait_until("vm-a synced", || h.has_event("vm-a", REASON_SYNCED)).await;
    let stored = h.store.get("default", "vm-a").unwrap().unwrap();
    assert_eq!(stored.status.cpu_utilization, 63);
    assert!(!stored.status.backend_id.is_empty());
    assert_eq!(stored.spec.backend_name, "alice");

    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        count(&h.backend, |call| matches!(call, BackendCall::Create(_))),
        1
    );
    assert_eq!(h.backend.servers_named("alice"), 1);
    h.stop().await;
}

#[tokio::test]
async fn single_pass_issues_one_create_and_one_status() {
    let backend = FakeBackend::new();
    let server = FakeCloudServer::start(backend.clone()).await.expect("server");
    let client =
        HttpComputeBackend::new(&server.base_url(), Duration::from_secs(5)).expect("client");
    let store = InMemoryResourceStore::new();
    store
        .apply(VirtualMachine::new("default", "vm-a", "alice"))
        .expect("seed");
    let engine = ReconcileEngine::new(
        Arc::new(store.clone()),
        Arc::new(client),
        Arc::new(InMemoryEventRecorder::new()),
    );

    assert_eq!(
        engine.reconcile_key("default/vm-a").await,
        ReconcileOutcome::Converged
    );
    let calls = backend.calls();
    assert_eq!(
        calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Create(_)))
            .count(),
        1
    );
    assert_eq!(
        calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Status(_)))
            .count(),
        1
    );
    server.stop().await;
}

#[tokio::test]
async fn empty_backend_name_never_reaches_backend() {
    let h = start(
        FakeBackend::new(),
        vec![VirtualMachine::new("default", "vm-b", "")],
    )
    .await;

    wait_until("InvalidSpec event", || h.has_event("vm-b", REASON_INVALID_SPEC)).await;
    sleep(Duration::from_millis(200)).await;
    assert!(h.backend.calls().is_empty());
    let stored = h.store.get("default", "vm-b").unwrap().unwrap();
    assert_eq!(stored.status, Default::default());
    h.stop().await;
}

#[tokio::test]
async fn denied_name_is_never_created() {
    let backend = FakeBackend::new();
    backend.deny("blocked");
    let h = start(
        backend,
        vec![VirtualMachine::new("default", "vm-c", "blocked")],
    )
    .await;

    wait_until("Prohibited event", || h.has_event("vm-c", REASON_PROHIBITED)).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        count(&h.backend, |call| matches!(call, BackendCall::Create(_))),
        0
    );
    assert_eq!(h.metrics.reconciles(ReconcileResult::Dropped), 1);
    h.stop().await;
}

#[tokio::test]
async fn deletion_removes_server_once() {
    let backend = FakeBackend::new();
    let h = start(
        backend,
        vec![VirtualMachine::new("default", "vm-d", "dave")],
    )
    .await;
    wait_until("vm-d synced", || h.has_event("vm-d", REASON_SYNCED)).await;
    // Let the reconcile triggered by the status write finish first.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.backend.servers_named("dave"), 1);

    h.store.remove("default", "vm-d").expect("remove");
    wait_until("server deleted", || h.backend.servers_named("dave") == 0).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        count(&h.backend, |call| *call == BackendCall::Delete("dave".to_string())),
        1
    );
    h.stop().await;
}

#[tokio::test]
async fn failed_deletion_is_not_retried() {
    let backend = FakeBackend::new();
    let h = start(
        backend,
        vec![VirtualMachine::new("default", "vm-d", "dave")],
    )
    .await;
    wait_until("vm-d synced", || h.has_event("vm-d", REASON_SYNCED)).await;
    // Let the reconcile triggered by the status write finish first.
    sleep(Duration::from_millis(200)).await;

    h.backend.fail_deletes(true);
    h.store.remove("default", "vm-d").expect("remove");
    wait_until("DeleteFailed event", || {
        h.has_event("vm-d", REASON_DELETE_FAILED)
    })
    .await;
    sleep(Duration::from_millis(500)).await;

    assert_eq!(
        count(&h.backend, |call| matches!(call, BackendCall::Delete(_))),
        1
    );
    assert_eq!(h.backend.servers_named("dave"), 1);
    let warning = h
        .recorder
        .events_for("default", "vm-d")
        .into_iter()
        .find(|event| event.reason == REASON_DELETE_FAILED)
        .expect("warning");
    assert_eq!(warning.kind, EventKind::Warning);
    h.stop().await;
}

#[tokio::test]
async fn transient_status_failures_back_off_then_converge() {
    let backend = FakeBackend::new();
    backend.seed_server("erin", 12);
    backend.fail_status(true);
    let h = start(
        backend,
        vec![VirtualMachine::new("default", "vm-e", "erin")],
    )
    .await;

    wait_until("three retries", || h.metrics.retries() >= 3).await;
    assert!(!h.has_event("vm-e", REASON_SYNCED));

    h.backend.fail_status(false);
    wait_until("vm-e synced", || h.has_event("vm-e", REASON_SYNCED)).await;
    let stored = h.store.get("default", "vm-e").unwrap().unwrap();
    assert_eq!(stored.status.cpu_utilization, 12);
    assert_eq!(
        count(&h.backend, |call| matches!(call, BackendCall::Create(_))),
        0
    );
    h.stop().await;
}

#[tokio::test]
async fn spec_updates_are_reconciled() {
    let backend = FakeBackend::new();
    let h = start(
        backend,
        vec![VirtualMachine::new("default", "vm-f", "frank")],
    )
    .await;
    wait_until("vm-f synced", || h.has_event("vm-f", REASON_SYNCED)).await;

    h.store
        .apply(VirtualMachine::new("default", "vm-f", "frank-2"))
        .expect("update");
    wait_until("second server", || h.backend.servers_named("frank-2") == 1).await;
    h.stop().await;
}

#[tokio::test]
async fn vanished_resource_is_dropped() {
    let store = InMemoryResourceStore::new();
    let engine = ReconcileEngine::new(
        Arc::new(store),
        Arc::new(FakeBackend::new()),
        Arc::new(InMemoryEventRecorder::new()),
    );
    assert_eq!(
        engine.reconcile_key("default/gone").await,
        ReconcileOutcome::Dropped(DropReason::NotFound)
    );
}
