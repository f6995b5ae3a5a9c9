use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use vmctl::vmctl::config::ControllerConfig;
use vmctl::vmctl::controller::leader::{
    InMemoryLeaseStore, LeaderElector, LeaderState, LeaseConfig, LeaseStore,
};
use vmctl::vmctl::controller::{ControllerError, ControllerManager};
use vmctl::vmctl::k8s::event::InMemoryEventRecorder;
use vmctl::vmctl::k8s::store::InMemoryResourceStore;
use vmctl::vmctl::k8s::vm::VirtualMachine;
use vmctl::vmctl::test_support::{CountingMetrics, FakeBackend, FlakyLeaseStore};

struct Replica {
    identity: String,
    backend: FakeBackend,
    metrics: Arc<CountingMetrics>,
    state: watch::Receiver<LeaderState>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ControllerError>>,
}

impl Replica {
    fn start(identity: &str, store: &InMemoryResourceStore, leases: Arc<dyn LeaseStore>) -> Self {
        let backend = FakeBackend::new();
        let metrics = Arc::new(CountingMetrics::default());
        let config = ControllerConfig::default();
        let (elector, signals) = LeaderElector::new(identity, leases, config.lease);
        let state = elector.subscribe_state();
        let manager = ControllerManager::new(
            Arc::new(store.clone()),
            Arc::new(backend.clone()),
            Arc::new(InMemoryEventRecorder::new()),
            metrics.clone(),
            config,
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(manager.run(elector, signals, shutdown.clone()));
        Self {
            identity: identity.to_string(),
            backend,
            metrics,
            state,
            shutdown,
            task,
        }
    }

    fn leading(&self) -> bool {
        *self.state.borrow() == LeaderState::Leading
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task
            .await
            .expect("manager task")
            .expect("manager result");
    }
}

fn seeded_store() -> InMemoryResourceStore {
    let store = InMemoryResourceStore::new();
    store
        .apply(VirtualMachine::new("default", "vm-a", "alice"))
        .expect("seed");
    store.mark_synced();
    store
}

async fn wait_until(what: &str, limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(50)).await;
    }
}

fn election_window() -> Duration {
    let lease = LeaseConfig::default();
    lease.lease_duration + lease.retry_period
}

#[tokio::test(start_paused = true)]
async fn only_one_replica_leads_and_standby_stays_quiet() {
    let store = seeded_store();
    let leases = InMemoryLeaseStore::new();
    let a = Replica::start("replica-a", &store, Arc::new(leases.clone()));
    let b = Replica::start("replica-b", &store, Arc::new(leases.clone()));

    wait_until("a leader", election_window(), || a.leading() || b.leading()).await;
    sleep(Duration::from_secs(10)).await;

    assert!(a.leading() ^ b.leading(), "exactly one replica leads");
    let (leader, standby) = if a.leading() { (&a, &b) } else { (&b, &a) };

    let lease = leases.get().await.unwrap().expect("lease");
    assert_eq!(lease.record.holder_identity, leader.identity);
    assert!(leader.metrics.leading());
    assert!(!standby.metrics.leading());
    assert_eq!(leader.backend.servers_named("alice"), 1);
    assert!(
        standby.backend.calls().is_empty(),
        "standby must not call the backend"
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn released_lease_is_taken_over_without_waiting_for_expiry() {
    let store = seeded_store();
    let leases = InMemoryLeaseStore::new();
    let a = Replica::start("replica-a", &store, Arc::new(leases.clone()));
    wait_until("a leads", election_window(), || a.leading()).await;

    let b = Replica::start("replica-b", &store, Arc::new(leases.clone()));
    sleep(Duration::from_secs(3)).await;
    assert!(!b.leading());
    assert!(b.backend.calls().is_empty());

    a.stop().await;
    let released = leases.get().await.unwrap().expect("lease");
    assert!(released.record.is_released());

    let handed_over = Instant::now();
    wait_until("b leads", Duration::from_secs(3), || b.leading()).await;
    assert!(
        handed_over.elapsed() < LeaseConfig::default().lease_duration,
        "released lease must not wait for expiry"
    );
    wait_until("b reconciles", Duration::from_secs(3), || {
        !b.backend.calls().is_empty()
    })
    .await;

    let lease = leases.get().await.unwrap().expect("lease");
    assert_eq!(lease.record.holder_identity, "replica-b");
    assert!(lease.record.leader_transitions >= 1);
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn leader_steps_down_when_renewals_fail_and_standby_takes_over() {
    let store = seeded_store();
    let shared = InMemoryLeaseStore::new();
    let flaky = FlakyLeaseStore::new(shared.clone());

    let a = Replica::start("replica-a", &store, Arc::new(flaky.clone()));
    wait_until("a leads", election_window(), || a.leading()).await;
    let b = Replica::start("replica-b", &store, Arc::new(shared.clone()));
    sleep(Duration::from_secs(2)).await;
    assert!(!b.leading());

    flaky.set_unavailable(true);
    let outage = Instant::now();
    wait_until("a steps down", Duration::from_secs(5), || !a.leading()).await;
    let config = LeaseConfig::default();
    assert!(outage.elapsed() <= config.renew_deadline + config.retry_period * 2);
    wait_until("a workers stopped", Duration::from_secs(1), || {
        !a.metrics.leading()
    })
    .await;

    wait_until("b leads", election_window() * 2, || b.leading()).await;
    assert!(!a.leading());
    let lease = shared.get().await.unwrap().expect("lease");
    assert_eq!(lease.record.holder_identity, "replica-b");

    a.stop().await;
    b.stop().await;
}
