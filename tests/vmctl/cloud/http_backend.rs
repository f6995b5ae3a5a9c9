use std::time::Duration;

use vmctl::vmctl::cloud::{BackendError, CheckResult, ComputeBackend, HttpComputeBackend};
use vmctl::vmctl::test_support::{BackendCall, FakeBackend, FakeCloudServer};

fn client_for(server: &FakeCloudServer) -> HttpComputeBackend {
    HttpComputeBackend::new(&server.base_url(), Duration::from_secs(5)).expect("client")
}

#[tokio::test]
async fn check_classifies_names() {
    let backend = FakeBackend::new();
    backend.seed_server("alice", 0);
    backend.deny("bob");
    let server = FakeCloudServer::start(backend.clone()).await.expect("server");
    let client = client_for(&server);

    assert_eq!(client.check("alice").await, Ok(CheckResult::Exists));
    assert_eq!(client.check("bob").await, Ok(CheckResult::Denied));
    assert_eq!(client.check("carol").await, Ok(CheckResult::Absent));

    server.stop().await;
}

#[tokio::test]
async fn create_then_read_status() {
    let backend = FakeBackend::new();
    backend.set_cpu("alice", 37);
    let server = FakeCloudServer::start(backend.clone()).await.expect("server");
    let client = client_for(&server);

    client.create_server("alice").await.expect("create");
    let servers = client.list_servers().await.expect("list");
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].name, "alice");

    let status = client.server_status("alice").await.expect("status");
    assert_eq!(status.id, servers[0].id);
    assert_eq!(status.cpu_utilization, 37);

    server.stop().await;
}

#[tokio::test]
async fn create_rejection_surfaces_status_code() {
    let backend = FakeBackend::new();
    backend.fail_creates(true);
    let server = FakeCloudServer::start(backend.clone()).await.expect("server");
    let client = client_for(&server);

    assert_eq!(
        client.create_server("alice").await,
        Err(BackendError::UnexpectedStatus {
            operation: "create server",
            status: 500
        })
    );
    server.stop().await;
}

#[tokio::test]
async fn delete_resolves_id_by_name() {
    let backend = FakeBackend::new();
    backend.seed_server("alice", 0);
    backend.seed_server("other", 0);
    let server = FakeCloudServer::start(backend.clone()).await.expect("server");
    let client = client_for(&server);

    client.delete_server("alice").await.expect("delete");
    assert_eq!(backend.servers_named("alice"), 0);
    assert_eq!(backend.servers_named("other"), 1);
    assert!(backend
        .calls()
        .contains(&BackendCall::Delete("alice".to_string())));

    assert_eq!(
        client.delete_server("alice").await,
        Err(BackendError::ServerNotFound("alice".to_string()))
    );
    server.stop().await;
}

#[tokio::test]
async fn unknown_server_status_is_not_found() {
    let backend = FakeBackend::new();
    let server = FakeCloudServer::start(backend).await.expect("server");
    let client = client_for(&server);

    assert_eq!(
        client.server_status("ghost").await,
        Err(BackendError::ServerNotFound("ghost".to_string()))
    );
    server.stop().await;
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = HttpComputeBackend::new(&format!("http://{addr}"), Duration::from_secs(2))
        .expect("client");
    assert!(matches!(
        client.check("alice").await,
        Err(BackendError::Transport(_))
    ));
    assert!(matches!(
        client.list_servers().await,
        Err(BackendError::Transport(_))
    ));
}
