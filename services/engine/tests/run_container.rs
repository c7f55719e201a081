//! Integration tests for the engine's HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gantry_api::{
    AgentStatus, Capacity, Container, ContainerState, ContainerStatus, RunContainerRequest,
    RunContainerResponse, RunFailure,
};
use gantry_engine::api;
use gantry_engine::client::InitdClient;
use gantry_engine::container::{ContainerManager, ContainerManagerConfig};
use gantry_engine::fetch::{FetcherConfig, ImageFetcher};
use gantry_engine::runtime::{MockRuntime, Runtime};
use gantry_engine::store::StateStore;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn spawn_engine(dir: &tempfile::TempDir) -> SocketAddr {
    let runtime: Arc<dyn Runtime> = Arc::new(MockRuntime::new(dir.path().join("containers")));
    let images_dir = dir.path().join("images");
    std::fs::create_dir_all(&images_dir).unwrap();

    let manager = Arc::new(ContainerManager::new(
        ContainerManagerConfig {
            capacity: Capacity {
                cpu_millis: 4000,
                memory_bytes: 1 << 30,
            },
            default_reservation: Capacity {
                cpu_millis: 500,
                memory_bytes: 256 << 20,
            },
            images_dir,
        },
        runtime,
        ImageFetcher::new(FetcherConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap(),
        InitdClient::new(Duration::from_secs(2)).unwrap(),
        Some(StateStore::open_in_memory().unwrap()),
    ));

    let state = api::AppState::new(manager);
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn run(
    client: &reqwest::Client,
    addr: SocketAddr,
    request: &RunContainerRequest,
) -> RunContainerResponse {
    client
        .post(format!("http://{addr}/v1/containers"))
        .json(request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn process_container_runs_without_any_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_engine(&dir).await;
    let client = reqwest::Client::new();

    // A registry that must never be contacted for process containers.
    let registry = MockServer::start().await;

    let response = run(
        &client,
        addr,
        &RunContainerRequest {
            name: "dfs".to_string(),
            container: Container::process(),
        },
    )
    .await;
    assert_eq!(response.status, ContainerState::Running);
    assert!(response.error.is_none());

    assert_eq!(registry.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn image_container_fetches_its_uri() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_engine(&dir).await;
    let client = reqwest::Client::new();

    let registry = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dfs.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-bytes".to_vec()))
        .expect(1)
        .mount(&registry)
        .await;

    let response = run(
        &client,
        addr,
        &RunContainerRequest {
            name: "dfs".to_string(),
            container: Container::image(format!("{}/dfs.tar.gz", registry.uri())),
        },
    )
    .await;
    assert_eq!(response.status, ContainerState::Running);
}

#[tokio::test]
async fn missing_image_fails_with_fetch_failed() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_engine(&dir).await;
    let client = reqwest::Client::new();

    let registry = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dfs.tar.gz"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&registry)
        .await;

    let response = run(
        &client,
        addr,
        &RunContainerRequest {
            name: "dfs".to_string(),
            container: Container::image(format!("{}/dfs.tar.gz", registry.uri())),
        },
    )
    .await;
    assert_eq!(response.status, ContainerState::Failed);
    assert_eq!(response.error.unwrap().reason, RunFailure::FetchFailed);

    // The failed run holds no capacity.
    let status: AgentStatus = client
        .get(format!("http://{addr}/v1/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.used, Capacity::ZERO);
    assert_eq!(status.containers, 0);
}

#[tokio::test]
async fn status_endpoint_reflects_reservations() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_engine(&dir).await;
    let client = reqwest::Client::new();

    run(
        &client,
        addr,
        &RunContainerRequest {
            name: "dfs".to_string(),
            container: Container::process(),
        },
    )
    .await;

    let status: AgentStatus = client
        .get(format!("http://{addr}/v1/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.containers, 1);
    assert_eq!(status.used.cpu_millis, 500);
}

#[tokio::test]
async fn stop_returns_the_killed_status() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_engine(&dir).await;
    let client = reqwest::Client::new();

    run(
        &client,
        addr,
        &RunContainerRequest {
            name: "dfs".to_string(),
            container: Container::process(),
        },
    )
    .await;

    let stopped: ContainerStatus = client
        .delete(format!("http://{addr}/v1/containers/dfs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stopped.state, ContainerState::Killed);
}

#[tokio::test]
async fn unknown_container_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_engine(&dir).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/v1/containers/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
