//! Tests for the server runtime: the accept loop, the concurrency
//! bound, graceful shutdown, and the background counter sweeper.
//!
//! Unlike the gateway tests, these run `serve` against a real ephemeral
//! listener and talk to it over sockets.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use http_body_util::BodyExt;
use hyper::{Method, Request, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};
use tollbooth::{
    serve, spawn_counter_sweeper, CounterStore, MemoryCounterStore, RuntimeConfig, ServerState,
    Tier,
};

/// Binds an ephemeral listener and runs `serve` over it with the given
/// concurrency capacity. Returns the bound address, the shutdown
/// trigger, and the serve task's join handle.
async fn start_gateway(
    config: Arc<RuntimeConfig>,
    capacity: usize,
) -> (
    std::net::SocketAddr,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind gateway listener");
    let addr = listener.local_addr().unwrap();

    let state = ServerState {
        config: Arc::clone(&config),
        limiter: test_limiter(&config),
        semaphore: Arc::new(Semaphore::new(capacity)),
        concurrency_limit: capacity,
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, test_client(), state, async move {
        let _ = shutdown_rx.await;
    }));

    (addr, shutdown_tx, server)
}

fn health_request(addr: std::net::SocketAddr) -> Request<tollbooth::BoxBody> {
    Request::builder()
        .method(Method::GET)
        .uri(format!("http://{addr}/health"))
        .body(box_body(""))
        .expect("test request must build")
}

#[tokio::test]
async fn concurrency_overflow_returns_503() {
    init_tracing();
    let (backend, _backend_shutdown) = start_completion_backend("ok").await;
    let config = test_config(backend);

    // Zero capacity: every request overflows the bound.
    let (addr, shutdown, server) = start_gateway(config, 0).await;

    let resp = test_client()
        .request(health_request(addr))
        .await
        .expect("gateway must answer even when saturated");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "service_unavailable");

    let _ = shutdown.send(());
    server.await.unwrap();
}

#[tokio::test]
async fn accept_loop_serves_and_stops_on_shutdown() {
    init_tracing();
    let (backend, _backend_shutdown) = start_completion_backend("ok").await;
    let config = test_config(backend);

    let (addr, shutdown, server) = start_gateway(config, 4).await;

    let resp = test_client()
        .request(health_request(addr))
        .await
        .expect("gateway must serve before shutdown");
    assert_eq!(resp.status(), StatusCode::OK);

    let _ = shutdown.send(());
    tokio::time::timeout(Duration::from_secs(1), server)
        .await
        .expect("serve must return after the shutdown future resolves")
        .unwrap();
}

#[tokio::test]
async fn full_pipeline_over_sockets_carries_rate_limit_headers() {
    init_tracing();
    let (backend, _backend_shutdown) = start_completion_backend("socket answer").await;
    let config = test_config(backend);

    let (addr, shutdown, server) = start_gateway(config, 4).await;

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{addr}/api/salary-comparison"))
        .header("content-type", "application/json")
        .body(box_body(
            r#"{"job_title": "Data Engineer", "location": "Austin, TX", "years_experience": 6}"#,
        ))
        .unwrap();

    let resp = test_client().request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-ratelimit-remaining"));

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["result"], "socket answer");

    let _ = shutdown.send(());
    server.await.unwrap();
}

#[tokio::test]
async fn sweeper_removes_expired_counters() {
    init_tracing();
    let store = Arc::new(MemoryCounterStore::new());
    store
        .create("a", "/api/x", Tier::Burst, 2, 1_000)
        .await
        .unwrap();
    store
        .create("a", "/api/x", Tier::Minute, 2, 5_000)
        .await
        .unwrap();
    assert_eq!(store.len(), 2);

    let sweeper = spawn_counter_sweeper(store.clone(), Duration::from_millis(10));

    // Both windows closed decades ago; the first sweep removes them.
    tokio::time::timeout(Duration::from_secs(2), async {
        while !store.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sweeper must remove long-expired windows");

    sweeper.abort();
}
