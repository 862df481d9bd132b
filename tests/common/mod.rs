//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway completion backends, configuration builders,
//! limiter constructors, and a failing counter-store double used across
//! all integration test modules.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tollbooth::{
    BoxBody, Config, Counter, CounterStore, EndpointPolicy, HttpClient, MemoryCounterStore,
    RateLimitPolicies, RateLimiter, RuntimeConfig, StoreError, Tier, TierPolicy, UpstreamConfig,
};

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn test_client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .build(hyper_util::client::legacy::connect::HttpConnector::new())
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Wraps a string into the gateway's type-erased body, for requests
/// sent through the legacy client.
pub fn box_body(data: &str) -> BoxBody {
    Full::new(Bytes::from(data.to_owned()))
        .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
        .boxed()
}

/// Builds an [`EndpointPolicy`] from `(requests, window_ms)` pairs.
pub fn policy(burst: (u32, u64), minute: (u32, u64), free: (u32, u64)) -> EndpointPolicy {
    EndpointPolicy {
        burst: TierPolicy {
            requests: burst.0,
            window_ms: burst.1,
        },
        minute: TierPolicy {
            requests: minute.0,
            window_ms: minute.1,
        },
        free: TierPolicy {
            requests: free.0,
            window_ms: free.1,
        },
    }
}

/// A policy generous enough that tests exercising other behavior never
/// trip a tier.
pub fn generous_policy() -> EndpointPolicy {
    policy((100, 10_000), (100, 60_000), (100, 3_600_000))
}

/// Builds a `RuntimeConfig` targeting the given local completion
/// backend with the given default rate-limit policy.
pub fn test_config_with_policy(addr: SocketAddr, default: EndpointPolicy) -> Arc<RuntimeConfig> {
    let mut config = Config {
        upstream: Some(UpstreamConfig {
            url: format!("http://{addr}"),
            model: "test-model".into(),
        }),
        ..Default::default()
    };
    config.rate_limit.default = default;
    Arc::new(config.into_runtime().expect("test config must be valid"))
}

/// Builds a `RuntimeConfig` with a policy no test will exhaust.
pub fn test_config(addr: SocketAddr) -> Arc<RuntimeConfig> {
    test_config_with_policy(addr, generous_policy())
}

/// Builds a limiter over a fresh in-memory store using the config's
/// policy table.
pub fn test_limiter(config: &RuntimeConfig) -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryCounterStore::new()), config.policies.clone())
}

/// Builds a limiter with the given default policy over a caller-supplied
/// store, so tests can inspect the counters afterwards.
pub fn limiter_over(store: Arc<dyn CounterStore>, default: EndpointPolicy) -> RateLimiter {
    RateLimiter::new(store, RateLimitPolicies::new(default, HashMap::new()))
}

/// A counter store whose every operation fails, for fail-open tests.
#[derive(Debug, Default)]
pub struct FailingCounterStore;

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn find_one(
        &self,
        _identifier: &str,
        _endpoint: &str,
        _tier: Tier,
    ) -> Result<Option<Counter>, StoreError> {
        Err(StoreError::new("simulated outage"))
    }

    async fn create(
        &self,
        _identifier: &str,
        _endpoint: &str,
        _tier: Tier,
        _count: u32,
        _reset_ms: u64,
    ) -> Result<Counter, StoreError> {
        Err(StoreError::new("simulated outage"))
    }

    async fn update_count(&self, _id: u64, _count: u32) -> Result<(), StoreError> {
        Err(StoreError::new("simulated outage"))
    }

    async fn delete_expired(&self, _before_ms: u64) -> Result<u64, StoreError> {
        Err(StoreError::new("simulated outage"))
    }
}

/// Starts a local completion backend that answers every generate call
/// with the given text in an Ollama-style JSON envelope. Returns the
/// server address and a handle to shut it down.
pub async fn start_completion_backend(text: &'static str) -> (SocketAddr, oneshot::Sender<()>) {
    let body = serde_json::json!({
        "model": "test-model",
        "response": text,
        "done": true,
    })
    .to_string();
    start_raw_backend(StatusCode::OK, body).await
}

/// Starts a local backend that answers every request with the given
/// status and an empty JSON object.
pub async fn start_status_backend(status: StatusCode) -> (SocketAddr, oneshot::Sender<()>) {
    start_raw_backend(status, "{}".to_owned()).await
}

async fn start_raw_backend(
    status: StatusCode,
    body: String,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let body = body.clone();
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let body = body.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "application/json")
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
