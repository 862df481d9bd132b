//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Contains the runtime infrastructure that sits between the TCP
//! listener and the per-request pipeline. This module is intentionally
//! decoupled from `main()` so that the server logic remains testable
//! and reusable without pulling in process-level concerns like signal
//! handling or `std::process::exit`.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::rate_limit::RateLimiter;
use crate::store::CounterStore;
use crate::{handle_request, BoxBody, GatewayError, RuntimeConfig};

/// Runtime state shared across the accept loop.
pub struct ServerState {
    /// Validated gateway configuration shared by all handlers.
    pub config: Arc<RuntimeConfig>,
    /// The multi-tier rate limiter consulted before every upstream call.
    pub limiter: RateLimiter,
    /// Bounds the number of concurrent in-flight requests.
    pub semaphore: Arc<Semaphore>,
    /// Cached value of the semaphore capacity, used in error messages.
    pub concurrency_limit: usize,
}

/// Accepts connections on `listener` and dispatches them through the
/// gateway pipeline using the given `client` and shared `state`.
/// Generic over the client connector type so that plain-HTTP and HTTPS
/// upstreams use the same accept loop.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve<C>(
    listener: TcpListener,
    client: hyper_util::client::legacy::Client<C, BoxBody>,
    state: ServerState,
    shutdown: impl std::future::Future<Output = ()>,
) where
    C: hyper_util::client::legacy::connect::Connect + Clone + Send + Sync + 'static,
{
    let ServerState {
        config,
        limiter,
        semaphore,
        concurrency_limit,
    } = state;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let client = client.clone();
                let config = Arc::clone(&config);
                let semaphore = Arc::clone(&semaphore);
                let limiter = limiter.clone();

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let client = client.clone();
                        let config = Arc::clone(&config);
                        let semaphore = Arc::clone(&semaphore);
                        let limiter = limiter.clone();
                        async move {
                            let _permit = match semaphore.try_acquire() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        limit = concurrency_limit,
                                        "concurrency limit reached, rejecting request"
                                    );
                                    let err = GatewayError::ServiceUnavailable {
                                        limit: concurrency_limit,
                                    };
                                    return Ok::<Response<BoxBody>, std::convert::Infallible>(
                                        err.into_response(),
                                    );
                                }
                            };

                            let resp = handle_request(req, client, config, limiter, client_addr)
                                .await
                                .unwrap_or_else(|e| e.into_response());
                            Ok::<Response<BoxBody>, std::convert::Infallible>(resp)
                        }
                    });

                    let result = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;

                    if let Err(e) = result {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Spawns a background task that periodically deletes expired counter
/// records, bounding storage growth.
///
/// Deleting an expired record concurrently with a check that is about
/// to recreate it is safe: both paths converge on a fresh record.
pub fn spawn_counter_sweeper(
    store: Arc<dyn CounterStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match store.delete_expired(crate::rate_limit::epoch_ms()).await {
                Ok(0) => {}
                Ok(deleted) => {
                    info!(deleted, "expired rate-limit counters swept");
                }
                Err(e) => {
                    warn!(error = %e, "counter sweep failed");
                }
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
