//! Core gateway handler: rate limiting, payload validation, prompt
//! dispatch, and response construction.
//!
//! Every inbound request is assigned a monotonically increasing request
//! id and wrapped in a [`tracing::Span`] carrying structured fields.
//!
//! The pipeline for a protected endpoint, in order:
//!
//! 1. **Routing** — `GET /health` answers immediately; anything not in
//!    the protected endpoint set receives 404, and a non-POST method on
//!    a protected endpoint receives 405.
//! 2. **Identifier extraction** — forwarding headers first, then the
//!    peer address, then the `"unknown"` sentinel.
//! 3. **Rate limiting** — the multi-tier check. A denial short-circuits
//!    into a 429 carrying `Retry-After` and `X-RateLimit-*` headers; the
//!    completion upstream is never consulted for a denied request.
//! 4. **Payload validation** — the endpoint's typed payload is parsed
//!    and turned into a prompt.
//! 5. **Completion call** — the upstream round-trip, bounded by the
//!    configured request timeout. An upstream 429 is surfaced as a
//!    distinct 502, never as this gateway's own denial.
//! 6. **Response** — the generated text plus the caller's remaining
//!    quota and reset time, echoed both in the JSON body and in
//!    `X-RateLimit-*` headers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use tokio::time::timeout;
use tracing::{info, warn, Instrument};

use crate::client_ip::client_identifier;
use crate::error::{full_body, iso8601};
use crate::rate_limit::{Decision, RateLimiter, Tier};
use crate::{completion, endpoints, GatewayError, Result, RuntimeConfig};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for both upstream requests and client-facing
/// responses.
///
/// Uses a trait-object error type so that both `Incoming` (which yields
/// `hyper::Error`) and locally constructed bodies (which are infallible)
/// can be erased into the same type without lossy conversions.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Processes a single inbound request through the gateway pipeline.
pub async fn handle_request<B, C>(
    req: Request<B>,
    client: Client<C, BoxBody>,
    config: Arc<RuntimeConfig>,
    limiter: RateLimiter,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
    C: hyper_util::client::legacy::connect::Connect + Clone + Send + Sync + 'static,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %method,
        path = %path,
        client = %client_addr,
    );

    async move {
        if method == Method::GET && path == "/health" {
            return health_response();
        }

        if !endpoints::PROTECTED.contains(&path.as_str()) {
            return Err(GatewayError::UnknownEndpoint(path));
        }

        if method != Method::POST {
            return Err(GatewayError::MethodNotAllowed(path));
        }

        let identifier = client_identifier(req.headers(), Some(client_addr));

        let decision = limiter.check(&identifier, &path).await;
        if !decision.allowed {
            warn!(
                identifier,
                tier = decision.tier.map(|t| t.as_str()).unwrap_or("unknown"),
                retry_after_secs = decision.retry_after_secs.unwrap_or(0),
                "rate limit exceeded"
            );
            return Err(GatewayError::RateLimited {
                tier: decision.tier.unwrap_or(Tier::Free),
                retry_after_secs: decision.retry_after_secs.unwrap_or(0),
                reset_ms: decision.reset_ms,
            });
        }

        let payload = req
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                let e: StdError = e.into();
                GatewayError::BadRequest(format!("failed to read body: {e}"))
            })?
            .to_bytes();

        let prompt = endpoints::build_prompt(&path, &payload)?;

        let start = std::time::Instant::now();
        let text = match timeout(
            config.request_timeout,
            completion::complete(&client, &config, &prompt),
        )
        .await
        {
            Ok(result) => result?,
            Err(_elapsed) => {
                warn!(
                    timeout = ?config.request_timeout,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "completion upstream timed out"
                );
                return Err(GatewayError::Timeout(config.request_timeout));
            }
        };

        info!(
            identifier,
            remaining = decision.remaining,
            latency_ms = start.elapsed().as_millis() as u64,
            degraded = decision.message.is_some(),
            "completion served"
        );

        success_response(&text, &decision)
    }
    .instrument(span)
    .await
}

/// Builds the 200 response for a served completion, echoing quota state
/// in both the JSON body and the `X-RateLimit-*` headers.
fn success_response(text: &str, decision: &Decision) -> Result<Response<BoxBody>> {
    let reset = iso8601(decision.reset_ms);

    let mut body = serde_json::json!({
        "result": text,
        "remaining": decision.remaining,
        "resetTime": reset,
    });
    if let Some(message) = &decision.message {
        body["message"] = serde_json::Value::String(message.clone());
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("x-ratelimit-remaining", decision.remaining.to_string())
        .header("x-ratelimit-reset", reset)
        .body(full_body(body.to_string()))
        .map_err(|e| GatewayError::Internal(format!("failed to build response: {e}")))
}

/// Builds the `GET /health` response.
fn health_response() -> Result<Response<BoxBody>> {
    let body = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .map_err(|e| GatewayError::Internal(format!("failed to build response: {e}")))
}
