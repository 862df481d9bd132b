//! Error types and HTTP status code mapping.
//!
//! Every failure the gateway can produce maps to a specific HTTP status
//! and a machine-readable JSON body. A rate-limit denial is ordinary
//! control flow inside the limiter (a [`Decision`] value); it only
//! becomes a [`GatewayError::RateLimited`] at the HTTP boundary so the
//! handler can short-circuit into a 429 response with retry metadata.
//!
//! [`Decision`]: crate::Decision

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};

use crate::rate_limit::Tier;
use crate::BoxBody;

/// Every failure the gateway can produce, each mapping to a specific
/// HTTP status.
#[derive(Debug)]
pub enum GatewayError {
    /// The configuration file could not be loaded or validated.
    Config(String),
    /// The configured completion upstream URL is malformed.
    InvalidUpstream(String),
    /// The request payload was missing, malformed, or failed validation.
    BadRequest(String),
    /// No endpoint is registered at the requested path.
    UnknownEndpoint(String),
    /// The endpoint exists but does not accept the request method.
    MethodNotAllowed(String),
    /// A rate-limit tier denied the request.
    RateLimited {
        /// The tier whose ceiling was reached.
        tier: Tier,
        /// Seconds the client should wait before retrying.
        retry_after_secs: u64,
        /// Epoch milliseconds at which the denying tier's window resets.
        reset_ms: u64,
    },
    /// The completion upstream returned an error or was unreachable.
    Upstream(String),
    /// The completion upstream itself responded 429. Distinct from
    /// [`GatewayError::RateLimited`]: this is the provider's quota,
    /// not ours.
    UpstreamRateLimited,
    /// The upstream round-trip exceeded the configured request timeout.
    Timeout(Duration),
    /// The concurrency limit was reached before the request could be
    /// admitted.
    ServiceUnavailable {
        /// The configured maximum number of in-flight requests.
        limit: usize,
    },
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidUpstream(msg) => write!(f, "invalid upstream: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::UnknownEndpoint(path) => write!(f, "unknown endpoint: {path}"),
            Self::MethodNotAllowed(path) => write!(f, "{path} only accepts POST"),
            Self::RateLimited {
                tier,
                retry_after_secs,
                ..
            } => write!(
                f,
                "rate limit exceeded on {} tier, retry in {retry_after_secs}s",
                tier.as_str()
            ),
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::UpstreamRateLimited => {
                write!(f, "completion upstream is rate limiting requests")
            }
            Self::Timeout(d) => write!(f, "upstream request timed out after {d:?}"),
            Self::ServiceUnavailable { limit } => {
                write!(f, "concurrency limit of {limit} reached")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// A convenience alias for gateway results.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidUpstream(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) | Self::UpstreamRateLimited => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the machine-readable error code used in JSON bodies.
    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidUpstream(_) => "invalid_upstream",
            Self::BadRequest(_) => "bad_request",
            Self::UnknownEndpoint(_) => "unknown_endpoint",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::Upstream(_) => "upstream_error",
            Self::UpstreamRateLimited => "upstream_rate_limited",
            Self::Timeout(_) => "upstream_timeout",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    ///
    /// A [`GatewayError::RateLimited`] response additionally carries the
    /// `Retry-After`, `X-RateLimit-Remaining`, and `X-RateLimit-Reset`
    /// headers so clients can schedule their next attempt. A
    /// [`GatewayError::MethodNotAllowed`] response carries `Allow`.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();

        let body = match &self {
            Self::RateLimited {
                tier,
                retry_after_secs,
                reset_ms,
            } => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
                "tier": tier.as_str(),
                "retryAfter": retry_after_secs,
                "resetTime": iso8601(*reset_ms),
            }),
            _ => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "application/json");

        if let Self::RateLimited {
            retry_after_secs,
            reset_ms,
            ..
        } = &self
        {
            builder = builder
                .header("retry-after", retry_after_secs.to_string())
                .header("x-ratelimit-remaining", "0")
                .header("x-ratelimit-reset", iso8601(*reset_ms));
        }

        if let Self::MethodNotAllowed(_) = &self {
            builder = builder.header("allow", "POST");
        }

        builder
            .body(full_body(body.to_string()))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(full_body(String::new()))
                    .expect("building fallback response must not fail")
            })
    }
}

/// Wraps a string into the gateway's type-erased body.
pub(crate) fn full_body(data: String) -> BoxBody {
    Full::new(Bytes::from(data))
        .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
        .boxed()
}

/// Renders epoch milliseconds as an ISO-8601 / RFC 3339 timestamp.
pub(crate) fn iso8601(epoch_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}
