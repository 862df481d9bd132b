//! Configuration loading, validation, and runtime state.
//!
//! The gateway reads its YAML configuration exactly once at startup.
//! The raw [`Config`] maps directly to the on-disk schema; it is then
//! validated into a [`RuntimeConfig`] holding parsed addresses, URIs,
//! and durations so the hot path never touches the filesystem.
//!
//! Rate-limit policies are validated here as well: a tier with zero
//! `requests` or a zero-length window is a configuration error and is
//! rejected at load time, never discovered at request time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::{EndpointPolicy, RateLimitPolicies, Tier};
use crate::{GatewayError, Result};

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";

/// Default connect timeout for establishing upstream TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default total request timeout covering the entire upstream round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle timeout for pooled upstream connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per upstream host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Default maximum number of concurrent in-flight requests the gateway
/// will handle before returning 503 Service Unavailable.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Default interval between expired-counter sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default model name sent to the completion upstream.
pub const DEFAULT_MODEL: &str = "llama3";

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:8100"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// The completion upstream. Mandatory.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    /// Connect timeout in milliseconds for upstream TCP connections
    /// (default: 5000).
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Total request timeout in milliseconds covering the entire upstream
    /// round-trip (default: 30000). Requests exceeding this receive 504.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Idle timeout in milliseconds for pooled connections (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Maximum idle connections kept per upstream host (default: 32).
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    /// Maximum concurrent in-flight requests before returning 503
    /// Service Unavailable (default: 1000).
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    /// Seconds between expired-counter sweeps (default: 60).
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    /// Rate-limit policy table: a default applied to every endpoint plus
    /// optional per-endpoint overrides.
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

/// The completion upstream service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the completion service
    /// (e.g. `"http://localhost:11434"`).
    pub url: String,
    /// Model name passed through on every generate call.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

/// The `rate_limit` section of the config file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSection {
    /// Policy applied to endpoints without an explicit override.
    #[serde(default)]
    pub default: EndpointPolicy,
    /// Per-endpoint policy overrides, keyed by endpoint path.
    #[serde(default)]
    pub overrides: HashMap<String, EndpointPolicy>,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via
/// `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the gateway binds to.
    pub listen: SocketAddr,
    /// Parsed and validated completion upstream URI.
    pub upstream_url: hyper::Uri,
    /// Model name passed through on every generate call.
    pub model: String,
    /// Connect timeout for upstream TCP connections.
    pub connect_timeout: Duration,
    /// Total request timeout for the upstream round-trip. Expiry yields 504.
    pub request_timeout: Duration,
    /// Idle timeout for pooled upstream connections.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per upstream host.
    pub pool_max_idle_per_host: usize,
    /// Maximum concurrent in-flight requests. Overflow yields 503.
    pub max_concurrent_requests: usize,
    /// Interval between expired-counter sweeps.
    pub sweep_interval: Duration,
    /// Validated rate-limit policy table.
    pub policies: RateLimitPolicies,
}

/// Rejects any tier whose limit or window is zero.
fn validate_policy(scope: &str, policy: &EndpointPolicy) -> Result<()> {
    for tier in Tier::ORDER {
        let quota = policy.tier(tier);
        if quota.requests == 0 {
            return Err(GatewayError::Config(format!(
                "{scope}: {} tier must allow at least one request",
                tier.as_str()
            )));
        }
        if quota.window_ms == 0 {
            return Err(GatewayError::Config(format!(
                "{scope}: {} tier window must be positive",
                tier.as_str()
            )));
        }
    }
    Ok(())
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`GatewayError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`] suitable for
    /// the gateway hot path.
    ///
    /// An upstream must be configured, and every rate-limit policy must
    /// have positive limits and windows.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let upstream = self.upstream.ok_or_else(|| {
            GatewayError::Config("a completion upstream must be configured".into())
        })?;

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            GatewayError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let upstream_url = upstream
            .url
            .parse::<hyper::Uri>()
            .map_err(|e| GatewayError::InvalidUpstream(format!("{e}")))?;
        upstream_url.authority().ok_or_else(|| {
            GatewayError::InvalidUpstream(format!("upstream URL has no authority: {}", upstream.url))
        })?;
        let scheme_ok = upstream_url
            .scheme_str()
            .is_some_and(|s| s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"));
        if !scheme_ok {
            return Err(GatewayError::InvalidUpstream(format!(
                "upstream URL must be http or https: {}",
                upstream.url
            )));
        }

        validate_policy("rate_limit.default", &self.rate_limit.default)?;
        for (endpoint, policy) in &self.rate_limit.overrides {
            validate_policy(&format!("rate_limit.overrides.{endpoint}"), policy)?;
        }
        let policies =
            RateLimitPolicies::new(self.rate_limit.default, self.rate_limit.overrides);

        let connect_timeout = self
            .connect_timeout_ms
            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis);

        let request_timeout = self
            .request_timeout_ms
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);

        let pool_idle_timeout = self
            .pool_idle_timeout_ms
            .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis);

        let pool_max_idle_per_host = self
            .pool_max_idle_per_host
            .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST);

        let max_concurrent_requests = self
            .max_concurrent_requests
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);

        let sweep_interval = self
            .sweep_interval_secs
            .map_or(DEFAULT_SWEEP_INTERVAL, Duration::from_secs);

        Ok(RuntimeConfig {
            listen,
            upstream_url,
            model: upstream.model,
            connect_timeout,
            request_timeout,
            pool_idle_timeout,
            pool_max_idle_per_host,
            max_concurrent_requests,
            sweep_interval,
            policies,
        })
    }
}

impl RuntimeConfig {
    /// Returns `true` if the completion upstream uses the HTTPS scheme.
    pub fn upstream_is_https(&self) -> bool {
        self.upstream_url
            .scheme_str()
            .is_some_and(|s| s.eq_ignore_ascii_case("https"))
    }
}
