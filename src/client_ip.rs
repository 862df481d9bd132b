//! Client identifier extraction.
//!
//! Rate-limit counters are keyed by a stable client identity. Behind a
//! load balancer the peer address is the balancer's, so the forwarding
//! headers take precedence: the first (client-most) entry of
//! `X-Forwarded-For`, then `X-Real-IP`, then the socket peer address.
//! When nothing usable is present the shared `"unknown"` sentinel is
//! used, so unidentifiable clients collectively consume one bucket
//! rather than bypassing the limiter.
//!
//! The limiter treats the result as an opaque string; no validation or
//! canonicalization beyond trimming is attempted here.

use std::net::SocketAddr;

use hyper::header::HeaderMap;

/// Identifier used when no client identity can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Extracts the client identifier for rate limiting.
///
/// Precedence: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// peer address of the accepted connection, then [`UNKNOWN_CLIENT`].
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(first_hop)
    {
        return forwarded;
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return real_ip.to_owned();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_owned())
}

/// Returns the first non-empty, trimmed entry of a comma-separated
/// `X-Forwarded-For` chain.
fn first_hop(value: &str) -> Option<String> {
    value
        .split(',')
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_owned)
}
