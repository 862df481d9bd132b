//! A rate-limiting HTTP gateway for AI-backed career calculator
//! endpoints.
//!
//! Each protected endpoint accepts a JSON payload, builds a prompt, and
//! forwards it to a text-completion upstream — but only after the
//! request clears a three-tier, persisted rate limiter (burst, minute,
//! and hourly free-tier windows). If the counter store is unavailable
//! the limiter fails open: availability of the protected feature wins
//! over strict quota enforcement.

pub mod client_ip;
pub mod completion;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod gateway;
pub mod rate_limit;
pub mod server;
pub mod store;

pub use completion::{build_client, build_https_client, HttpClient, HttpsClient};
pub use config::{Config, RuntimeConfig, UpstreamConfig};
pub use error::{GatewayError, Result};
pub use gateway::{handle_request, BoxBody};
pub use rate_limit::{Decision, EndpointPolicy, RateLimitPolicies, RateLimiter, Tier, TierPolicy};
pub use server::{serve, shutdown_signal, spawn_counter_sweeper, ServerState};
pub use store::{Counter, CounterStore, MemoryCounterStore, StoreError};
