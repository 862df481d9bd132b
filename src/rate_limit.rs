//! Multi-tier, persisted rate limiting.
//!
//! Every protected endpoint is guarded by three concurrently enforced
//! quota tiers, each with its own fixed time window and independent
//! reset clock:
//!
//! - [`Tier::Burst`] — a very small allowance over a short window,
//!   stopping rapid-fire abuse.
//! - [`Tier::Minute`] — a moderate per-minute ceiling.
//! - [`Tier::Free`] — the hourly free-tier budget.
//!
//! A request must pass **all** tiers to be allowed. Tiers are evaluated
//! shortest-window first, and the first exceeded tier denies the request
//! immediately without consulting (or mutating) the tiers after it.
//! Tiers that passed earlier in the same call keep their counter writes;
//! the check is deliberately not transactional across tiers.
//!
//! Counters live in a [`CounterStore`], one record per
//! `(identifier, endpoint, tier)` triple. If the store fails, the
//! limiter fails OPEN: the request is allowed and the degradation is
//! logged, because a rate-limiting outage must never take down the
//! protected feature.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::CounterStore;

/// One of the three independently windowed quota policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Short-window anti-burst ceiling, checked first.
    Burst,
    /// Per-minute ceiling.
    Minute,
    /// Hourly free-tier budget, checked last.
    Free,
}

impl Tier {
    /// Fixed evaluation order: most restrictive (shortest window) first.
    pub const ORDER: [Tier; 3] = [Tier::Burst, Tier::Minute, Tier::Free];

    /// Returns the tier's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Burst => "burst",
            Tier::Minute => "minute",
            Tier::Free => "free",
        }
    }
}

/// The quota for a single tier: `requests` per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Maximum requests accepted within one window. Must be positive.
    pub requests: u32,
    /// Window length in milliseconds. Must be positive.
    pub window_ms: u64,
}

/// The full three-tier quota applied to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Anti-burst tier.
    pub burst: TierPolicy,
    /// Per-minute tier.
    pub minute: TierPolicy,
    /// Hourly free-tier budget.
    pub free: TierPolicy,
}

impl EndpointPolicy {
    /// Returns the policy for the given tier.
    pub fn tier(&self, tier: Tier) -> TierPolicy {
        match tier {
            Tier::Burst => self.burst,
            Tier::Minute => self.minute,
            Tier::Free => self.free,
        }
    }
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self {
            burst: TierPolicy {
                requests: 2,
                window_ms: 10_000,
            },
            minute: TierPolicy {
                requests: 10,
                window_ms: 60_000,
            },
            free: TierPolicy {
                requests: 50,
                window_ms: 3_600_000,
            },
        }
    }
}

/// Endpoint-keyed policy dispatch: a mandatory default plus explicit
/// per-endpoint overrides. The limiter never validates endpoint names;
/// unknown endpoints simply resolve to the default policy.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPolicies {
    default: EndpointPolicy,
    overrides: HashMap<String, EndpointPolicy>,
}

impl RateLimitPolicies {
    /// Creates a policy table from a default and explicit overrides.
    pub fn new(default: EndpointPolicy, overrides: HashMap<String, EndpointPolicy>) -> Self {
        Self { default, overrides }
    }

    /// Resolves the policy for an endpoint, falling back to the default.
    pub fn resolve(&self, endpoint: &str) -> &EndpointPolicy {
        self.overrides.get(endpoint).unwrap_or(&self.default)
    }
}

/// The outcome of a rate-limit check.
///
/// Denial is a normal control-flow value, not an error. `remaining` and
/// `reset_ms` give callers what they need for `X-RateLimit-*` headers;
/// `retry_after_secs` and `tier` are populated only on denial;
/// `message` is populated only when the limiter is degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the tightest window after this call.
    pub remaining: u32,
    /// Epoch milliseconds of the soonest-expiring evaluated window.
    pub reset_ms: u64,
    /// Whole seconds until retry is worthwhile. Denials only.
    pub retry_after_secs: Option<u64>,
    /// The tier that denied the request. Denials only.
    pub tier: Option<Tier>,
    /// Degradation notice when the counter store was unavailable.
    pub message: Option<String>,
}

impl Decision {
    fn allowed(remaining: u32, reset_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_ms,
            retry_after_secs: None,
            tier: None,
            message: None,
        }
    }

    fn denied(tier: Tier, reset_ms: u64, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_ms,
            retry_after_secs: Some(retry_after_secs),
            tier: Some(tier),
            message: None,
        }
    }

    fn degraded(policy: &EndpointPolicy, now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: policy.free.requests,
            reset_ms: now_ms + policy.free.window_ms,
            retry_after_secs: None,
            tier: None,
            message: Some("rate limiter unavailable, request allowed".into()),
        }
    }
}

/// Enforces layered quotas per client per protected endpoint.
///
/// Holds the policy table and a shared handle to the counter store.
/// Cloning is cheap: the store handle is shared, so clones observe the
/// same counters.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policies: RateLimitPolicies,
}

impl RateLimiter {
    /// Creates a limiter over the given store and policy table.
    pub fn new(store: Arc<dyn CounterStore>, policies: RateLimitPolicies) -> Self {
        Self { store, policies }
    }

    /// Checks whether `identifier` may invoke `endpoint` right now.
    ///
    /// `identifier` is treated as an opaque string; normalization is the
    /// caller's responsibility. `endpoint` is used only to select the
    /// policy and scope the counters.
    pub async fn check(&self, identifier: &str, endpoint: &str) -> Decision {
        self.check_at(identifier, endpoint, epoch_ms()).await
    }

    /// [`check`](Self::check) with an explicit clock, letting tests
    /// drive window expiry deterministically.
    pub async fn check_at(&self, identifier: &str, endpoint: &str, now_ms: u64) -> Decision {
        match self.evaluate(identifier, endpoint, now_ms).await {
            Ok(decision) => decision,
            Err(e) => {
                let policy = self.policies.resolve(endpoint);
                warn!(
                    identifier,
                    endpoint,
                    error = %e,
                    "counter store unavailable, failing open"
                );
                Decision::degraded(policy, now_ms)
            }
        }
    }

    /// Walks the tiers in priority order against the store.
    async fn evaluate(
        &self,
        identifier: &str,
        endpoint: &str,
        now_ms: u64,
    ) -> Result<Decision, crate::store::StoreError> {
        let policy = self.policies.resolve(endpoint);

        let mut min_remaining = u32::MAX;
        let mut soonest_reset = u64::MAX;

        for tier in Tier::ORDER {
            let quota = policy.tier(tier);
            let existing = self.store.find_one(identifier, endpoint, tier).await?;

            let (count, reset_ms) = match existing {
                // Live window. A record whose reset has arrived
                // (`reset_ms <= now_ms`) falls through to the fresh-window
                // arm below.
                Some(record) if record.reset_ms > now_ms => {
                    if record.count >= quota.requests {
                        let retry_after_secs = (record.reset_ms - now_ms).div_ceil(1000);
                        debug!(
                            identifier,
                            endpoint,
                            tier = tier.as_str(),
                            count = record.count,
                            limit = quota.requests,
                            retry_after_secs,
                            "tier ceiling reached"
                        );
                        return Ok(Decision::denied(tier, record.reset_ms, retry_after_secs));
                    }
                    let updated = record.count + 1;
                    self.store.update_count(record.id, updated).await?;
                    (updated, record.reset_ms)
                }
                _ => {
                    let reset_ms = now_ms + quota.window_ms;
                    self.store
                        .create(identifier, endpoint, tier, 1, reset_ms)
                        .await?;
                    (1, reset_ms)
                }
            };

            min_remaining = min_remaining.min(quota.requests.saturating_sub(count));
            soonest_reset = soonest_reset.min(reset_ms);
        }

        Ok(Decision::allowed(min_remaining, soonest_reset))
    }
}

/// Current wall-clock time as epoch milliseconds.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
