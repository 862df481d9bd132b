//! Counter persistence: the [`CounterStore`] trait and its in-memory
//! implementation.
//!
//! The rate limiter never talks to a database directly; it consumes the
//! [`CounterStore`] trait, which holds at most one live record per
//! `(identifier, endpoint, tier)` triple. The bundled
//! [`MemoryCounterStore`] backs the default deployment and every test.
//! A database-backed store implements the same trait out of tree.
//!
//! No transactional guarantee spans multiple records: each tier's
//! read-then-write is an independent operation, and racing creates for
//! the same triple resolve last-writer-wins.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::rate_limit::Tier;

/// A persisted request counter for one `(identifier, endpoint, tier)`
/// triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    /// Store-assigned record id, unique across the store's lifetime.
    pub id: u64,
    /// Opaque client identity (e.g. source IP).
    pub identifier: String,
    /// Logical name of the protected operation.
    pub endpoint: String,
    /// Which time-window policy this record tracks.
    pub tier: Tier,
    /// Requests accepted in the current window.
    pub count: u32,
    /// Epoch milliseconds at which this window expires.
    pub reset_ms: u64,
}

/// A store-layer failure. The limiter converts every occurrence into a
/// fail-open allowance; it never propagates to the end caller.
#[derive(Debug)]
pub struct StoreError {
    message: String,
}

impl StoreError {
    /// Creates a new store error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "counter store error: {}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Abstract persistence for rate-limit counters.
///
/// Object-safe so the limiter can hold `Arc<dyn CounterStore>` and tests
/// can substitute failing doubles.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Returns the live record for the triple, if one exists.
    async fn find_one(
        &self,
        identifier: &str,
        endpoint: &str,
        tier: Tier,
    ) -> Result<Option<Counter>, StoreError>;

    /// Creates (or replaces, last-writer-wins) the record for the triple.
    async fn create(
        &self,
        identifier: &str,
        endpoint: &str,
        tier: Tier,
        count: u32,
        reset_ms: u64,
    ) -> Result<Counter, StoreError>;

    /// Sets the count on an existing record.
    ///
    /// A missing id is not an error: the record may have been swept or
    /// replaced concurrently, and both paths converge on a fresh record
    /// at the next access.
    async fn update_count(&self, id: u64, count: u32) -> Result<(), StoreError>;

    /// Deletes every record whose window expired before `before_ms`,
    /// returning the number removed. Called from the periodic sweeper,
    /// never from the request hot path.
    async fn delete_expired(&self, before_ms: u64) -> Result<u64, StoreError>;
}

/// Lookup key for one counter record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    identifier: String,
    endpoint: String,
    tier: Tier,
}

/// An in-memory [`CounterStore`] backed by a concurrent hash map.
///
/// Shared across handlers via `Arc`; all operations are lock-free reads
/// or per-shard writes. Suitable as the default single-process store and
/// as the test double.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    records: DashMap<CounterKey, Counter>,
    ids: DashMap<u64, CounterKey>,
    next_id: AtomicU64,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn find_one(
        &self,
        identifier: &str,
        endpoint: &str,
        tier: Tier,
    ) -> Result<Option<Counter>, StoreError> {
        let key = CounterKey {
            identifier: identifier.to_owned(),
            endpoint: endpoint.to_owned(),
            tier,
        };
        Ok(self.records.get(&key).map(|r| r.clone()))
    }

    async fn create(
        &self,
        identifier: &str,
        endpoint: &str,
        tier: Tier,
        count: u32,
        reset_ms: u64,
    ) -> Result<Counter, StoreError> {
        let key = CounterKey {
            identifier: identifier.to_owned(),
            endpoint: endpoint.to_owned(),
            tier,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let counter = Counter {
            id,
            identifier: identifier.to_owned(),
            endpoint: endpoint.to_owned(),
            tier,
            count,
            reset_ms,
        };

        if let Some(previous) = self.records.insert(key.clone(), counter.clone()) {
            self.ids.remove(&previous.id);
        }
        self.ids.insert(id, key);

        Ok(counter)
    }

    async fn update_count(&self, id: u64, count: u32) -> Result<(), StoreError> {
        let key = match self.ids.get(&id) {
            Some(entry) => entry.value().clone(),
            None => return Ok(()),
        };
        if let Some(mut record) = self.records.get_mut(&key) {
            if record.id == id {
                record.count = count;
            }
        }
        Ok(())
    }

    async fn delete_expired(&self, before_ms: u64) -> Result<u64, StoreError> {
        let before = self.records.len() as u64;
        self.records.retain(|_, record| record.reset_ms >= before_ms);
        self.ids
            .retain(|_, key| self.records.contains_key(&*key));
        Ok(before.saturating_sub(self.records.len() as u64))
    }
}
