//! Store contract shared by every backend.
//!
//! [`KeyValueStore`] is deliberately small: the rate limiter and the
//! idempotency coordinator are built entirely from these primitives. Each
//! operation is atomic on its own; nothing in the contract spans two calls.

use async_trait::async_trait;
use std::time::Duration;
use tollgate_core::{StoreResult, Timestamp};

/// Minimal key-value storage contract.
///
/// # Atomicity
///
/// - `increment` must create the counter and apply `ttl_on_create` in one
///   atomic step, so two concurrent first increments cannot both leave the
///   counter without an expiry.
/// - `create_if_absent` must be a true compare-and-set: exactly one of any
///   number of concurrent callers observes `true`.
///
/// Expired entries must be indistinguishable from absent ones.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short backend name used in log fields and error values.
    fn backend_name(&self) -> &'static str;

    /// Non-destructive read.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Unconditional overwrite. `None` means the entry never expires.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// Atomically add one to the counter at `key`, creating it at 1 with
    /// `ttl_on_create` when absent. Returns the post-increment value.
    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StoreResult<i64>;

    /// Write `value` only if `key` is absent. Returns `true` iff this call
    /// created the entry.
    async fn create_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Remove `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Remaining lifetime of `key`. `None` when absent or without expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Optional capability: an atomic sliding-window log.
    fn sliding_window(&self) -> Option<&dyn SlidingWindowLog> {
        None
    }
}

/// Outcome of a single sliding-window admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    /// Whether `now` was appended to the log.
    pub admitted: bool,
    /// Entries in the window after this attempt.
    pub count: u32,
    /// Oldest timestamp still inside the window.
    pub oldest: Option<Timestamp>,
    /// The instant the store evaluated the window at.
    pub now: Timestamp,
}

/// Stores that can evaluate a sliding window atomically.
///
/// `admit` prunes timestamps at least `window` old, then appends the current
/// instant only when fewer than `limit` remain. The whole step runs under the
/// store's own serialization, never as separate read and write calls.
#[async_trait]
pub trait SlidingWindowLog: Send + Sync {
    async fn admit(&self, key: &str, limit: u32, window: Duration) -> StoreResult<WindowAdmission>;
}
