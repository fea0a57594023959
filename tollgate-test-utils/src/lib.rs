//! Tollgate Test Utilities
//!
//! Shared test infrastructure for the tollgate workspace:
//! - A fault-injecting store wrapper ([`FlakyStore`])
//! - Event sinks that record or reject events
//! - A plain [`TestRequest`] implementing `GateRequest`
//! - Proptest generators, fixtures and assertions

pub use tollgate_core::{
    Clock, ConfigError, GateConfig, GateError, GateEvent, GateRequest, ManualClock, RatePolicy,
    RateUnit, RunError, Scope, SinkError, StoreError, StoreResult, Timestamp,
};
pub use tollgate_storage::{InMemoryStore, KeyValueStore, SlidingWindowLog, WindowAdmission};

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate_core::EventSink;

// ============================================================================
// FAULT-INJECTING STORE
// ============================================================================

/// Wraps a store and fails selected operations on demand.
///
/// - `fail_reads` fails `get` and `ttl`
/// - `fail_writes` fails `set`, `increment`, `delete` and sliding-window admits
/// - `fail_locks` fails `create_if_absent`
pub struct FlakyStore {
    inner: Arc<dyn KeyValueStore>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_locks: AtomicBool,
    create_calls: AtomicUsize,
    set_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_locks: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
            set_calls: AtomicUsize::new(0),
        }
    }

    /// A flaky wrapper over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// Fail every operation.
    pub fn down(self) -> Self {
        self.set_fail_reads(true);
        self.set_fail_writes(true);
        self.set_fail_locks(true);
        self
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_locks(&self, fail: bool) {
        self.fail_locks.store(fail, Ordering::SeqCst);
    }

    /// How many times `create_if_absent` was called, failed or not.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// How many times `set` was called, failed or not.
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner
    }

    fn check(&self, flag: &AtomicBool) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable {
                backend: "flaky".to_string(),
                reason: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check(&self.fail_reads)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&self.fail_writes)?;
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StoreResult<i64> {
        self.check(&self.fail_writes)?;
        self.inner.increment(key, ttl_on_create).await
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&self.fail_locks)?;
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.delete(key).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check(&self.fail_reads)?;
        self.inner.ttl(key).await
    }

    fn sliding_window(&self) -> Option<&dyn SlidingWindowLog> {
        self.inner.sliding_window().map(|_| self as &dyn SlidingWindowLog)
    }
}

#[async_trait]
impl SlidingWindowLog for FlakyStore {
    async fn admit(&self, key: &str, limit: u32, window: Duration) -> StoreResult<WindowAdmission> {
        self.check(&self.fail_writes)?;
        match self.inner.sliding_window() {
            Some(log) => log.admit(key, limit, window).await,
            None => Err(StoreError::Unavailable {
                backend: "flaky".to_string(),
                reason: "inner store has no sliding-window log".to_string(),
            }),
        }
    }
}

// ============================================================================
// EVENT SINKS
// ============================================================================

/// Keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GateEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GateEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events whose name matches, e.g. `"rate_limit_exceeded"`.
    pub fn named(&self, name: &str) -> Vec<GateEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &GateEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .map_err(|_| SinkError::Closed)?
            .push(event.clone());
        Ok(())
    }
}

/// Rejects every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingSink;

impl EventSink for FailingSink {
    fn emit(&self, _event: &GateEvent) -> Result<(), SinkError> {
        Err(SinkError::Delivery {
            reason: "sink unavailable".to_string(),
        })
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// A framework-free request for exercising the guard.
#[derive(Debug, Clone, Default)]
pub struct TestRequest {
    method: String,
    headers: Vec<(String, String)>,
    caller: Option<String>,
    ip: Option<IpAddr>,
}

impl TestRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::new("GET")
    }

    pub fn post() -> Self {
        Self::new("POST")
    }

    pub fn patch() -> Self {
        Self::new("PATCH")
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the default idempotency header.
    pub fn idempotency_key(self, key: impl Into<String>) -> Self {
        self.header(tollgate_core::constants::DEFAULT_IDEMPOTENCY_HEADER, key)
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Panics on an unparseable address; test input only.
    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.parse().unwrap_or_else(|_| panic!("invalid test IP: {ip}")));
        self
    }
}

impl GateRequest for TestRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn caller_id(&self) -> Option<String> {
        self.caller.clone()
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.ip
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tollgate inputs.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_rate_unit() -> impl Strategy<Value = RateUnit> {
        prop_oneof![
            Just(RateUnit::Second),
            Just(RateUnit::Minute),
            Just(RateUnit::Hour),
            Just(RateUnit::Day),
        ]
    }

    /// Policies small enough to exhaust in a test.
    pub fn arb_rate_policy() -> impl Strategy<Value = RatePolicy> {
        (1u32..50, arb_rate_unit()).prop_filter_map("positive limit", |(limit, unit)| {
            RatePolicy::new(limit, unit).ok()
        })
    }

    /// Policy expressions with random casing and padding.
    pub fn arb_policy_expression() -> impl Strategy<Value = String> {
        (1u32..10_000, arb_rate_unit(), any::<bool>(), " {0,2}").prop_map(
            |(limit, unit, upper, pad)| {
                let unit = if upper {
                    unit.as_str().to_uppercase()
                } else {
                    unit.as_str().to_string()
                };
                format!("{pad}{limit}/{unit}{pad}")
            },
        )
    }

    pub fn arb_ttl_expression() -> impl Strategy<Value = String> {
        (1u64..1000, prop_oneof![Just(""), Just("s"), Just("m"), Just("h"), Just("d")])
            .prop_map(|(n, unit)| format!("{n}{unit}"))
    }

    pub fn arb_idempotency_key() -> impl Strategy<Value = String> {
        "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
    }

    pub fn arb_caller_id() -> impl Strategy<Value = String> {
        "user-[a-z0-9]{1,12}"
    }

    pub fn arb_scope() -> impl Strategy<Value = Scope> {
        prop_oneof![Just(Scope::PerCaller), Just(Scope::Global)]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores, clocks and configuration.

    use super::*;
    use chrono::TimeZone;

    /// 2026-01-01T00:00:00Z
    pub fn fixed_start() -> Timestamp {
        chrono::Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(chrono::Utc::now)
    }

    pub fn manual_clock() -> ManualClock {
        ManualClock::new(fixed_start())
    }

    /// An in-memory store driven by a manual clock.
    pub fn memory_store_with_clock() -> (Arc<InMemoryStore>, ManualClock) {
        let clock = manual_clock();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        (store, clock)
    }

    pub fn policy(expression: &str) -> RatePolicy {
        RatePolicy::parse(expression)
            .unwrap_or_else(|e| panic!("invalid test policy {expression:?}: {e}"))
    }

    /// Default configuration with a `5/minute` default policy.
    pub fn test_config() -> GateConfig {
        let mut config = GateConfig::default();
        config.rate_limit.default = Some(policy("5/minute"));
        config
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for gate outcomes.

    use super::*;

    /// Assert a rate limit denial and return its retry-after.
    #[track_caller]
    pub fn assert_rate_limited<T: std::fmt::Debug>(result: &Result<T, GateError>) -> u64 {
        match result {
            Err(GateError::RateLimited {
                retry_after_secs, ..
            }) => *retry_after_secs,
            other => panic!("Expected RateLimited, got: {:?}", other),
        }
    }

    /// Assert an idempotency conflict.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug, E: std::fmt::Debug>(result: &Result<T, RunError<E>>) {
        match result {
            Err(RunError::Gate(GateError::Conflict { .. })) => {}
            other => panic!("Expected Conflict, got: {:?}", other),
        }
    }

    /// Assert `1 <= retry_after <= window`.
    #[track_caller]
    pub fn assert_retry_within_window(retry_after_secs: u64, policy: &RatePolicy) {
        assert!(
            (1..=policy.window_secs()).contains(&retry_after_secs),
            "retry_after {} outside [1, {}] for {}",
            retry_after_secs,
            policy.window_secs(),
            policy
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_store_injects_failures() {
        let store = FlakyStore::in_memory();
        store.set("k", b"v", None).await.unwrap();

        store.set_fail_reads(true);
        assert!(store.get("k").await.is_err());
        store.set_fail_reads(false);
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        store.set_fail_locks(true);
        assert!(store
            .create_if_absent("lock", b"t", Duration::from_secs(1))
            .await
            .is_err());
        assert_eq!(store.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_flaky_store_exposes_sliding_window_of_inner() {
        let store = FlakyStore::in_memory();
        let log = store.sliding_window().unwrap();
        assert!(log.admit("w", 1, Duration::from_secs(1)).await.unwrap().admitted);

        store.set_fail_writes(true);
        assert!(log.admit("w", 1, Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn test_request_header_lookup_is_case_insensitive() {
        let req = TestRequest::post().idempotency_key("abc").caller("u1").ip("10.0.0.1");
        assert_eq!(GateRequest::header(&req, "x-idempotency-key"), Some("abc"));
        assert_eq!(req.method(), "POST");
        assert_eq!(req.caller_id().as_deref(), Some("u1"));
        assert!(req.client_ip().is_some());
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        let event = GateEvent::IdempotencyConflict {
            operation: "op".to_string(),
            key: "k".to_string(),
        };
        sink.emit(&event).unwrap();
        assert_eq!(sink.named("idempotency_conflict"), vec![event]);
        assert!(FailingSink.emit(&sink.events()[0]).is_err());
    }
}
