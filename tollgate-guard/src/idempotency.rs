//! Idempotent execution keyed by a client-supplied token.
//!
//! [`IdempotencyCoordinator::run`] replays a stored result when one exists,
//! otherwise takes an in-flight lock with an atomic create-if-absent, runs the
//! operation, persists a successful result, and releases the lock.
//!
//! The lock is held by a [`LockGuard`]. Normal exits release it explicitly;
//! if the `run` future is dropped mid-flight or the operation panics, the
//! guard's `Drop` schedules the delete on the current tokio runtime. Without a
//! runtime the lock TTL bounds how long the key stays blocked.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::clock::add_duration;
use tollgate_core::constants::{DEFAULT_LOCK_TTL, DEFAULT_RESULT_TTL};
use tollgate_core::{
    Clock, GateError, LockFailurePolicy, RunError, ScopedKey, StoreResult, SystemClock, Timestamp,
};
use tollgate_storage::KeyValueStore;
use uuid::Uuid;

/// A completed execution, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: serde_json::Value,
    pub created_at: Timestamp,
    pub ttl_secs: u64,
}

impl IdempotencyRecord {
    /// Whether the record has outlived its TTL at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        add_duration(self.created_at, Duration::from_secs(self.ttl_secs)) <= now
    }
}

/// Result of [`IdempotencyCoordinator::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct Execution<T> {
    pub value: T,
    /// `true` when `value` came from a stored record and the operation did
    /// not run.
    pub replayed: bool,
}

impl<T> Execution<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            replayed: false,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Stateless coordinator over the shared store.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn KeyValueStore>,
    result_ttl: Duration,
    lock_ttl: Duration,
    lock_failure: LockFailurePolicy,
    clock: Arc<dyn Clock>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            result_ttl: DEFAULT_RESULT_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_failure: LockFailurePolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_failure(mut self, policy: LockFailurePolicy) -> Self {
        self.lock_failure = policy;
        self
    }

    /// Clock used to stamp and age records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn result_ttl(&self) -> Duration {
        self.result_ttl
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Run `op` at most once per `key` within the result TTL.
    pub async fn run<T, E, F, Fut>(&self, key: &ScopedKey, op: F) -> Result<Execution<T>, RunError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_ttl(key, self.result_ttl, op).await
    }

    /// Like [`run`](Self::run) with an explicit result TTL.
    pub async fn run_with_ttl<T, E, F, Fut>(
        &self,
        key: &ScopedKey,
        result_ttl: Duration,
        op: F,
    ) -> Result<Execution<T>, RunError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.replay(key).await {
            return Ok(Execution {
                value,
                replayed: true,
            });
        }

        let guard = self.acquire(key).await?;

        // A concurrent holder may have finished between the lookup and the lock.
        if guard.is_some() {
            if let Some(value) = self.replay(key).await {
                if let Some(guard) = guard {
                    guard.release().await;
                }
                return Ok(Execution {
                    value,
                    replayed: true,
                });
            }
        }

        let outcome = op().await;

        if let Ok(value) = &outcome {
            self.persist(key, value, result_ttl).await;
        }

        if let Some(guard) = guard {
            guard.release().await;
        }

        outcome.map(Execution::fresh).map_err(RunError::Operation)
    }

    /// Load a stored result for `key`, if any.
    ///
    /// Lookup failures and undecodable records are logged and reported as
    /// absent, so the caller re-executes.
    pub async fn replay<T: DeserializeOwned>(&self, key: &ScopedKey) -> Option<T> {
        let bytes = match self.store.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Idempotency lookup failed, executing");
                return None;
            }
        };

        let record: IdempotencyRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Undecodable idempotency record, executing");
                return None;
            }
        };

        if record.is_expired(self.clock.now()) {
            return None;
        }

        match serde_json::from_value(record.result) {
            Ok(value) => {
                tracing::debug!(key = %key, "Idempotency replay");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Stored result has an unexpected shape, executing");
                None
            }
        }
    }

    /// Remove the stored result and any lock for `key`.
    pub async fn forget(&self, key: &ScopedKey) -> StoreResult<()> {
        self.store.delete(key.as_str()).await?;
        self.store.delete(&key.lock_key()).await
    }

    async fn acquire(&self, key: &ScopedKey) -> Result<Option<LockGuard>, GateError> {
        let lock_key = key.lock_key();
        let token = Uuid::now_v7().to_string();

        match self
            .store
            .create_if_absent(&lock_key, token.as_bytes(), self.lock_ttl)
            .await
        {
            Ok(true) => Ok(Some(LockGuard::new(self.store.clone(), lock_key, token))),
            Ok(false) => {
                tracing::debug!(key = %key, "Idempotency key already in flight");
                Err(GateError::Conflict {
                    key: key.to_string(),
                })
            }
            Err(e) => match self.lock_failure {
                LockFailurePolicy::RunUnguarded => {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Idempotency lock unavailable, running without mutual exclusion"
                    );
                    Ok(None)
                }
                LockFailurePolicy::Reject => {
                    tracing::warn!(key = %key, error = %e, "Idempotency lock unavailable, rejecting");
                    Err(GateError::Conflict {
                        key: key.to_string(),
                    })
                }
            },
        }
    }

    async fn persist<T: Serialize>(&self, key: &ScopedKey, value: &T, ttl: Duration) {
        let result = match serde_json::to_value(value) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Result is not serializable, not cached");
                return;
            }
        };

        let record = IdempotencyRecord {
            key: key.to_string(),
            result,
            created_at: self.clock.now(),
            ttl_secs: ttl.as_secs().max(1),
        };

        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Record encoding failed, not cached");
                return;
            }
        };

        if let Err(e) = self.store.set(key.as_str(), &bytes, Some(ttl)).await {
            tracing::warn!(key = %key, error = %e, "Failed to store idempotency result");
        }
    }
}

/// Owns an acquired in-flight lock until it is released or dropped.
///
/// Release always deletes the key. The store contract has no
/// compare-and-delete, so `token` (the lock's stored value) only identifies
/// the run in logs and when inspecting the store; it is never checked.
struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    armed: bool,
}

impl LockGuard {
    fn new(store: Arc<dyn KeyValueStore>, key: String, token: String) -> Self {
        Self {
            store,
            key,
            token,
            armed: true,
        }
    }

    /// Delete the lock now. If this future is itself dropped before the
    /// delete completes, `Drop` still schedules one.
    async fn release(mut self) {
        if let Err(e) = self.store.delete(&self.key).await {
            tracing::warn!(
                lock = %self.key,
                token = %self.token,
                error = %e,
                "Failed to release idempotency lock"
            );
        }
        self.armed = false;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let key = std::mem::take(&mut self.key);
                let token = std::mem::take(&mut self.token);
                tracing::debug!(lock = %key, token = %token, "Releasing abandoned idempotency lock");
                handle.spawn(async move {
                    if let Err(e) = store.delete(&key).await {
                        tracing::warn!(
                            lock = %key,
                            token = %token,
                            error = %e,
                            "Failed to release abandoned idempotency lock"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    lock = %self.key,
                    "No runtime to release idempotency lock; it expires with its TTL"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate_core::{KeyBuilder, Scope};
    use tollgate_test_utils::fixtures::memory_store_with_clock;
    use tollgate_test_utils::{FlakyStore, InMemoryStore};

    fn key(raw: &str) -> ScopedKey {
        KeyBuilder::new("test:idem")
            .unwrap()
            .build("payments.charge", Scope::PerCaller, Some("u1"), raw)
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        id: u32,
        amount: u64,
    }

    #[tokio::test]
    async fn test_second_run_replays() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store.clone());
        let calls = AtomicUsize::new(0);
        let k = key("abc");

        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Receipt { id: 7, amount: 4999 })
        };

        let first = coordinator.run(&k, op).await.unwrap();
        assert!(!first.replayed);
        let second = coordinator.run(&k, op).await.unwrap();
        assert!(second.replayed);
        assert_eq!(first.value, second.value);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&k.lock_key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached_and_releases_lock() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store.clone());
        let k = key("fails");

        let err = coordinator
            .run(&k, || async { Err::<Receipt, _>("card declined") })
            .await
            .unwrap_err();
        assert_eq!(err.into_operation(), Some("card declined"));
        assert_eq!(store.get(k.as_str()).await.unwrap(), None);
        assert_eq!(store.get(&k.lock_key()).await.unwrap(), None);

        let retried = coordinator
            .run(&k, || async { Ok::<_, &str>(Receipt { id: 1, amount: 1 }) })
            .await
            .unwrap();
        assert!(!retried.replayed);
    }

    #[tokio::test]
    async fn test_held_lock_is_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store.clone());
        let k = key("dup");
        store
            .create_if_absent(&k.lock_key(), b"other", Duration::from_secs(30))
            .await
            .unwrap();

        let result = coordinator
            .run(&k, || async { Ok::<_, String>(1u32) })
            .await;
        assert!(result.unwrap_err().is_conflict());
        // The other holder's lock is untouched.
        assert_eq!(store.get(&k.lock_key()).await.unwrap(), Some(b"other".to_vec()));
    }

    #[tokio::test]
    async fn test_lock_holds_run_token_and_release_is_unconditional() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store.clone());
        let k = key("slow");
        let lock_key = k.lock_key();

        let result = coordinator
            .run(&k, || async {
                let held = store.get(&lock_key).await.unwrap().unwrap();
                let token = Uuid::parse_str(std::str::from_utf8(&held).unwrap()).unwrap();
                assert_eq!(token.get_version_num(), 7);

                // The token is not compared on release.
                store.set(&lock_key, b"rewritten", None).await.unwrap();
                Ok::<_, String>(3u8)
            })
            .await
            .unwrap();

        assert_eq!(result.value, 3);
        assert_eq!(store.get(&lock_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_expires_after_ttl() {
        let (store, clock) = memory_store_with_clock();
        let coordinator = IdempotencyCoordinator::new(store)
            .with_result_ttl(Duration::from_secs(3600))
            .with_clock(Arc::new(clock.clone()));
        let k = key("ttl");
        let calls = AtomicUsize::new(0);
        let op = || async {
            Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst))
        };

        assert_eq!(coordinator.run(&k, op).await.unwrap().value, 0);
        clock.advance(Duration::from_secs(3599));
        assert!(coordinator.run(&k, op).await.unwrap().replayed);
        clock.advance(Duration::from_secs(1));
        let third = coordinator.run(&k, op).await.unwrap();
        assert!(!third.replayed);
        assert_eq!(third.value, 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_reexecutes() {
        let store = Arc::new(FlakyStore::in_memory());
        let coordinator = IdempotencyCoordinator::new(store.clone());
        let k = key("lookup");

        coordinator.run(&k, || async { Ok::<_, String>(1u8) }).await.unwrap();
        store.set_fail_reads(true);
        let again = coordinator.run(&k, || async { Ok::<_, String>(2u8) }).await.unwrap();
        assert!(!again.replayed);
        assert_eq!(again.value, 2);
    }

    #[tokio::test]
    async fn test_lock_failure_runs_unguarded_by_default() {
        let store = Arc::new(FlakyStore::in_memory());
        store.set_fail_locks(true);
        let coordinator = IdempotencyCoordinator::new(store);
        let result = coordinator
            .run(&key("unguarded"), || async { Ok::<_, String>("done".to_string()) })
            .await
            .unwrap();
        assert_eq!(result.value, "done");
    }

    #[tokio::test]
    async fn test_lock_failure_can_reject() {
        let store = Arc::new(FlakyStore::in_memory());
        store.set_fail_locks(true);
        let coordinator =
            IdempotencyCoordinator::new(store).with_lock_failure(LockFailurePolicy::Reject);
        let ran = AtomicUsize::new(0);
        let result = coordinator
            .run(&key("reject"), || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_after_success_still_returns_result() {
        let store = Arc::new(FlakyStore::in_memory());
        let coordinator = IdempotencyCoordinator::new(store.clone());
        store.set_fail_writes(true);
        let result = coordinator
            .run(&key("persist"), || async { Ok::<_, String>(42u32) })
            .await
            .unwrap();
        assert_eq!(result.value, 42);
        assert_eq!(store.set_calls(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_a_miss() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store.clone());
        let k = key("garbage");
        store.set(k.as_str(), b"not json", None).await.unwrap();
        let result = coordinator.run(&k, || async { Ok::<_, String>(5u8) }).await.unwrap();
        assert!(!result.replayed);
    }

    #[tokio::test]
    async fn test_forget_forces_reexecution() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let k = key("forget");
        coordinator.run(&k, || async { Ok::<_, String>(1u8) }).await.unwrap();
        coordinator.forget(&k).await.unwrap();
        let again = coordinator.run(&k, || async { Ok::<_, String>(2u8) }).await.unwrap();
        assert!(!again.replayed);
    }
}
