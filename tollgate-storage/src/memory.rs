//! Process-local store.
//!
//! A single `std::sync::Mutex` guards the whole map. Every trait method takes
//! the lock once, performs its read-modify-write, and releases it before
//! returning, so the lock is never held across an `.await`. Expired entries
//! are removed lazily on access; [`InMemoryStore::spawn_sweeper`] adds a
//! periodic purge for long-running processes.

use crate::traits::{KeyValueStore, SlidingWindowLog, WindowAdmission};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tollgate_core::clock::{add_duration, elapsed_between};
use tollgate_core::{Clock, StoreError, StoreResult, SystemClock, Timestamp};

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Counter(i64),
    Log(VecDeque<Timestamp>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Timestamp>,
}

impl Entry {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Mutex-guarded in-process [`KeyValueStore`] with sliding-window support.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for every expiry and window decision.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .map(|map| map.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now));
        Ok(before - map.len())
    }

    /// Purge expired entries every `interval` on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "Purged expired store entries"),
                    Err(e) => {
                        tracing::warn!(error = %e, "Store sweep failed");
                    }
                }
            }
        })
    }
}

/// Look up `key`, removing it first if it has expired.
fn live_entry<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Timestamp,
) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| e.is_expired(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn type_mismatch(key: &str, reason: &str) -> StoreError {
    StoreError::TypeMismatch {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        match live_entry(&mut map, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string().into_bytes())),
            Some(Value::Log(_)) => Err(type_mismatch(key, "entry is a sliding-window log")),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: ttl.map(|ttl| add_duration(now, ttl)),
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StoreResult<i64> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        if let Some(entry) = live_entry(&mut map, key, now) {
            let current = match &entry.value {
                Value::Counter(n) => *n,
                Value::Bytes(bytes) => std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| type_mismatch(key, "value is not an integer"))?,
                Value::Log(_) => return Err(type_mismatch(key, "entry is a sliding-window log")),
            };
            let next = current
                .checked_add(1)
                .ok_or_else(|| type_mismatch(key, "counter overflow"))?;
            entry.value = Value::Counter(next);
            return Ok(next);
        }

        map.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(1),
                expires_at: Some(add_duration(now, ttl_on_create)),
            },
        );
        Ok(1)
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        if live_entry(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(add_duration(now, ttl)),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        Ok(live_entry(&mut map, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| elapsed_between(now, at)))
    }

    fn sliding_window(&self) -> Option<&dyn SlidingWindowLog> {
        Some(self)
    }
}

#[async_trait]
impl SlidingWindowLog for InMemoryStore {
    async fn admit(&self, key: &str, limit: u32, window: Duration) -> StoreResult<WindowAdmission> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Log(VecDeque::new()),
            expires_at: None,
        });
        let Value::Log(log) = &mut entry.value else {
            return Err(type_mismatch(key, "entry is not a sliding-window log"));
        };

        // Drop everything at least one window old.
        while log
            .front()
            .is_some_and(|oldest| elapsed_between(*oldest, now) >= window)
        {
            log.pop_front();
        }

        let admitted = log.len() < limit as usize;
        if admitted {
            log.push_back(now);
            entry.expires_at = Some(add_duration(now, window));
        }

        Ok(WindowAdmission {
            admitted,
            count: u32::try_from(log.len()).unwrap_or(u32::MAX),
            oldest: log.front().copied(),
            now,
        })
    }
}
