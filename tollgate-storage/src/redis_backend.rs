//! Redis-backed store for deployments with more than one process.
//!
//! Single commands provide the atomicity the contract asks for (`SET NX PX`
//! for create-if-absent); increment-with-expiry runs as one Lua script so the
//! counter can never be created without its TTL. Every round trip is bounded
//! by a timeout and reported as [`StoreError::Timeout`] when it elapses.

use crate::traits::KeyValueStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::future::Future;
use std::time::Duration;
use tollgate_core::constants::DEFAULT_STORE_TIMEOUT;
use tollgate_core::{StoreError, StoreResult};

const BACKEND: &str = "redis";

const INCREMENT_WITH_EXPIRY: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// [`KeyValueStore`] over a Redis server, through a reconnecting
/// [`ConnectionManager`].
pub struct RedisStore {
    manager: ConnectionManager,
    increment_script: Script,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(unavailable)?;
        let manager = tokio::time::timeout(DEFAULT_STORE_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout {
                backend: BACKEND.to_string(),
                after: DEFAULT_STORE_TIMEOUT,
            })?
            .map_err(unavailable)?;

        tracing::info!(backend = BACKEND, "Connected to shared store");
        Ok(Self {
            manager,
            increment_script: Script::new(INCREMENT_WITH_EXPIRY),
            timeout: DEFAULT_STORE_TIMEOUT,
        })
    }

    /// Override the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(unavailable),
            Err(_) => Err(StoreError::Timeout {
                backend: BACKEND.to_string(),
                after: self.timeout,
            }),
        }
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable {
        backend: BACKEND.to_string(),
        reason: e.to_string(),
    }
}

/// Redis expiries are whole milliseconds and must be positive.
fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.bounded(async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        self.bounded(async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn increment(&self, key: &str, ttl_on_create: Duration) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        let mut invocation = self.increment_script.prepare_invoke();
        invocation.key(key).arg(millis(ttl_on_create));
        self.bounded(async move { invocation.invoke_async(&mut conn).await })
            .await
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self
            .bounded(async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _removed: i64 = self
            .bounded(async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let remaining: i64 = self
            .bounded(async move { cmd.query_async(&mut conn).await })
            .await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_is_positive() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(30)), 30_000);
        assert_eq!(millis(Duration::from_micros(1500)), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        assert!(matches!(
            RedisStore::connect("not-a-redis-url").await,
            Err(StoreError::Unavailable { .. })
        ));
    }
}
