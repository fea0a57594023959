//! Backend selection.
//!
//! Built-in backends are a closed [`BackendKind`]; [`open_store`] builds one
//! from [`StoreSettings`]. Hosts with their own store implement
//! [`StoreProvider`] and register it by name on a [`StoreRegistry`], which
//! falls back to the built-ins for `memory` and `redis`.

use crate::memory::InMemoryStore;
use crate::traits::KeyValueStore;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tollgate_core::{ConfigError, StoreError, StoreSettings, TollgateResult};

/// Built-in store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Process-local [`InMemoryStore`].
    Memory,
    /// Shared Redis server (requires the `redis` feature).
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in_memory" | "local" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            _ => Err(ConfigError::UnsupportedBackend {
                backend: s.to_string(),
            }),
        }
    }
}

/// Builds a store for a named, host-provided backend.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open(&self, settings: &StoreSettings) -> TollgateResult<Arc<dyn KeyValueStore>>;
}

/// Open one of the built-in backends.
///
/// For [`BackendKind::Memory`] a background sweeper is started when called
/// inside a tokio runtime.
pub async fn open_store(settings: &StoreSettings) -> TollgateResult<Arc<dyn KeyValueStore>> {
    let kind: BackendKind = settings.backend.parse()?;
    match kind {
        BackendKind::Memory => {
            let store = Arc::new(InMemoryStore::new());
            if tokio::runtime::Handle::try_current().is_ok() {
                store.spawn_sweeper(settings.sweep_interval.as_duration());
            }
            tracing::info!(backend = %kind, "Opened store");
            Ok(store)
        }
        BackendKind::Redis => open_redis(settings).await,
    }
}

#[cfg(feature = "redis")]
async fn open_redis(settings: &StoreSettings) -> TollgateResult<Arc<dyn KeyValueStore>> {
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| ConfigError::MissingRequired {
            field: "store.url".to_string(),
        })?;
    let store = crate::redis_backend::RedisStore::connect(url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(_settings: &StoreSettings) -> TollgateResult<Arc<dyn KeyValueStore>> {
    Err(ConfigError::UnsupportedBackend {
        backend: "redis (built without the `redis` feature)".to_string(),
    }
    .into())
}

/// Named store providers, consulted before the built-in backends.
#[derive(Default)]
pub struct StoreRegistry {
    providers: RwLock<HashMap<String, Arc<dyn StoreProvider>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`, returning any provider it replaces.
    pub fn register(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn StoreProvider>,
    ) -> TollgateResult<Option<Arc<dyn StoreProvider>>> {
        let name = name.into().trim().to_lowercase();
        let mut providers = self
            .providers
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(providers.insert(name, provider))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers
            .read()
            .map(|p| p.contains_key(&name.trim().to_lowercase()))
            .unwrap_or(false)
    }

    /// Open the backend named by `settings.backend`.
    pub async fn open(&self, settings: &StoreSettings) -> TollgateResult<Arc<dyn KeyValueStore>> {
        let name = settings.backend.trim().to_lowercase();
        let provider = self
            .providers
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(&name)
            .cloned();

        match provider {
            Some(provider) => {
                tracing::info!(backend = %name, "Opening registered store provider");
                provider.open(settings).await
            }
            None => open_store(settings).await,
        }
    }
}

static DEFAULT_STORE: Lazy<Arc<InMemoryStore>> = Lazy::new(|| Arc::new(InMemoryStore::new()));

/// A process-wide in-memory store, for hosts that do not wire their own.
///
/// Every call returns the same instance. No sweeper runs on it; expired
/// entries are removed on access.
pub fn default_store() -> Arc<dyn KeyValueStore> {
    DEFAULT_STORE.clone()
}
