//! Tollgate API - Axum Glue
//!
//! Wires the [`Gate`] into an axum application:
//! - [`request`]: `GateRequest` for incoming HTTP requests
//! - [`middleware`]: rate limit and idempotency layers
//! - [`error`]: 429 / 409 / 500 mapping for gate outcomes
//! - [`telemetry`]: tracing subscriber setup

pub mod error;
pub mod middleware;
pub mod request;
pub mod telemetry;

pub use error::{ApiError, ErrorCode, GateRejection};
pub use middleware::{
    idempotency_middleware, rate_limit_middleware, CachedResponse, IdempotencyState,
    RateLimitState,
};
pub use request::{extract_client_ip, CallerId, HttpGateRequest};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};

use tollgate_core::{GateConfig, TollgateResult};
use tollgate_guard::Gate;
use tollgate_storage::{open_store, StoreRegistry};

/// Open the configured store and build a gate over it.
pub async fn build_gate(config: &GateConfig) -> TollgateResult<Gate> {
    config.validate()?;
    let store = open_store(&config.store).await?;
    tracing::info!(backend = store.backend_name(), "Gate store opened");
    Ok(Gate::from_config(config, store)?)
}

/// Like [`build_gate`], resolving the backend through `registry` so custom
/// providers can be selected by name.
pub async fn build_gate_with(registry: &StoreRegistry, config: &GateConfig) -> TollgateResult<Gate> {
    config.validate()?;
    let store = registry.open(&config.store).await?;
    tracing::info!(backend = store.backend_name(), "Gate store opened");
    Ok(Gate::from_config(config, store)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_gate_from_default_config() {
        let gate = build_gate(&GateConfig::default()).await.unwrap();
        assert_eq!(gate.store().backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_build_gate_rejects_unknown_backend() {
        let mut config = GateConfig::default();
        config.store.backend = "etcd".to_string();
        assert!(build_gate(&config).await.is_err());
    }
}
