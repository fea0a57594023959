//! Gate Configuration Module
//!
//! Configuration for rate limiting, idempotency, key namespaces and the
//! store backend. It is loaded from a TOML document or from `TOLLGATE_*`
//! environment variables, with defaults suitable for a single process.
//! Every expression (rate policies, TTLs, scopes) is parsed while loading, so
//! a malformed value surfaces as a [`ConfigError`] at startup.

use crate::constants::{
    DEFAULT_IDEMPOTENCY_HEADER, DEFAULT_IDEMPOTENCY_KEY_PREFIX, DEFAULT_IDEMPOTENT_METHODS,
    DEFAULT_LOCK_TTL, DEFAULT_RATE_KEY_PREFIX, DEFAULT_RESULT_TTL, DEFAULT_SWEEP_INTERVAL,
};
use crate::error::ConfigError;
use crate::key::{validate_prefix, Scope};
use crate::policy::{RatePolicy, Ttl};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// POLICY ENUMS
// ============================================================================

/// What the rate limiter does when the store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request and log a warning.
    #[default]
    #[serde(alias = "fail-open")]
    FailOpen,
    /// Deny the request for one full window.
    #[serde(alias = "fail-closed")]
    FailClosed,
}

/// Which window algorithm the rate limiter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAlgorithm {
    /// Sliding window when the store supports it, fixed window otherwise.
    #[default]
    Auto,
    /// Exact sliding window; requires a store with a sliding-window log.
    #[serde(alias = "sliding-window")]
    SlidingWindow,
    /// Counter with a TTL; works on any store.
    #[serde(alias = "fixed-window")]
    FixedWindow,
}

/// What the coordinator does when the in-flight lock cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockFailurePolicy {
    /// Log a warning and run the operation without mutual exclusion.
    #[default]
    #[serde(alias = "run-unguarded")]
    RunUnguarded,
    /// Refuse with a conflict so the caller retries later.
    Reject,
}

macro_rules! snake_case_from_str {
    ($ty:ident, $field:literal, { $($text:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().replace('-', "_").as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ConfigError::InvalidValue {
                        field: $field.to_string(),
                        value: other.to_string(),
                        reason: concat!("expected one of: ", $($text, " "),+).trim_end().to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($ty::$variant => $text,)+
                };
                f.write_str(text)
            }
        }
    };
}

snake_case_from_str!(FailureMode, "rate_limit.failure_mode", {
    "fail_open" => FailOpen,
    "fail_closed" => FailClosed,
});

snake_case_from_str!(RateAlgorithm, "rate_limit.algorithm", {
    "auto" => Auto,
    "sliding_window" => SlidingWindow,
    "fixed_window" => FixedWindow,
});

snake_case_from_str!(LockFailurePolicy, "idempotency.lock_failure", {
    "run_unguarded" => RunUnguarded,
    "reject" => Reject,
});

// ============================================================================
// SECTIONS
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub idempotency: IdempotencySettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub keys: KeySettings,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Policy applied to operations without their own rule (e.g. "200/minute")
    #[serde(default)]
    pub default: Option<RatePolicy>,

    /// Behaviour when the store fails (default: fail_open)
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Window algorithm (default: auto)
    #[serde(default)]
    pub algorithm: RateAlgorithm,
}

/// Idempotency configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencySettings {
    /// Request header carrying the key (default: X-Idempotency-Key)
    #[serde(default = "default_header")]
    pub header: String,

    /// How long a completed result is replayed (default: 24h)
    #[serde(default = "default_result_ttl")]
    pub result_ttl: Ttl,

    /// Upper bound on how long a crashed execution blocks its key (default: 30s)
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: Ttl,

    /// Key partitioning (default: per_caller)
    #[serde(default)]
    pub scope: Scope,

    /// Methods that are deduplicated (default: POST, PATCH)
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,

    /// Behaviour when the lock cannot be written (default: run_unguarded)
    #[serde(default)]
    pub lock_failure: LockFailurePolicy,
}

/// Store backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Built-in backend name (`memory`, `redis`) or a registered provider name
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Connection URL for shared backends
    #[serde(default)]
    pub url: Option<String>,

    /// How often the in-memory store purges expired entries (default: 60s)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Ttl,
}

/// Key namespace configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySettings {
    #[serde(default = "default_rate_prefix")]
    pub rate_prefix: String,

    #[serde(default = "default_idempotency_prefix")]
    pub idempotency_prefix: String,
}

// Default value functions
fn default_header() -> String {
    DEFAULT_IDEMPOTENCY_HEADER.to_string()
}

fn default_result_ttl() -> Ttl {
    Ttl(DEFAULT_RESULT_TTL)
}

fn default_lock_ttl() -> Ttl {
    Ttl(DEFAULT_LOCK_TTL)
}

fn default_sweep_interval() -> Ttl {
    Ttl(DEFAULT_SWEEP_INTERVAL)
}

fn default_methods() -> Vec<String> {
    DEFAULT_IDEMPOTENT_METHODS
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_rate_prefix() -> String {
    DEFAULT_RATE_KEY_PREFIX.to_string()
}

fn default_idempotency_prefix() -> String {
    DEFAULT_IDEMPOTENCY_KEY_PREFIX.to_string()
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            header: default_header(),
            result_ttl: default_result_ttl(),
            lock_ttl: default_lock_ttl(),
            scope: Scope::default(),
            methods: default_methods(),
            lock_failure: LockFailurePolicy::default(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            rate_prefix: default_rate_prefix(),
            idempotency_prefix: default_idempotency_prefix(),
        }
    }
}

impl IdempotencySettings {
    /// Whether requests with `method` are deduplicated.
    pub fn applies_to(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl GateConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: GateConfig = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.message().to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `TOLLGATE_*` environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `TOLLGATE_RATE_LIMIT_DEFAULT`: default policy, e.g. "200/minute"
    /// - `TOLLGATE_RATE_LIMIT_FAILURE_MODE`: "fail_open" or "fail_closed"
    /// - `TOLLGATE_RATE_LIMIT_ALGORITHM`: "auto", "sliding_window" or "fixed_window"
    /// - `TOLLGATE_IDEMPOTENCY_HEADER`: header name (default: X-Idempotency-Key)
    /// - `TOLLGATE_IDEMPOTENCY_RESULT_TTL`: seconds or duration string (default: 24h)
    /// - `TOLLGATE_IDEMPOTENCY_LOCK_TTL`: seconds or duration string (default: 30s)
    /// - `TOLLGATE_IDEMPOTENCY_SCOPE`: "per_caller" or "global"
    /// - `TOLLGATE_IDEMPOTENCY_METHODS`: comma-separated methods (default: POST,PATCH)
    /// - `TOLLGATE_IDEMPOTENCY_LOCK_FAILURE`: "run_unguarded" or "reject"
    /// - `TOLLGATE_STORE_BACKEND`: "memory", "redis" or a registered provider
    /// - `TOLLGATE_STORE_URL`: connection URL for shared backends
    /// - `TOLLGATE_STORE_SWEEP_INTERVAL`: in-memory expiry sweep interval
    /// - `TOLLGATE_KEYS_RATE_PREFIX`, `TOLLGATE_KEYS_IDEMPOTENCY_PREFIX`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source using the `TOLLGATE_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = GateConfig::default();

        if let Some(v) = var("TOLLGATE_RATE_LIMIT_DEFAULT") {
            config.rate_limit.default = Some(v.parse()?);
        }
        if let Some(v) = var("TOLLGATE_RATE_LIMIT_FAILURE_MODE") {
            config.rate_limit.failure_mode = v.parse()?;
        }
        if let Some(v) = var("TOLLGATE_RATE_LIMIT_ALGORITHM") {
            config.rate_limit.algorithm = v.parse()?;
        }
        if let Some(v) = var("TOLLGATE_IDEMPOTENCY_HEADER") {
            config.idempotency.header = v.trim().to_string();
        }
        if let Some(v) = var("TOLLGATE_IDEMPOTENCY_RESULT_TTL") {
            config.idempotency.result_ttl = v.parse()?;
        }
        if let Some(v) = var("TOLLGATE_IDEMPOTENCY_LOCK_TTL") {
            config.idempotency.lock_ttl = v.parse()?;
        }
        if let Some(v) = var("TOLLGATE_IDEMPOTENCY_SCOPE") {
            config.idempotency.scope = v.parse()?;
        }
        if let Some(v) = var("TOLLGATE_IDEMPOTENCY_METHODS") {
            config.idempotency.methods = v
                .split(',')
                .map(|m| m.trim().to_uppercase())
                .filter(|m| !m.is_empty())
                .collect();
        }
        if let Some(v) = var("TOLLGATE_IDEMPOTENCY_LOCK_FAILURE") {
            config.idempotency.lock_failure = v.parse()?;
        }
        if let Some(v) = var("TOLLGATE_STORE_BACKEND") {
            config.store.backend = v.trim().to_lowercase();
        }
        if let Some(v) = var("TOLLGATE_STORE_URL") {
            config.store.url = Some(v.trim().to_string());
        }
        if let Some(v) = var("TOLLGATE_STORE_SWEEP_INTERVAL") {
            config.store.sweep_interval = v.parse()?;
        }
        if let Some(v) = var("TOLLGATE_KEYS_RATE_PREFIX") {
            config.keys.rate_prefix = v.trim().to_string();
        }
        if let Some(v) = var("TOLLGATE_KEYS_IDEMPOTENCY_PREFIX") {
            config.keys.idempotency_prefix = v.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_header_name(&self.idempotency.header)?;

        if self.idempotency.methods.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "idempotency.methods".to_string(),
            });
        }
        for method in &self.idempotency.methods {
            if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
                return Err(ConfigError::InvalidValue {
                    field: "idempotency.methods".to_string(),
                    value: method.clone(),
                    reason: "expected an HTTP method name".to_string(),
                });
            }
        }

        if self.idempotency.lock_ttl.as_duration() > self.idempotency.result_ttl.as_duration() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("idempotency.lock_ttl = {}", self.idempotency.lock_ttl),
                option_b: format!("idempotency.result_ttl = {}", self.idempotency.result_ttl),
            });
        }

        if self.store.backend.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "store.backend".to_string(),
            });
        }
        if self.store.backend.eq_ignore_ascii_case("redis") && self.store.url.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "store.url".to_string(),
            });
        }

        validate_prefix(&self.keys.rate_prefix)?;
        validate_prefix(&self.keys.idempotency_prefix)?;
        if self.keys.rate_prefix == self.keys.idempotency_prefix {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "keys.rate_prefix".to_string(),
                option_b: "keys.idempotency_prefix".to_string(),
            });
        }

        Ok(())
    }
}

/// Header names must be non-empty RFC 7230 tokens.
fn validate_header_name(name: &str) -> Result<(), ConfigError> {
    const EXTRA: &[u8] = b"!#$%&'*+-.^_`|~";
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || EXTRA.contains(&b));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: "idempotency.header".to_string(),
            value: name.to_string(),
            reason: "expected a valid HTTP header name".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GateConfig::default();
        assert!(config.rate_limit.default.is_none());
        assert_eq!(config.rate_limit.failure_mode, FailureMode::FailOpen);
        assert_eq!(config.rate_limit.algorithm, RateAlgorithm::Auto);
        assert_eq!(config.idempotency.header, "X-Idempotency-Key");
        assert_eq!(config.idempotency.result_ttl.as_secs(), 86_400);
        assert_eq!(config.idempotency.lock_ttl.as_secs(), 30);
        assert_eq!(config.idempotency.scope, Scope::PerCaller);
        assert_eq!(config.idempotency.methods, vec!["POST", "PATCH"]);
        assert_eq!(config.store.backend, "memory");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = GateConfig::from_toml_str(
            r#"
            [rate_limit]
            default = "200/minute"
            failure_mode = "fail_closed"
            algorithm = "fixed_window"

            [idempotency]
            result_ttl = "1h"
            lock_ttl = 10
            scope = "global"
            methods = ["POST"]

            [store]
            backend = "redis"
            url = "redis://localhost:6379/1"
            "#,
        )
        .unwrap();

        let default = config.rate_limit.default.unwrap();
        assert_eq!(default.limit(), 200);
        assert_eq!(default.window_secs(), 60);
        assert_eq!(config.rate_limit.failure_mode, FailureMode::FailClosed);
        assert_eq!(config.rate_limit.algorithm, RateAlgorithm::FixedWindow);
        assert_eq!(config.idempotency.result_ttl.as_secs(), 3600);
        assert_eq!(config.idempotency.lock_ttl.as_secs(), 10);
        assert_eq!(config.idempotency.scope, Scope::Global);
        assert!(config.idempotency.applies_to("post"));
        assert!(!config.idempotency.applies_to("PATCH"));
        assert_eq!(config.store.url.as_deref(), Some("redis://localhost:6379/1"));
    }

    #[test]
    fn test_from_toml_accepts_kebab_case_modes() {
        let config = GateConfig::from_toml_str(
            r#"
            [rate_limit]
            failure_mode = "fail-closed"
            algorithm = "sliding-window"

            [idempotency]
            lock_failure = "run-unguarded"
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.failure_mode, FailureMode::FailClosed);
        assert_eq!(config.rate_limit.algorithm, RateAlgorithm::SlidingWindow);
        assert_eq!(config.idempotency.lock_failure, LockFailurePolicy::RunUnguarded);

        let fixed = GateConfig::from_toml_str("[rate_limit]\nalgorithm = \"fixed-window\"\n").unwrap();
        assert_eq!(fixed.rate_limit.algorithm, RateAlgorithm::FixedWindow);
        assert!(GateConfig::from_toml_str("[rate_limit]\nfailure_mode = \"fail-sideways\"\n").is_err());
    }

    #[test]
    fn test_from_toml_rejects_bad_policy() {
        let err = GateConfig::from_toml_str("[rate_limit]\ndefault = \"bad/x\"\n").unwrap_err();
        match err {
            ConfigError::Parse { reason } => assert!(reason.contains("bad/x")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_toml_rejects_bad_ttl() {
        assert!(GateConfig::from_toml_str("[idempotency]\nresult_ttl = \"forever\"\n").is_err());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = GateConfig::from_lookup(lookup_from(&[
            ("TOLLGATE_RATE_LIMIT_DEFAULT", "30/minute"),
            ("TOLLGATE_RATE_LIMIT_FAILURE_MODE", "fail-closed"),
            ("TOLLGATE_IDEMPOTENCY_RESULT_TTL", "30m"),
            ("TOLLGATE_IDEMPOTENCY_METHODS", "post, put ,"),
            ("TOLLGATE_IDEMPOTENCY_LOCK_FAILURE", "reject"),
            ("TOLLGATE_STORE_BACKEND", "Memory"),
        ]))
        .unwrap();

        assert_eq!(config.rate_limit.default.unwrap().limit(), 30);
        assert_eq!(config.rate_limit.failure_mode, FailureMode::FailClosed);
        assert_eq!(config.idempotency.result_ttl.as_secs(), 1800);
        assert_eq!(config.idempotency.methods, vec!["POST", "PUT"]);
        assert_eq!(config.idempotency.lock_failure, LockFailurePolicy::Reject);
        assert_eq!(config.store.backend, "memory");
    }

    #[test]
    fn test_from_lookup_rejects_invalid_values() {
        assert!(GateConfig::from_lookup(lookup_from(&[("TOLLGATE_RATE_LIMIT_DEFAULT", "10/x")])).is_err());
        assert!(GateConfig::from_lookup(lookup_from(&[("TOLLGATE_IDEMPOTENCY_SCOPE", "team")])).is_err());
        assert!(GateConfig::from_lookup(lookup_from(&[("TOLLGATE_RATE_LIMIT_ALGORITHM", "leaky")])).is_err());
    }

    #[test]
    fn test_redis_requires_url() {
        let err = GateConfig::from_lookup(lookup_from(&[("TOLLGATE_STORE_BACKEND", "redis")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                field: "store.url".to_string()
            }
        );
    }

    #[test]
    fn test_validate_header_and_prefixes() {
        let mut config = GateConfig::default();
        config.idempotency.header = "Bad Header".to_string();
        assert!(config.validate().is_err());

        let mut config = GateConfig::default();
        config.keys.idempotency_prefix = config.keys.rate_prefix.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_lock_ttl_cannot_exceed_result_ttl() {
        let mut config = GateConfig::default();
        config.idempotency.result_ttl = "10s".parse().unwrap();
        config.idempotency.lock_ttl = "1m".parse().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_enum_display_round_trips() {
        for mode in [FailureMode::FailOpen, FailureMode::FailClosed] {
            assert_eq!(mode.to_string().parse::<FailureMode>().unwrap(), mode);
        }
        for algo in [
            RateAlgorithm::Auto,
            RateAlgorithm::SlidingWindow,
            RateAlgorithm::FixedWindow,
        ] {
            assert_eq!(algo.to_string().parse::<RateAlgorithm>().unwrap(), algo);
        }
    }
}
