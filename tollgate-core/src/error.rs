//! Error types for tollgate operations

use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Raised at setup time, never on first use.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid rate policy '{expression}': {reason}. Expected format: 'N/second|minute|hour|day'")]
    InvalidRatePolicy { expression: String, reason: String },

    #[error("Invalid TTL '{value}': {reason}")]
    InvalidTtl { value: String, reason: String },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Store backend not supported: {backend}")]
    UnsupportedBackend { backend: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Storage backend errors.
///
/// These never cross the `RateLimiter` / `IdempotencyCoordinator` boundary:
/// both recover from them locally and log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Store backend {backend} timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    #[error("Value at '{key}' has the wrong type: {reason}")]
    TypeMismatch { key: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Event sink failures. Always swallowed by the guard after logging.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("Event sink closed")]
    Closed,

    #[error("Event delivery failed: {reason}")]
    Delivery { reason: String },
}

/// User-visible gate outcomes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Rate limit exceeded ({limit} per {window_secs}s), retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
        window_secs: u64,
        /// Caller-facing text configured on the rule, if any.
        message: Option<String>,
    },

    #[error("A request with idempotency key '{key}' is already in progress")]
    Conflict { key: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl GateError {
    /// Seconds the caller should wait before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GateError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Attach a caller-facing message to a rate limit denial. Other errors
    /// are returned unchanged.
    pub fn with_message(self, text: impl Into<String>) -> Self {
        match self {
            GateError::RateLimited {
                retry_after_secs,
                limit,
                window_secs,
                ..
            } => GateError::RateLimited {
                retry_after_secs,
                limit,
                window_secs,
                message: Some(text.into()),
            },
            other => other,
        }
    }
}

/// Outcome of a guarded execution: either the gate refused, or the wrapped
/// operation itself failed with its own error type.
#[derive(Debug, Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Operation failed: {0}")]
    Operation(E),
}

impl<E> RunError<E> {
    /// Returns the operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            RunError::Operation(e) => Some(e),
            RunError::Gate(_) => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RunError::Gate(GateError::Conflict { .. }))
    }
}

/// Master error type for setup paths (config loading, store construction).
#[derive(Debug, Clone, Error)]
pub enum TollgateError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for tollgate setup operations.
pub type TollgateResult<T> = Result<T, TollgateError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================
