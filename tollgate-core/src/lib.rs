//! Tollgate Core - Shared Types
//!
//! Rate policies, TTLs, scoped keys, the request abstraction, gate events,
//! configuration and the error taxonomy. Every other tollgate crate depends
//! on this one; it performs no I/O of its own.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod key;
pub mod policy;
pub mod request;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{add_duration, elapsed_between, Clock, ManualClock, SystemClock};
pub use config::{
    FailureMode, GateConfig, IdempotencySettings, KeySettings, LockFailurePolicy, RateAlgorithm,
    RateLimitSettings, StoreSettings,
};
pub use error::{
    ConfigError, GateError, RunError, SinkError, StoreError, StoreResult, TollgateError,
    TollgateResult,
};
pub use event::{
    emit_quietly, BroadcastSink, EventSink, FanoutSink, GateEvent, NoopSink, TracingSink,
};
pub use key::{KeyBuilder, Scope, ScopedKey};
pub use policy::{parse_ttl, RatePolicy, RateUnit, Ttl};
pub use request::GateRequest;
