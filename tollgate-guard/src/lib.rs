//! Tollgate Guard - Rate Limiting and Idempotent Execution
//!
//! Stateless coordinators over a shared [`KeyValueStore`]:
//! - [`RateLimiter`]: admit/deny against an `N/period` policy
//! - [`IdempotencyCoordinator`]: replay stored results, serialize duplicates
//! - [`Gate`]: the explicit guard glue code calls at a request boundary

pub mod gate;
pub mod idempotency;
pub mod rate_limiter;

pub use gate::{Gate, GateBuilder, IdempotencyRule, RateKey, RateRule};
pub use idempotency::{Execution, IdempotencyCoordinator, IdempotencyRecord};
pub use rate_limiter::{RateDecision, RateLimiter, WindowSemantics};

pub use tollgate_core::{GateError, GateRequest, RunError};
pub use tollgate_storage::KeyValueStore;
