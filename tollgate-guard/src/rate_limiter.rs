//! Admit/deny decisions for `(policy, key)` pairs.
//!
//! Two algorithms are available. The sliding window keeps a log of admission
//! timestamps and needs a store with [`SlidingWindowLog`]. The fixed window
//! increments a counter whose TTL is set when the counter is created, and
//! works on any store. The fixed window can admit up to twice the limit
//! across a window boundary; every [`RateDecision`] records which algorithm
//! produced it.
//!
//! Store failures never escape [`RateLimiter::check`]. They are logged and
//! resolved by the configured [`FailureMode`].

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::clock::elapsed_between;
use tollgate_core::{
    ConfigError, FailureMode, GateError, RateAlgorithm, RatePolicy, ScopedKey, StoreError,
    StoreResult,
};
use tollgate_storage::{KeyValueStore, SlidingWindowLog};

/// Which algorithm produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSemantics {
    SlidingWindow,
    FixedWindow,
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Calls left in the current window.
    pub remaining: u32,
    /// Seconds until a retry can succeed. Zero when allowed, otherwise in
    /// `[1, window]`.
    pub retry_after_secs: u64,
    pub semantics: WindowSemantics,
    /// The store failed and the decision came from the failure mode.
    pub degraded: bool,
}

impl RateDecision {
    /// Turn a denial into the user-visible error.
    pub fn into_result(self, policy: &RatePolicy) -> Result<RateDecision, GateError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(GateError::RateLimited {
                retry_after_secs: self.retry_after_secs,
                limit: self.limit,
                window_secs: policy.window_secs(),
                message: None,
            })
        }
    }
}

/// Stateless coordinator over the shared store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    semantics: WindowSemantics,
    failure_mode: FailureMode,
}

impl RateLimiter {
    /// Create a limiter, resolving `algorithm` against the store's capabilities.
    ///
    /// Fails when [`RateAlgorithm::SlidingWindow`] is requested on a store
    /// without a sliding-window log.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        algorithm: RateAlgorithm,
        failure_mode: FailureMode,
    ) -> Result<Self, ConfigError> {
        let has_log = store.sliding_window().is_some();
        let semantics = match algorithm {
            RateAlgorithm::Auto if has_log => WindowSemantics::SlidingWindow,
            RateAlgorithm::Auto => WindowSemantics::FixedWindow,
            RateAlgorithm::SlidingWindow if has_log => WindowSemantics::SlidingWindow,
            RateAlgorithm::SlidingWindow => {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "rate_limit.algorithm = sliding_window".to_string(),
                    option_b: format!("store.backend = {}", store.backend_name()),
                })
            }
            RateAlgorithm::FixedWindow => WindowSemantics::FixedWindow,
        };

        tracing::debug!(
            backend = store.backend_name(),
            semantics = ?semantics,
            failure_mode = %failure_mode,
            "Rate limiter configured"
        );

        Ok(Self {
            store,
            semantics,
            failure_mode,
        })
    }

    pub fn semantics(&self) -> WindowSemantics {
        self.semantics
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Decide whether one more call under `key` fits `policy`.
    pub async fn check(&self, key: &ScopedKey, policy: &RatePolicy) -> RateDecision {
        let result = match (self.semantics, self.store.sliding_window()) {
            (WindowSemantics::SlidingWindow, Some(log)) => self.check_sliding(log, key, policy).await,
            _ => self.check_fixed(key, policy).await,
        };

        match result {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    backend = self.store.backend_name(),
                    failure_mode = %self.failure_mode,
                    error = %e,
                    "Rate limit store failure"
                );
                self.degraded(policy)
            }
        }
    }

    async fn check_sliding(
        &self,
        log: &dyn SlidingWindowLog,
        key: &ScopedKey,
        policy: &RatePolicy,
    ) -> StoreResult<RateDecision> {
        let window = policy.window();
        let admission = log.admit(key.as_str(), policy.limit(), window).await?;

        if admission.admitted {
            return Ok(self.allowed(policy, policy.limit().saturating_sub(admission.count)));
        }

        let retry = match admission.oldest {
            Some(oldest) => {
                let age = elapsed_between(oldest, admission.now);
                ceil_secs(window.saturating_sub(age)) + 1
            }
            None => policy.window_secs(),
        };
        Ok(self.denied(policy, retry))
    }

    async fn check_fixed(&self, key: &ScopedKey, policy: &RatePolicy) -> StoreResult<RateDecision> {
        let window = policy.window();
        let count = self.store.increment(key.as_str(), window).await?;
        let count = u64::try_from(count).map_err(|_| StoreError::TypeMismatch {
            key: key.to_string(),
            reason: format!("counter is negative ({})", count),
        })?;
        let limit = u64::from(policy.limit());

        if count <= limit {
            let remaining = u32::try_from(limit - count).unwrap_or(0);
            return Ok(self.allowed(policy, remaining));
        }

        let retry = match self.store.ttl(key.as_str()).await {
            Ok(Some(ttl)) => ceil_secs(ttl),
            Ok(None) => policy.window_secs(),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Counter TTL unavailable, using full window");
                policy.window_secs()
            }
        };
        Ok(self.denied(policy, retry))
    }

    fn allowed(&self, policy: &RatePolicy, remaining: u32) -> RateDecision {
        RateDecision {
            allowed: true,
            limit: policy.limit(),
            remaining,
            retry_after_secs: 0,
            semantics: self.semantics,
            degraded: false,
        }
    }

    fn denied(&self, policy: &RatePolicy, retry_after_secs: u64) -> RateDecision {
        RateDecision {
            allowed: false,
            limit: policy.limit(),
            remaining: 0,
            retry_after_secs: retry_after_secs.clamp(1, policy.window_secs()),
            semantics: self.semantics,
            degraded: false,
        }
    }

    fn degraded(&self, policy: &RatePolicy) -> RateDecision {
        let decision = match self.failure_mode {
            FailureMode::FailOpen => self.allowed(policy, policy.limit()),
            FailureMode::FailClosed => self.denied(policy, policy.window_secs()),
        };
        RateDecision {
            degraded: true,
            ..decision
        }
    }
}

/// Whole seconds, rounding any fraction up.
fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
