//! The request gate.
//!
//! [`Gate`] bundles the store, the rate limiter, the idempotency coordinator,
//! both key builders and the event sink. Glue code calls
//! [`Gate::check_rate`] and [`Gate::idempotent`] at the top of a protected
//! path; nothing is intercepted implicitly.
//!
//! # Example
//!
//! ```ignore
//! let gate = Gate::builder().store(store).config(config).build()?;
//! let rule = RateRule::new("search", RatePolicy::parse("30/minute")?);
//! gate.check_rate(&request, &rule).await?;
//!
//! let charge = IdempotencyRule::new("payments.charge");
//! let receipt = gate.idempotent(&request, &charge, || charge_card(payload)).await?;
//! ```

use crate::idempotency::{Execution, IdempotencyCoordinator};
use crate::rate_limiter::{RateDecision, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::{
    emit_quietly, Clock, ConfigError, EventSink, GateConfig, GateError, GateEvent, GateRequest,
    IdempotencySettings, KeyBuilder, RatePolicy, RunError, Scope, TracingSink,
};
use tollgate_storage::{default_store, KeyValueStore};

// ============================================================================
// RULES
// ============================================================================

type KeyFn = dyn Fn(&dyn GateRequest) -> String + Send + Sync;

/// How the caller is identified for a rate limit.
#[derive(Clone, Default)]
pub enum RateKey {
    /// Client IP address, `unknown` when absent.
    #[default]
    Ip,
    /// Authenticated caller, falling back to the IP for anonymous requests.
    Caller,
    /// One bucket shared by every caller.
    Global,
    /// Host-provided key function.
    Custom(Arc<KeyFn>),
}

impl RateKey {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&dyn GateRequest) -> String + Send + Sync + 'static,
    {
        RateKey::Custom(Arc::new(f))
    }

    /// The caller key for `req`, e.g. `ip:10.0.0.1` or `user:42`.
    pub fn resolve(&self, req: &dyn GateRequest) -> String {
        match self {
            RateKey::Ip => ip_key(req),
            RateKey::Caller => match req.caller_id().filter(|id| !id.is_empty()) {
                Some(id) => format!("user:{}", id),
                None => ip_key(req),
            },
            RateKey::Global => "global".to_string(),
            RateKey::Custom(f) => f(req),
        }
    }
}

fn ip_key(req: &dyn GateRequest) -> String {
    match req.client_ip() {
        Some(ip) => format!("ip:{}", ip),
        None => "ip:unknown".to_string(),
    }
}

impl fmt::Debug for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateKey::Ip => f.write_str("Ip"),
            RateKey::Caller => f.write_str("Caller"),
            RateKey::Global => f.write_str("Global"),
            RateKey::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A rate limit attached to one operation.
#[derive(Debug, Clone)]
pub struct RateRule {
    /// Operation identity, e.g. `"search"`. Buckets never span operations.
    pub operation: String,
    pub policy: RatePolicy,
    pub key: RateKey,
    /// Text returned to denied callers instead of the generic message.
    pub error_message: Option<String>,
}

impl RateRule {
    pub fn new(operation: impl Into<String>, policy: RatePolicy) -> Self {
        Self {
            operation: operation.into(),
            policy,
            key: RateKey::default(),
            error_message: None,
        }
    }

    pub fn keyed_by(mut self, key: RateKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Idempotency settings for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRule {
    pub operation: String,
    pub scope: Scope,
    /// Methods that are deduplicated; others run unguarded.
    pub methods: Vec<String>,
    /// Header carrying the client key.
    pub header: String,
    /// Result TTL; the coordinator default when `None`.
    pub ttl: Option<Duration>,
}

impl IdempotencyRule {
    /// A rule with the built-in defaults (POST/PATCH, `X-Idempotency-Key`,
    /// per-caller scope).
    pub fn new(operation: impl Into<String>) -> Self {
        Self::from_settings(operation, &IdempotencySettings::default())
    }

    pub fn from_settings(operation: impl Into<String>, settings: &IdempotencySettings) -> Self {
        Self {
            operation: operation.into(),
            scope: settings.scope,
            methods: settings.methods.iter().map(|m| m.to_uppercase()).collect(),
            header: settings.header.clone(),
            ttl: Some(settings.result_ttl.as_duration()),
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.methods = methods
            .into_iter()
            .map(|m| m.as_ref().to_uppercase())
            .collect();
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }

    pub fn applies_to(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

// ============================================================================
// GATE
// ============================================================================

/// Explicit guard for rate limiting and idempotent execution.
#[derive(Clone)]
pub struct Gate {
    store: Arc<dyn KeyValueStore>,
    limiter: RateLimiter,
    coordinator: IdempotencyCoordinator,
    rate_keys: KeyBuilder,
    idempotency_keys: KeyBuilder,
    sink: Arc<dyn EventSink>,
    default_policy: Option<RatePolicy>,
    idempotency: IdempotencySettings,
}

impl Gate {
    pub fn builder() -> GateBuilder {
        GateBuilder::default()
    }

    /// Build a gate over `store` from validated configuration.
    pub fn from_config(config: &GateConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, ConfigError> {
        Self::builder().config(config.clone()).store(store).build()
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn coordinator(&self) -> &IdempotencyCoordinator {
        &self.coordinator
    }

    /// The configured default policy as a rule for `operation`.
    pub fn default_rule(&self, operation: impl Into<String>) -> Option<RateRule> {
        self.default_policy
            .map(|policy| RateRule::new(operation, policy))
    }

    /// An idempotency rule for `operation` using the configured settings.
    pub fn idempotency_rule(&self, operation: impl Into<String>) -> IdempotencyRule {
        IdempotencyRule::from_settings(operation, &self.idempotency)
    }

    /// Check `rule` for `req`.
    ///
    /// Denials emit [`GateEvent::RateLimitExceeded`] and return
    /// [`GateError::RateLimited`].
    pub async fn check_rate(
        &self,
        req: &dyn GateRequest,
        rule: &RateRule,
    ) -> Result<RateDecision, GateError> {
        let caller_key = rule.key.resolve(req);
        let scoped = self
            .rate_keys
            .build(&rule.operation, Scope::Global, None, &caller_key);

        let decision = self.limiter.check(&scoped, &rule.policy).await;
        if !decision.allowed {
            tracing::warn!(
                operation = %rule.operation,
                key = %caller_key,
                policy = %rule.policy,
                retry_after_secs = decision.retry_after_secs,
                "Rate limit exceeded"
            );
            self.emit(&GateEvent::RateLimitExceeded {
                operation: rule.operation.clone(),
                key: caller_key,
                policy: rule.policy.to_string(),
                retry_after_secs: decision.retry_after_secs,
            });
        }
        let result = decision.into_result(&rule.policy);
        match &rule.error_message {
            Some(text) => result.map_err(|err| err.with_message(text.clone())),
            None => result,
        }
    }

    /// Check `rule` when given, otherwise the configured default. Returns
    /// `None` when neither applies.
    pub async fn check_rate_or_default(
        &self,
        req: &dyn GateRequest,
        operation: &str,
        rule: Option<&RateRule>,
    ) -> Result<Option<RateDecision>, GateError> {
        match rule {
            Some(rule) => self.check_rate(req, rule).await.map(Some),
            None => match self.default_rule(operation) {
                Some(rule) => self.check_rate(req, &rule).await.map(Some),
                None => Ok(None),
            },
        }
    }

    /// Run `op` idempotently for `req` under `rule`.
    ///
    /// When the method is not covered by the rule, or the request carries no
    /// key, `op` runs directly: no lookup, no lock, nothing stored.
    pub async fn idempotent<T, E, F, Fut>(
        &self,
        req: &dyn GateRequest,
        rule: &IdempotencyRule,
        op: F,
    ) -> Result<Execution<T>, RunError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let raw_key = match req.header(&rule.header).map(str::trim) {
            Some(key) if !key.is_empty() && rule.applies_to(req.method()) => key.to_string(),
            _ => {
                return op()
                    .await
                    .map(Execution::fresh)
                    .map_err(RunError::Operation)
            }
        };

        let caller = req.caller_id();
        let scoped = self
            .idempotency_keys
            .build(&rule.operation, rule.scope, caller.as_deref(), &raw_key);
        let ttl = rule.ttl.unwrap_or_else(|| self.coordinator.result_ttl());

        match self.coordinator.run_with_ttl(&scoped, ttl, op).await {
            Ok(execution) => {
                if execution.replayed {
                    self.emit(&GateEvent::IdempotentReplay {
                        operation: rule.operation.clone(),
                        key: raw_key,
                    });
                }
                Ok(execution)
            }
            Err(RunError::Gate(GateError::Conflict { .. })) => {
                self.emit(&GateEvent::IdempotencyConflict {
                    operation: rule.operation.clone(),
                    key: raw_key.clone(),
                });
                Err(RunError::Gate(GateError::Conflict { key: raw_key }))
            }
            Err(other) => Err(other),
        }
    }

    fn emit(&self, event: &GateEvent) {
        emit_quietly(self.sink.as_ref(), event);
    }
}

/// Builder for [`Gate`].
#[derive(Default)]
pub struct GateBuilder {
    store: Option<Arc<dyn KeyValueStore>>,
    config: GateConfig,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GateBuilder {
    /// Store to coordinate over. Defaults to the process-wide in-memory store.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Event sink. Defaults to [`TracingSink`].
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Clock for idempotency record ageing.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble the gate.
    pub fn build(self) -> Result<Gate, ConfigError> {
        let config = self.config;
        config.validate()?;

        let store = self.store.unwrap_or_else(default_store);
        let limiter = RateLimiter::new(
            store.clone(),
            config.rate_limit.algorithm,
            config.rate_limit.failure_mode,
        )?;

        let mut coordinator = IdempotencyCoordinator::new(store.clone())
            .with_result_ttl(config.idempotency.result_ttl.as_duration())
            .with_lock_ttl(config.idempotency.lock_ttl.as_duration())
            .with_lock_failure(config.idempotency.lock_failure);
        if let Some(clock) = self.clock {
            coordinator = coordinator.with_clock(clock);
        }

        Ok(Gate {
            rate_keys: KeyBuilder::new(config.keys.rate_prefix.clone())?,
            idempotency_keys: KeyBuilder::new(config.keys.idempotency_prefix.clone())?,
            store,
            limiter,
            coordinator,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            default_policy: config.rate_limit.default,
            idempotency: config.idempotency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_test_utils::fixtures::policy;
    use tollgate_test_utils::{FailingSink, InMemoryStore, RecordingSink, TestRequest};

    fn gate_with_sink(sink: Arc<dyn EventSink>) -> Gate {
        Gate::builder()
            .store(Arc::new(InMemoryStore::new()))
            .sink(sink)
            .build()
            .unwrap()
    }

    #[test]
    fn test_rate_key_resolution() {
        let anon = TestRequest::get().ip("10.0.0.1");
        let user = TestRequest::get().ip("10.0.0.1").caller("42");
        let nobody = TestRequest::get();

        assert_eq!(RateKey::Ip.resolve(&user), "ip:10.0.0.1");
        assert_eq!(RateKey::Ip.resolve(&nobody), "ip:unknown");
        assert_eq!(RateKey::Caller.resolve(&user), "user:42");
        assert_eq!(RateKey::Caller.resolve(&anon), "ip:10.0.0.1");
        assert_eq!(RateKey::Global.resolve(&anon), "global");

        let tenant = RateKey::custom(|req| {
            format!("tenant:{}", req.header("X-Tenant").unwrap_or("none"))
        });
        assert_eq!(
            tenant.resolve(&TestRequest::get().header("x-tenant", "acme")),
            "tenant:acme"
        );
    }

    #[test]
    fn test_idempotency_rule_defaults() {
        let rule = IdempotencyRule::new("orders.create");
        assert!(rule.applies_to("post"));
        assert!(rule.applies_to("PATCH"));
        assert!(!rule.applies_to("GET"));
        assert_eq!(rule.header, "X-Idempotency-Key");
        assert_eq!(rule.scope, Scope::PerCaller);
        assert_eq!(rule.ttl, Some(Duration::from_secs(86_400)));

        let rule = rule.with_methods(["put"]);
        assert!(rule.applies_to("PUT"));
        assert!(!rule.applies_to("POST"));
    }

    #[tokio::test]
    async fn test_denial_emits_event() {
        let sink = Arc::new(RecordingSink::new());
        let gate = gate_with_sink(sink.clone());
        let rule = RateRule::new("login", policy("1/minute"));
        let req = TestRequest::post().ip("192.0.2.7");

        assert!(gate.check_rate(&req, &rule).await.is_ok());
        let err = gate.check_rate(&req, &rule).await.unwrap_err();
        assert!(matches!(err, GateError::RateLimited { limit: 1, window_secs: 60, .. }));

        let events = sink.named("rate_limit_exceeded");
        assert_eq!(events.len(), 1);
        match &events[0] {
            GateEvent::RateLimitExceeded { key, policy, .. } => {
                assert_eq!(key, "ip:192.0.2.7");
                assert_eq!(policy, "1/minute");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_denial_carries_rule_error_message() {
        let gate = gate_with_sink(Arc::new(RecordingSink::new()));
        let rule = RateRule::new("export", policy("1/hour"))
            .with_error_message("Exports are limited to one per hour.");
        let plain = RateRule::new("search", policy("1/hour"));
        let req = TestRequest::get().ip("10.0.0.3");

        gate.check_rate(&req, &rule).await.unwrap();
        match gate.check_rate(&req, &rule).await {
            Err(GateError::RateLimited { message, .. }) => {
                assert_eq!(message.as_deref(), Some("Exports are limited to one per hour."));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        gate.check_rate(&req, &plain).await.unwrap();
        assert!(matches!(
            gate.check_rate(&req, &plain).await,
            Err(GateError::RateLimited { message: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_buckets_are_per_operation() {
        let gate = gate_with_sink(Arc::new(RecordingSink::new()));
        let req = TestRequest::get().ip("10.0.0.9");
        let search = RateRule::new("search", policy("1/hour"));
        let export = RateRule::new("export", policy("1/hour"));

        assert!(gate.check_rate(&req, &search).await.is_ok());
        assert!(gate.check_rate(&req, &export).await.is_ok());
        assert!(gate.check_rate(&req, &search).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_fail_denial_path() {
        let gate = gate_with_sink(Arc::new(FailingSink));
        let rule = RateRule::new("op", policy("1/second"));
        let req = TestRequest::get();
        gate.check_rate(&req, &rule).await.unwrap();
        assert!(matches!(
            gate.check_rate(&req, &rule).await,
            Err(GateError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_rule_from_config() {
        let mut config = GateConfig::default();
        let gate = Gate::from_config(&config, Arc::new(InMemoryStore::new())).unwrap();
        assert!(gate.default_rule("any").is_none());
        assert_eq!(
            gate.check_rate_or_default(&TestRequest::get(), "any", None)
                .await
                .unwrap(),
            None
        );

        config.rate_limit.default = Some(policy("200/minute"));
        let gate = Gate::from_config(&config, Arc::new(InMemoryStore::new())).unwrap();
        let rule = gate.default_rule("any").unwrap();
        assert_eq!(rule.policy.limit(), 200);

        // A per-operation rule wins over the default.
        let strict = RateRule::new("any", policy("1/minute"));
        let req = TestRequest::get();
        gate.check_rate_or_default(&req, "any", Some(&strict)).await.unwrap();
        assert!(gate
            .check_rate_or_default(&req, "any", Some(&strict))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_conflict_reports_client_key_and_emits_event() {
        let sink = Arc::new(RecordingSink::new());
        let gate = gate_with_sink(sink.clone());
        let rule = IdempotencyRule::new("orders.create").with_scope(Scope::Global);
        let req = TestRequest::post().idempotency_key("dup-1");

        let scoped = KeyBuilder::new(tollgate_core::constants::DEFAULT_IDEMPOTENCY_KEY_PREFIX)
            .unwrap()
            .build("orders.create", Scope::Global, None, "dup-1");
        gate.store()
            .create_if_absent(&scoped.lock_key(), b"held", Duration::from_secs(30))
            .await
            .unwrap();

        let err = gate
            .idempotent(&req, &rule, || async { Ok::<_, String>(1u8) })
            .await
            .unwrap_err();
        match err {
            RunError::Gate(GateError::Conflict { key }) => assert_eq!(key, "dup-1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sink.named("idempotency_conflict").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_at_build() {
        let mut config = GateConfig::default();
        config.idempotency.methods.clear();
        assert!(Gate::builder().config(config).build().is_err());
    }
}
