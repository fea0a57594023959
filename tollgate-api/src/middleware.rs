//! Axum middleware over [`Gate`].
//!
//! # Usage
//!
//! ```ignore
//! use axum::{middleware, routing::post, Router};
//! use tollgate_api::middleware::{idempotency_middleware, rate_limit_middleware};
//! use tollgate_api::middleware::{IdempotencyState, RateLimitState};
//!
//! let limits = RateLimitState::new(gate.clone(), RateRule::new("orders.create", policy));
//! let idempotency = IdempotencyState::new(gate.clone(), "orders.create");
//!
//! let app = Router::new()
//!     .route("/orders", post(create_order))
//!     .layer(middleware::from_fn_with_state(idempotency, idempotency_middleware))
//!     .layer(middleware::from_fn_with_state(limits, rate_limit_middleware));
//! ```
//!
//! Rate limiting runs first (outermost layer), so a throttled duplicate
//! never touches the idempotency lock.

use crate::error::GateRejection;
use crate::request::HttpGateRequest;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tollgate_core::constants::IDEMPOTENCY_REPLAY_HEADER;
use tollgate_guard::{Gate, GateRequest, IdempotencyRule, RateRule, RunError};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Largest response body captured for replay (1MB).
pub const MAX_CACHED_BODY_SIZE: usize = 1024 * 1024;

/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Shared state for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    pub gate: Gate,
    pub rule: RateRule,
}

impl RateLimitState {
    pub fn new(gate: Gate, rule: RateRule) -> Self {
        Self { gate, rule }
    }

    /// State using the gate's configured default policy, if one is set.
    pub fn from_default(gate: Gate, operation: impl Into<String>) -> Option<Self> {
        let rule = gate.default_rule(operation)?;
        Some(Self { gate, rule })
    }
}

/// Rate limiting middleware.
///
/// Allowed responses carry `X-RateLimit-Limit` and `X-RateLimit-Remaining`.
/// Denials return 429 Too Many Requests with a `Retry-After` header.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, GateRejection> {
    let view = HttpGateRequest::from_request(&request);
    let decision = state.gate.check_rate(&view, &state.rule).await?;

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(RATE_LIMIT_LIMIT_HEADER),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER),
        HeaderValue::from(decision.remaining),
    );

    Ok(response)
}

// ============================================================================
// IDEMPOTENCY
// ============================================================================

/// Shared state for [`idempotency_middleware`].
#[derive(Clone)]
pub struct IdempotencyState {
    pub gate: Gate,
    pub rule: IdempotencyRule,
    pub max_body_size: usize,
}

impl IdempotencyState {
    /// State for `operation` using the gate's configured idempotency settings.
    pub fn new(gate: Gate, operation: impl Into<String>) -> Self {
        let rule = gate.idempotency_rule(operation);
        Self::with_rule(gate, rule)
    }

    pub fn with_rule(gate: Gate, rule: IdempotencyRule) -> Self {
        Self {
            gate,
            rule,
            max_body_size: MAX_CACHED_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

/// A successful response as stored for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Base64 of the raw body bytes
    pub body: String,
}

impl CachedResponse {
    /// Buffer a successful response for storage.
    ///
    /// Anything that should not be stored is handed back as `Err` so the
    /// gate treats it as a failed operation: non-2xx responses, and 2xx
    /// responses whose body exceeds `max_body_size`. The caller still gets
    /// the original response in both cases.
    async fn capture(response: Response, max_body_size: usize) -> Result<Self, Response> {
        if !response.status().is_success() {
            return Err(response);
        }

        let declared_len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(size) = declared_len.filter(|len| *len > max_body_size) {
            tracing::warn!(size, limit = max_body_size, "Response body too large to cache, not stored");
            return Err(response);
        }

        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
            GateRejection::Internal(format!("Failed to buffer response body: {}", e)).into_response()
        })?;

        if bytes.len() > max_body_size {
            tracing::warn!(
                size = bytes.len(),
                limit = max_body_size,
                "Response body too large to cache, not stored"
            );
            return Err(Response::from_parts(parts, Body::from(bytes)));
        }

        let headers = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            status: parts.status.as_u16(),
            headers,
            body: STANDARD.encode(&bytes),
        })
    }

    /// Rebuild the HTTP response, marking it as a replay of `replayed_key`
    /// when given.
    pub fn to_response(&self, replayed_key: Option<(&str, &str)>) -> Result<Response, GateRejection> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| GateRejection::Internal(format!("Invalid cached status: {}", e)))?;
        let body = STANDARD
            .decode(&self.body)
            .map_err(|e| GateRejection::Internal(format!("Invalid cached body: {}", e)))?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((header, key)) = replayed_key {
            builder = builder
                .header(IDEMPOTENCY_REPLAY_HEADER, "true")
                .header(header, key);
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GateRejection::Internal(format!("Failed to build response: {}", e)))
    }
}

/// Axum middleware for idempotency key handling.
///
/// Requests whose method the rule covers and that carry the idempotency
/// header are deduplicated:
///
/// - a stored 2xx response for the key is replayed with
///   `X-Idempotency-Replay: true`
/// - a duplicate arriving while the first is still running gets 409 Conflict
/// - otherwise the request runs and a 2xx response is stored
///
/// Non-2xx responses, and 2xx responses too large to store, are returned
/// as-is and never stored, so a retry with the same key runs again.
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    request: Request,
    next: Next,
) -> Result<Response, GateRejection> {
    let view = HttpGateRequest::from_request(&request);
    let key = view
        .header(&state.rule.header)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    if let Some(key) = &key {
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN && state.rule.applies_to(view.method()) {
            return Err(GateRejection::InvalidKey(format!(
                "Idempotency key must be 1-{} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }
    }

    let max_body_size = state.max_body_size;
    let outcome = state
        .gate
        .idempotent(&view, &state.rule, move || async move {
            let response = next.run(request).await;
            CachedResponse::capture(response, max_body_size).await
        })
        .await;

    match outcome {
        Ok(execution) if execution.replayed => {
            let key = key.unwrap_or_default();
            tracing::debug!(
                operation = %state.rule.operation,
                idempotency_key = %key,
                "Returning cached response for idempotency key"
            );
            execution
                .value
                .to_response(Some((state.rule.header.as_str(), key.as_str())))
        }
        Ok(execution) => execution.value.to_response(None),
        Err(RunError::Operation(response)) => Ok(response),
        Err(RunError::Gate(err)) => Err(err.into()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
