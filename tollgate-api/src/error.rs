//! HTTP mapping for gate outcomes.
//!
//! Denials become `429 Too Many Requests` with a `Retry-After` header,
//! in-flight duplicates become `409 Conflict`. Everything else the gate can
//! report is a setup problem and surfaces as a `500` with the detail logged.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tollgate_guard::GateError;

// ============================================================================
// ERROR BODY
// ============================================================================

/// Error codes for gate responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TooManyRequests,
    IdempotencyConflict,
    InvalidIdempotencyKey,
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::IdempotencyConflict => StatusCode::CONFLICT,
            ErrorCode::InvalidIdempotencyKey => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body of every gate rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// REJECTIONS
// ============================================================================

/// Why the middleware refused to pass a request on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
        window_secs: u64,
        message: Option<String>,
    },

    #[error("Idempotency key '{0}' is already in progress")]
    Conflict(String),

    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<GateError> for GateRejection {
    fn from(err: GateError) -> Self {
        match err {
            GateError::RateLimited {
                retry_after_secs,
                limit,
                window_secs,
                message,
            } => GateRejection::RateLimited {
                retry_after_secs,
                limit,
                window_secs,
                message,
            },
            GateError::Conflict { key } => GateRejection::Conflict(key),
            GateError::Config(e) => GateRejection::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        match self {
            GateRejection::RateLimited {
                retry_after_secs,
                limit,
                window_secs,
                message,
            } => {
                let message = message.unwrap_or_else(|| {
                    format!("Rate limit exceeded. Retry after {} seconds", retry_after_secs)
                });
                let error = ApiError::new(ErrorCode::TooManyRequests, message)
                .with_details(serde_json::json!({
                    "retry_after_secs": retry_after_secs,
                    "limit": limit,
                    "window_secs": window_secs,
                }));

                let mut response = error.into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from_str(&retry_after_secs.to_string())
                        .unwrap_or_else(|_| HeaderValue::from_static("60")),
                );
                response
            }
            GateRejection::Conflict(key) => ApiError::new(
                ErrorCode::IdempotencyConflict,
                format!(
                    "A request with idempotency key '{}' is already in progress",
                    key
                ),
            )
            .into_response(),
            GateRejection::InvalidKey(msg) => {
                ApiError::new(ErrorCode::InvalidIdempotencyKey, msg).into_response()
            }
            GateRejection::Internal(msg) => {
                tracing::error!(error = %msg, "Gate middleware internal error");
                ApiError::new(ErrorCode::InternalError, "Internal server error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::ConfigError;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_maps_to_429_with_retry_after() {
        let rejection = GateRejection::from(GateError::RateLimited {
            retry_after_secs: 17,
            limit: 5,
            window_secs: 60,
            message: None,
        });
        let response = rejection.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "17");

        let body = body_json(response).await;
        assert_eq!(body["code"], "TOO_MANY_REQUESTS");
        assert_eq!(body["message"], "Rate limit exceeded. Retry after 17 seconds");
        assert_eq!(body["details"]["limit"], 5);
    }

    #[tokio::test]
    async fn test_conflict_maps_to_409() {
        let response = GateRejection::from(GateError::Conflict {
            key: "dup".to_string(),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["code"], "IDEMPOTENCY_CONFLICT");
        assert!(body["message"].as_str().unwrap().contains("dup"));
    }

    #[tokio::test]
    async fn test_config_error_is_hidden_behind_500() {
        let err = GateError::Config(ConfigError::MissingRequired {
            field: "store.url".to_string(),
        });
        let response = GateRejection::from(err).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Internal server error");
    }
}
