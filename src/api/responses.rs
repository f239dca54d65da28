//! HTTP response envelope and error mapping.
//!
//! Error bodies are `{error_code, message, details?, correlation_id}`.
//! The mapping from engine error kinds to status codes lives here and
//! nowhere else; handlers convert with `?` and stay free of status-code
//! arithmetic. Backend internals never reach the body: infrastructure
//! failures collapse to a generic message while the detail goes to the
//! log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::core::error::{EngineError, ErrorKind};

/// Wire error body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// An API error carrying its status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, error_code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error_code: error_code.to_string(),
                message: message.into(),
                details: None,
                correlation_id: None,
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "token_invalid", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(StatusCode::LOCKED, "account_locked", message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.body.details = Some(details);
        self
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.body.correlation_id = Some(correlation_id.to_string());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let kind = err.kind();
        // The size ceiling is a validation failure semantically but a 413
        // on the wire.
        if matches!(err, EngineError::FileTooLarge { .. }) {
            return ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, kind.code(), err.to_string());
        }
        let status = match kind {
            ErrorKind::ModeDenied => StatusCode::FORBIDDEN,
            ErrorKind::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::AttrTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::GoneArchived => StatusCode::GONE,
            ErrorKind::ConflictWalInFlight => StatusCode::CONFLICT,
            ErrorKind::ChecksumMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RebuildInProgress => StatusCode::CONFLICT,
            ErrorKind::InvalidTransition => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::TokenInvalid | ErrorKind::TokenExpired => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Infrastructure details stay in the logs.
        let message = if kind == ErrorKind::Internal {
            error!(error = %err, "internal error surfaced to client");
            "internal error".to_string()
        } else {
            err.to_string()
        };

        ApiError::new(status, kind.code(), message)
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_status_mapping() {
        let cases: Vec<(EngineError, StatusCode)> = vec![
            (
                EngineError::ModeDenied {
                    mode: "ro".into(),
                    operation: "upload".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                EngineError::InsufficientStorage {
                    requested: 10,
                    free: 5,
                },
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                EngineError::AttrTooLarge {
                    limit: 4096,
                    actual: 5000,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                EngineError::ConflictWalInFlight("x".into()),
                StatusCode::CONFLICT,
            ),
            (EngineError::RebuildInProgress, StatusCode::CONFLICT),
            (EngineError::TokenExpired, StatusCode::UNAUTHORIZED),
            (EngineError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
        ];
        for (err, expected) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, expected);
        }
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = EngineError::Internal("connection string postgres://user:pw@host".into());
        let api: ApiError = err.into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.body.message, "internal error");
        assert!(!api.body.message.contains("postgres://"));
    }

    #[test]
    fn test_error_body_shape() {
        let api = ApiError::validation("bad input")
            .with_details(serde_json::json!({"field": "declared_size"}))
            .with_correlation("req-123");
        let v = serde_json::to_value(&api.body).unwrap();
        assert_eq!(v["error_code"], "validation_error");
        assert_eq!(v["details"]["field"], "declared_size");
        assert_eq!(v["correlation_id"], "req-123");
    }
}
