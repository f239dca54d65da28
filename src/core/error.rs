//! Error kinds shared across the file engine and its HTTP surface.
//!
//! Every failure a caller can observe is one of these discriminants; the
//! API layer maps them onto status codes and the `{error_code, message}`
//! response body. Internal details (SQL text, backend paths) never ride
//! along in the user-facing message.

use thiserror::Error;

/// Stable machine-readable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ModeDenied,
    InsufficientStorage,
    AttrTooLarge,
    NotFound,
    GoneArchived,
    ConflictWalInFlight,
    ChecksumMismatch,
    BackendUnavailable,
    RebuildInProgress,
    InvalidTransition,
    TokenInvalid,
    TokenExpired,
    Forbidden,
    RateLimited,
    Validation,
    Internal,
}

impl ErrorKind {
    /// Wire-format code, used as `error_code` in response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ModeDenied => "mode_denied",
            ErrorKind::InsufficientStorage => "insufficient_storage",
            ErrorKind::AttrTooLarge => "attr_too_large",
            ErrorKind::NotFound => "not_found",
            ErrorKind::GoneArchived => "gone_archived",
            ErrorKind::ConflictWalInFlight => "conflict_wal_in_flight",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::RebuildInProgress => "rebuild_in_progress",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::TokenInvalid => "token_invalid",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// File engine error.
///
/// Carries a kind (stable code) and a human-oriented message. Variants that
/// wrap infrastructure errors keep the source for logging but collapse to
/// `backend_unavailable` / `internal_error` at the boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("operation not permitted in mode {mode}: {operation}")]
    ModeDenied { mode: String, operation: String },

    #[error("insufficient storage: requested {requested} bytes, {free} free")]
    InsufficientStorage { requested: u64, free: u64 },

    #[error("attribute sidecar exceeds {limit} bytes (serialized {actual})")]
    AttrTooLarge { limit: usize, actual: usize },

    #[error("file exceeds the {limit} byte limit")]
    FileTooLarge { limit: u64 },

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file is archived; restore required")]
    GoneArchived { restore_hint: Option<String> },

    #[error("another operation is in flight for file {0}")]
    ConflictWalInFlight(String),

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("cache rebuild already in progress")]
    RebuildInProgress,

    #[error("invalid mode transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("token invalid: {0}")]
    TokenInvalid(String),

    #[error("token expired")]
    TokenExpired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited")]
    RateLimited,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("registry error: {0}")]
    Registry(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The stable kind for this error, used for HTTP mapping and metrics.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ModeDenied { .. } => ErrorKind::ModeDenied,
            EngineError::InsufficientStorage { .. } => ErrorKind::InsufficientStorage,
            EngineError::AttrTooLarge { .. } => ErrorKind::AttrTooLarge,
            EngineError::FileTooLarge { .. } => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::GoneArchived { .. } => ErrorKind::GoneArchived,
            EngineError::ConflictWalInFlight(_) => ErrorKind::ConflictWalInFlight,
            EngineError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            EngineError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            EngineError::RebuildInProgress => ErrorKind::RebuildInProgress,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::TokenInvalid(_) => ErrorKind::TokenInvalid,
            EngineError::TokenExpired => ErrorKind::TokenExpired,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::RateLimited => ErrorKind::RateLimited,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Database(_)
            | EngineError::Registry(_)
            | EngineError::Serialization(_)
            | EngineError::Io(_)
            | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error warrants an in-operation retry (transient I/O).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::BackendUnavailable(_) | EngineError::Io(_) | EngineError::Registry(_)
        )
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(ErrorKind::ModeDenied.code(), "mode_denied");
        assert_eq!(ErrorKind::AttrTooLarge.code(), "attr_too_large");
        assert_eq!(ErrorKind::ConflictWalInFlight.code(), "conflict_wal_in_flight");
        assert_eq!(ErrorKind::RebuildInProgress.code(), "rebuild_in_progress");
    }

    #[test]
    fn test_infrastructure_errors_collapse_to_internal() {
        let err = EngineError::Internal("boom".into());
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err: EngineError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::BackendUnavailable("s3 timeout".into()).is_transient());
        assert!(!EngineError::RateLimited.is_transient());
        assert!(!EngineError::NotFound("x".into()).is_transient());
    }
}
