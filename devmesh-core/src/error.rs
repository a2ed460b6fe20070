use serde::{Deserialize, Serialize};

/// Boundary error taxonomy surfaced to callers of the cache. Every externally
/// visible failure collapses to one of these kinds; internal collaborator
/// errors (KVStore, VectorIndex, ...) are logged and mapped into one of them,
/// never propagated as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoTenantId,
    FeatureDisabled,
    RateLimitExceeded,
    EmptyQuery,
    QueryTooLong,
    InvalidCharacters,
    DecryptionFailed,
    IndexUnavailable,
    StoreUnavailable,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::NoTenantId => "NO_TENANT_ID",
            ErrorCode::FeatureDisabled => "FEATURE_DISABLED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::EmptyQuery => "EMPTY_QUERY",
            ErrorCode::QueryTooLong => "QUERY_TOO_LONG",
            ErrorCode::InvalidCharacters => "INVALID_CHARACTERS",
            ErrorCode::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorCode::IndexUnavailable => "INDEX_UNAVAILABLE",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
        };
        write!(f, "{}", s)
    }
}

/// Implemented by every crate-local error enum so boundary code can classify
/// a failure without downcasting to a concrete type.
pub trait DevmeshError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("no tenant id present in request context")]
    NoTenantId,
    #[error("semantic_cache feature is disabled for this tenant")]
    FeatureDisabled,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("query exceeds maximum length of {max} characters")]
    QueryTooLong { max: usize },
    #[error("query contains characters outside the allowed class")]
    InvalidCharacters,
    #[error("failed to decrypt sensitive metadata")]
    DecryptionFailed,
    #[error("vector index unavailable")]
    IndexUnavailable,
    #[error("key/value store unavailable")]
    StoreUnavailable,
}

impl DevmeshError for CacheError {
    fn error_code(&self) -> ErrorCode {
        match self {
            CacheError::NoTenantId => ErrorCode::NoTenantId,
            CacheError::FeatureDisabled => ErrorCode::FeatureDisabled,
            CacheError::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            CacheError::EmptyQuery => ErrorCode::EmptyQuery,
            CacheError::QueryTooLong { .. } => ErrorCode::QueryTooLong,
            CacheError::InvalidCharacters => ErrorCode::InvalidCharacters,
            CacheError::DecryptionFailed => ErrorCode::DecryptionFailed,
            CacheError::IndexUnavailable => ErrorCode::IndexUnavailable,
            CacheError::StoreUnavailable => ErrorCode::StoreUnavailable,
        }
    }
}
