//! Input validation for incoming cache requests: query shape and per-tenant
//! rate limiting, both enforced before a query ever reaches normalization.

use async_trait::async_trait;
use devmesh_core::error::CacheError;
use devmesh_core::model::TenantId;

#[derive(Debug, Clone)]
pub struct Validator {
    max_query_len: usize,
}

impl Validator {
    pub fn new(max_query_len: usize) -> Self {
        Self { max_query_len }
    }

    pub fn validate_query(&self, query: &str) -> Result<(), CacheError> {
        if query.trim().is_empty() {
            return Err(CacheError::EmptyQuery);
        }
        if query.chars().count() > self.max_query_len {
            return Err(CacheError::QueryTooLong {
                max: self.max_query_len,
            });
        }
        if query.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
            return Err(CacheError::InvalidCharacters);
        }
        Ok(())
    }

    /// Best-effort cleanup applied after validation passes: strips control
    /// characters and truncates to `max_query_len`, always on a code-point
    /// boundary. Unlike `validate_query`, this never rejects its input — it
    /// is the string that actually reaches normalization and storage.
    pub fn sanitize_query(&self, query: &str) -> String {
        query
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .take(self.max_query_len)
            .collect()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Per-tenant request throttling, enforced ahead of the hot path. The
/// default [`NoOpRateLimiter`] never throttles; deployments that need
/// enforcement provide their own implementation (token bucket, sliding
/// window, or a call-through to a shared limiter service).
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, tenant_id: TenantId) -> Result<(), CacheError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpRateLimiter;

#[async_trait]
impl RateLimiter for NoOpRateLimiter {
    async fn check(&self, _tenant_id: TenantId) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_query() {
        let validator = Validator::default();
        assert_eq!(validator.validate_query("   ").unwrap_err(), CacheError::EmptyQuery);
    }

    #[test]
    fn rejects_overlong_query() {
        let validator = Validator::new(5);
        let err = validator.validate_query("123456").unwrap_err();
        assert_eq!(err, CacheError::QueryTooLong { max: 5 });
    }

    #[test]
    fn rejects_control_characters() {
        let validator = Validator::default();
        let err = validator.validate_query("hello\u{0007}world").unwrap_err();
        assert_eq!(err, CacheError::InvalidCharacters);
    }

    #[test]
    fn accepts_well_formed_query() {
        let validator = Validator::default();
        assert!(validator.validate_query("what is rust?").is_ok());
    }

    #[test]
    fn sanitize_strips_control_characters() {
        let validator = Validator::default();
        assert_eq!(validator.sanitize_query("hello\u{0007}world"), "helloworld");
    }

    #[test]
    fn sanitize_truncates_on_a_code_point_boundary() {
        let validator = Validator::new(3);
        assert_eq!(validator.sanitize_query("héllo"), "hél");
    }

    #[tokio::test]
    async fn noop_rate_limiter_never_throttles() {
        use uuid::Uuid;
        let limiter = NoOpRateLimiter;
        let tenant = TenantId::new(Uuid::new_v4()).unwrap();
        assert!(limiter.check(tenant).await.is_ok());
    }
}
