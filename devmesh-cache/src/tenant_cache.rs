//! Tenant-policy-aware facade over [`CacheCore`]: enforces the feature
//! flag and rate limit, applies per-tenant field-level encryption, and
//! reports every access to the injected [`AccessSink`] so eviction has the
//! recency data it needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devmesh_core::clock::Clock;
use devmesh_core::error::CacheError;
use devmesh_core::model::{CacheEntry, CachedSearchResult, TenantId};
use devmesh_core::tenant_config::{TenantConfig, TenantConfigRepository};
use devmesh_storage::crypto::{self, TenantKeyDeriver};
use serde_json::Value;
use tracing::instrument;

use crate::cache_core::{CacheCore, CoreError, MatchKind};
use crate::validate::{RateLimiter, Validator};

const ENCRYPTED_DATA_KEY: &str = "encrypted_data";
const DECRYPTED_DATA_KEY: &str = "decrypted_data";

#[derive(Debug, thiserror::Error)]
pub enum TenantCacheError {
    #[error(transparent)]
    Validation(#[from] CacheError),
    #[error("cache engine error: {0}")]
    Core(#[from] CoreError),
    #[error("tenant configuration error: {0}")]
    Config(#[from] devmesh_core::tenant_config::TenantConfigError),
    #[error("field decryption failed")]
    Decryption,
}

/// Receives one event per cache access; the sole consumer in this workspace
/// is `AccessTracker`'s bounded channel sender, but the trait keeps
/// `TenantAwareCache` from depending on tokio's mpsc type directly.
#[async_trait]
pub trait AccessSink: Send + Sync {
    async fn record(&self, tenant_id: TenantId, cache_key: String);
}

/// No-op sink for tests and deployments that run without eviction tracking.
pub struct NoOpAccessSink;

#[async_trait]
impl AccessSink for NoOpAccessSink {
    async fn record(&self, _tenant_id: TenantId, _cache_key: String) {}
}

pub struct TenantAwareCache {
    core: CacheCore,
    tenant_config: Arc<dyn TenantConfigRepository>,
    validator: Validator,
    rate_limiter: Arc<dyn RateLimiter>,
    key_deriver: Option<Arc<TenantKeyDeriver>>,
    access_sink: Arc<dyn AccessSink>,
    clock: Arc<dyn Clock>,
    max_candidates: usize,
}

impl TenantAwareCache {
    pub fn new(
        core: CacheCore,
        tenant_config: Arc<dyn TenantConfigRepository>,
        validator: Validator,
        rate_limiter: Arc<dyn RateLimiter>,
        key_deriver: Option<Arc<TenantKeyDeriver>>,
        access_sink: Arc<dyn AccessSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_max_candidates(
            core,
            tenant_config,
            validator,
            rate_limiter,
            key_deriver,
            access_sink,
            clock,
            10,
        )
    }

    /// As [`Self::new`], but with the similarity-search fan-out
    /// (`similarity.max_candidates` in `CacheConfig`) set explicitly rather
    /// than defaulting to 10.
    #[allow(clippy::too_many_arguments)]
    pub fn with_max_candidates(
        core: CacheCore,
        tenant_config: Arc<dyn TenantConfigRepository>,
        validator: Validator,
        rate_limiter: Arc<dyn RateLimiter>,
        key_deriver: Option<Arc<TenantKeyDeriver>>,
        access_sink: Arc<dyn AccessSink>,
        clock: Arc<dyn Clock>,
        max_candidates: usize,
    ) -> Self {
        Self {
            core,
            tenant_config,
            validator,
            rate_limiter,
            key_deriver,
            access_sink,
            clock,
            max_candidates,
        }
    }

    fn tenant_config_or_default(&self, tenant_id: TenantId) -> Result<TenantConfig, TenantCacheError> {
        Ok(self
            .tenant_config
            .get(tenant_id)?
            .unwrap_or_else(|| TenantConfig::new(tenant_id)))
    }

    #[instrument(skip(self, embedding), fields(tenant = %tenant_id))]
    pub async fn get(
        &self,
        tenant_id: TenantId,
        query: &str,
        embedding: &[f32],
    ) -> Result<Option<(CacheEntry, MatchKind, f32)>, TenantCacheError> {
        let config = self.tenant_config_or_default(tenant_id)?;
        if !config.semantic_cache_enabled {
            return Err(CacheError::FeatureDisabled.into());
        }
        self.rate_limiter
            .check(tenant_id)
            .await
            .map_err(TenantCacheError::Validation)?;
        self.validator.validate_query(query)?;
        let sanitized = self.validator.sanitize_query(query);

        let Some(hit) = self
            .core
            .get(
                tenant_id,
                &sanitized,
                embedding,
                config.similarity_threshold,
                self.max_candidates,
            )
            .await
        else {
            return Ok(None);
        };

        let mut entry = hit.entry;
        if config.encryption_enabled {
            self.decrypt_sensitive_fields(tenant_id, &mut entry)?;
        }

        self.access_sink
            .record(tenant_id, entry.normalized_query.clone())
            .await;

        Ok(Some((entry, hit.match_kind, hit.score)))
    }

    #[instrument(skip(self, embedding, results), fields(tenant = %tenant_id))]
    pub async fn set(
        &self,
        tenant_id: TenantId,
        query: &str,
        embedding: Vec<f32>,
        mut results: Vec<CachedSearchResult>,
        ttl_override: Option<Duration>,
    ) -> Result<(), TenantCacheError> {
        let config = self.tenant_config_or_default(tenant_id)?;
        if !config.semantic_cache_enabled {
            return Err(CacheError::FeatureDisabled.into());
        }
        self.rate_limiter
            .check(tenant_id)
            .await
            .map_err(TenantCacheError::Validation)?;
        self.validator.validate_query(query)?;
        let sanitized = self.validator.sanitize_query(query);

        let mut extra_metadata = HashMap::new();
        if config.encryption_enabled {
            if let Some(encoded) = self.encrypt_sensitive_fields(tenant_id, &mut results)? {
                extra_metadata.insert(ENCRYPTED_DATA_KEY.to_string(), Value::String(encoded));
            }
        }

        let ttl = ttl_override.unwrap_or(config.ttl);
        self.core
            .set(tenant_id, &sanitized, embedding, results, ttl, extra_metadata)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, tenant_id: TenantId, query: &str) -> Result<bool, TenantCacheError> {
        Ok(self.core.delete(tenant_id, query).await?)
    }

    pub async fn clear_tenant(&self, tenant_id: TenantId) -> Result<u64, TenantCacheError> {
        Ok(self.core.clear_tenant(tenant_id).await?)
    }

    /// Structurally extracts any metadata key matching a sensitive pattern
    /// (see [`devmesh_storage::crypto::is_sensitive_key`]) out of `results`,
    /// encrypts the bundle under the tenant's derived key, and returns the
    /// base64-framed ciphertext to be stored under `encrypted_data`. Returns
    /// `Ok(None)` when nothing in `results` was sensitive, so a plain write
    /// never pays for a no-op encrypt.
    fn encrypt_sensitive_fields(
        &self,
        tenant_id: TenantId,
        results: &mut [CachedSearchResult],
    ) -> Result<Option<String>, TenantCacheError> {
        let Some(sidecar) = crypto::extract_sensitive_fields(results) else {
            return Ok(None);
        };
        let Some(deriver) = &self.key_deriver else {
            // Encryption is enabled for the tenant but no key material is
            // configured: fail the write rather than storing sensitive
            // fields in the clear.
            return Err(TenantCacheError::Decryption);
        };
        let cipher = deriver.derive(tenant_id).map_err(|_| TenantCacheError::Decryption)?;
        let encoded = cipher
            .encrypt_sidecar(&sidecar, tenant_id)
            .map_err(|_| TenantCacheError::Decryption)?;
        Ok(Some(encoded))
    }

    /// Inverse of [`Self::encrypt_sensitive_fields`]. A present
    /// `encrypted_data` field that fails to decrypt is fatal to the read:
    /// the entry is never exposed half-decrypted.
    fn decrypt_sensitive_fields(
        &self,
        tenant_id: TenantId,
        entry: &mut CacheEntry,
    ) -> Result<(), TenantCacheError> {
        let Some(Value::String(encoded)) = entry.metadata.get(ENCRYPTED_DATA_KEY).cloned() else {
            return Ok(());
        };
        let deriver = self.key_deriver.as_ref().ok_or(TenantCacheError::Decryption)?;
        let cipher = deriver.derive(tenant_id).map_err(|_| TenantCacheError::Decryption)?;
        let sidecar = cipher
            .decrypt_sidecar(&encoded, tenant_id)
            .map_err(|_| TenantCacheError::Decryption)?;
        entry
            .metadata
            .insert(DECRYPTED_DATA_KEY.to_string(), Value::Object(sidecar));
        Ok(())
    }
}
