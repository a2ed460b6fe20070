//! Approximate nearest-neighbor search over cached query embeddings.

use std::sync::Arc;

use async_trait::async_trait;
use devmesh_core::model::TenantId;
use thiserror::Error;

use crate::index::LinearAnnIndex;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VectorIndexError {
    #[error("embedding dimensionality mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl devmesh_core::error::DevmeshError for VectorIndexError {
    fn error_code(&self) -> devmesh_core::error::ErrorCode {
        devmesh_core::error::ErrorCode::IndexUnavailable
    }
}

/// Collaborator seam for approximate nearest-neighbor search, async so a
/// remote or GPU-backed index can satisfy it without changing call sites.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        tenant_id: TenantId,
        cache_key: &str,
        embedding: Vec<f32>,
    ) -> Result<(), VectorIndexError>;

    async fn delete(&self, tenant_id: TenantId, cache_key: &str) -> Result<(), VectorIndexError>;

    async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), VectorIndexError>;

    /// Top-k candidates above no particular threshold; callers apply the
    /// similarity cutoff themselves.
    async fn search(
        &self,
        tenant_id: TenantId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, VectorIndexError>;

    async fn len(&self, tenant_id: TenantId) -> Result<usize, VectorIndexError>;

    /// Records that `cache_key` just served a hit, refreshing its recency
    /// bookkeeping independently of the KV-side entry's own `last_accessed_at`.
    async fn update_access_stats(
        &self,
        tenant_id: TenantId,
        cache_key: &str,
    ) -> Result<(), VectorIndexError>;
}

/// Default in-process implementation, backed by [`LinearAnnIndex`]. Suitable
/// for the entry counts a single tenant accumulates before eviction kicks
/// in; swap in an HNSW-backed `VectorIndex` for larger working sets.
pub struct InProcessVectorIndex {
    inner: Arc<LinearAnnIndex>,
}

impl InProcessVectorIndex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LinearAnnIndex::new()),
        }
    }
}

impl Default for InProcessVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InProcessVectorIndex {
    async fn upsert(
        &self,
        tenant_id: TenantId,
        cache_key: &str,
        embedding: Vec<f32>,
    ) -> Result<(), VectorIndexError> {
        self.inner.insert(tenant_id, cache_key, embedding);
        Ok(())
    }

    async fn delete(&self, tenant_id: TenantId, cache_key: &str) -> Result<(), VectorIndexError> {
        self.inner.delete(tenant_id, cache_key);
        Ok(())
    }

    async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), VectorIndexError> {
        self.inner.clear_tenant(tenant_id);
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: TenantId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, VectorIndexError> {
        Ok(self.inner.search(tenant_id, query, k))
    }

    async fn len(&self, tenant_id: TenantId) -> Result<usize, VectorIndexError> {
        Ok(self.inner.len(tenant_id))
    }

    async fn update_access_stats(
        &self,
        tenant_id: TenantId,
        cache_key: &str,
    ) -> Result<(), VectorIndexError> {
        self.inner.touch(tenant_id, cache_key);
        Ok(())
    }
}
