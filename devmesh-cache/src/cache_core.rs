//! Tenant-scoped storage engine: exact-match lookup with a similarity
//! fallback, backed by a [`KVStore`] for entry bodies and a [`VectorIndex`]
//! for the approximate path. Holds no tenant policy of its own — callers
//! pass in the similarity threshold and TTL for each request, which is what
//! lets [`crate::tenant_cache::TenantAwareCache`] source those from
//! per-tenant configuration without this layer knowing about it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devmesh_core::clock::Clock;
use devmesh_core::metrics::Metrics;
use devmesh_core::model::{CacheEntry, CachedSearchResult, TenantId};
use devmesh_core::tenant_registry::TenantRegistry;
use devmesh_storage::compression;
use devmesh_storage::kv::SharedKVStore;
use devmesh_storage::vector::VectorIndex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::key::KeyBuilder;
use crate::normalize::normalize_query;

/// Callback the overflow check in `set()` invokes once the process-wide
/// cache size passes `max_cache_size`. `devmesh-jobs`'s `EvictionManager` is
/// the only implementor in this workspace; kept as a trait so
/// `devmesh-cache` never needs a dependency on `devmesh-jobs`.
#[async_trait]
pub trait EvictionTrigger: Send + Sync {
    async fn trigger(&self, tenant_id: TenantId);
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("key/value store error: {0}")]
    Store(#[from] devmesh_storage::kv::KvError),
    #[error("vector index error: {0}")]
    Index(#[from] devmesh_storage::vector::VectorIndexError),
    #[error("stored entry failed to deserialize: {0}")]
    Corrupt(String),
}

impl devmesh_core::error::DevmeshError for CoreError {
    fn error_code(&self) -> devmesh_core::error::ErrorCode {
        match self {
            CoreError::Store(_) => devmesh_core::error::ErrorCode::StoreUnavailable,
            CoreError::Index(_) => devmesh_core::error::ErrorCode::IndexUnavailable,
            CoreError::Corrupt(_) => devmesh_core::error::ErrorCode::StoreUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Similarity,
}

pub struct CacheHit {
    pub entry: CacheEntry,
    pub match_kind: MatchKind,
    pub score: f32,
}

pub struct CacheCore {
    kv: SharedKVStore,
    vector_index: Arc<dyn VectorIndex>,
    key_builder: KeyBuilder,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
    compression_min_size: usize,
    tenant_registry: Arc<TenantRegistry>,
    max_cache_size: u64,
    eviction_trigger: Option<Arc<dyn EvictionTrigger>>,
}

impl CacheCore {
    pub fn new(
        kv: SharedKVStore,
        vector_index: Arc<dyn VectorIndex>,
        key_builder: KeyBuilder,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn Metrics>,
        compression_min_size: usize,
    ) -> Self {
        Self {
            kv,
            vector_index,
            key_builder,
            clock,
            metrics,
            compression_min_size,
            tenant_registry: Arc::new(TenantRegistry::new()),
            max_cache_size: 0,
            eviction_trigger: None,
        }
    }

    /// Shares a `TenantRegistry` with the `EvictionManager` that sweeps this
    /// cache's tenants, so tenants that only ever call `set` are still
    /// discovered by the periodic sweep.
    pub fn with_tenant_registry(mut self, tenant_registry: Arc<TenantRegistry>) -> Self {
        self.tenant_registry = tenant_registry;
        self
    }

    /// Enables the `set()`-path overflow check against `max_cache_size`
    /// (§6's config surface; `0` disables it, which is also `new`'s default).
    /// On overflow, `trigger` is invoked for the tenant that just wrote.
    pub fn with_overflow_check(
        mut self,
        max_cache_size: u64,
        trigger: Arc<dyn EvictionTrigger>,
    ) -> Self {
        self.max_cache_size = max_cache_size;
        self.eviction_trigger = Some(trigger);
        self
    }

    /// Read path. Per the spec's error-handling design, infrastructure
    /// failures on this path are never propagated to the caller: a
    /// `KVStore`/`VectorIndex` error degrades to a miss (logged, counted)
    /// rather than surfacing as `Err`. Only this method's internal helpers
    /// may return `CoreError`; callers of `get` always get a clean
    /// `Option<CacheHit>`.
    #[instrument(skip(self, embedding), fields(tenant = %tenant_id))]
    pub async fn get(
        &self,
        tenant_id: TenantId,
        query: &str,
        embedding: &[f32],
        similarity_threshold: f32,
        max_candidates: usize,
    ) -> Option<CacheHit> {
        self.tenant_registry.record(tenant_id);
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            self.metrics
                .incr_counter("devmesh_cache.miss", &[("outcome", "empty_normalized")], 1);
            return None;
        }

        match self.try_exact_match(tenant_id, &normalized).await {
            Ok(Some(hit)) => return Some(hit),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, tenant = %tenant_id, "exact-match lookup failed, degrading to miss");
                self.metrics
                    .incr_counter("devmesh_cache.error", &[("stage", "exact")], 1);
            }
        }

        if embedding.is_empty() {
            self.metrics
                .incr_counter("devmesh_cache.miss", &[("outcome", "no_embedding")], 1);
            return None;
        }

        match self
            .try_similarity_match(tenant_id, embedding, similarity_threshold, max_candidates)
            .await
        {
            Ok(Some(hit)) => return Some(hit),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, tenant = %tenant_id, "similarity lookup failed, degrading to miss");
                self.metrics
                    .incr_counter("devmesh_cache.error", &[("stage", "similarity")], 1);
            }
        }

        self.metrics
            .incr_counter("devmesh_cache.miss", &[("outcome", "no_match")], 1);
        None
    }

    async fn try_exact_match(
        &self,
        tenant_id: TenantId,
        normalized: &str,
    ) -> Result<Option<CacheHit>, CoreError> {
        let exact_key = self.key_builder.query_key(tenant_id, normalized);
        let Some(raw) = self.kv.get(&exact_key).await? else {
            return Ok(None);
        };
        let mut entry = match self.decode_entry(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, key = %exact_key, "dropping corrupt cache entry");
                self.kv.delete(std::slice::from_ref(&exact_key)).await?;
                return Ok(None);
            }
        };

        let now = self.clock.now();
        if entry.is_expired(now) {
            self.kv.delete(std::slice::from_ref(&exact_key)).await?;
            self.best_effort_index_delete(tenant_id, normalized).await;
            return Ok(None);
        }

        entry.record_access(now);
        self.metrics
            .incr_counter("devmesh_cache.hit", &[("outcome", "exact")], 1);
        self.persist_entry(tenant_id, normalized, &entry, entry.ttl)
            .await?;
        Ok(Some(CacheHit {
            entry,
            match_kind: MatchKind::Exact,
            score: 1.0,
        }))
    }

    async fn try_similarity_match(
        &self,
        tenant_id: TenantId,
        embedding: &[f32],
        similarity_threshold: f32,
        max_candidates: usize,
    ) -> Result<Option<CacheHit>, CoreError> {
        let candidates = self
            .vector_index
            .search(tenant_id, embedding, max_candidates)
            .await?;

        for (candidate_key, score) in candidates {
            if score < similarity_threshold {
                break;
            }
            let full_key = self.key_builder.query_key(tenant_id, &candidate_key);
            let Some(raw) = self.kv.get(&full_key).await? else {
                // Vector side is ahead of the KV side; self-heal by dropping
                // the dangling vector record.
                self.best_effort_index_delete(tenant_id, &candidate_key).await;
                continue;
            };
            let mut entry = match self.decode_entry(&raw) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, key = %full_key, "dropping corrupt cache entry");
                    self.kv.delete(std::slice::from_ref(&full_key)).await?;
                    continue;
                }
            };
            let now = self.clock.now();
            if entry.is_expired(now) {
                self.kv.delete(std::slice::from_ref(&full_key)).await?;
                self.best_effort_index_delete(tenant_id, &candidate_key).await;
                continue;
            }
            entry.record_access(now);
            self.metrics
                .incr_counter("devmesh_cache.hit", &[("outcome", "similarity")], 1);
            self.persist_entry(tenant_id, &candidate_key, &entry, entry.ttl)
                .await?;
            if let Err(err) = self
                .vector_index
                .update_access_stats(tenant_id, &candidate_key)
                .await
            {
                warn!(error = %err, tenant = %tenant_id, "vector index access-stats update failed");
            }
            return Ok(Some(CacheHit {
                entry,
                match_kind: MatchKind::Similarity,
                score,
            }));
        }

        Ok(None)
    }

    async fn best_effort_index_delete(&self, tenant_id: TenantId, cache_key: &str) {
        if let Err(err) = self.vector_index.delete(tenant_id, cache_key).await {
            warn!(error = %err, tenant = %tenant_id, "vector index delete failed, will retry on next pass");
        }
    }

    #[instrument(skip(self, embedding, results, extra_metadata), fields(tenant = %tenant_id))]
    pub async fn set(
        &self,
        tenant_id: TenantId,
        query: &str,
        embedding: Vec<f32>,
        results: Vec<CachedSearchResult>,
        ttl: Duration,
        extra_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Option<String>, CoreError> {
        self.tenant_registry.record(tenant_id);
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            debug!("skipping store for query that normalizes to empty string");
            return Ok(None);
        }

        let now = self.clock.now();
        let mut entry = CacheEntry::new(
            query.to_string(),
            normalized.clone(),
            embedding.clone(),
            results,
            now,
            ttl,
        );
        entry.metadata.extend(extra_metadata);

        self.persist_entry(tenant_id, &normalized, &entry, ttl).await?;
        // Vector-index failure is logged, not propagated: the write already
        // landed in the KV store, so exact-match reads still work and the
        // next `set` of the same query will retry the upsert.
        if !embedding.is_empty() {
            if let Err(err) = self
                .vector_index
                .upsert(tenant_id, &normalized, embedding)
                .await
            {
                warn!(error = %err, tenant = %tenant_id, "vector index upsert failed, exact-match path unaffected");
                self.metrics
                    .incr_counter("devmesh_cache.error", &[("stage", "upsert")], 1);
            }
        }
        self.metrics
            .incr_counter("devmesh_cache.set", &[("tenant", &tenant_id.to_string())], 1);

        if self.max_cache_size > 0 {
            self.schedule_overflow_check(tenant_id);
        }
        Ok(Some(normalized))
    }

    /// Asynchronous, best-effort global-size check: counts every key under
    /// this cache's prefix (not just this tenant's) and, if it exceeds
    /// `max_cache_size`, hands the tenant that just wrote off to the
    /// eviction trigger. Runs off the hot path entirely — `set()` has
    /// already returned by the time this completes.
    fn schedule_overflow_check(&self, tenant_id: TenantId) {
        let Some(trigger) = self.eviction_trigger.clone() else {
            return;
        };
        let kv = self.kv.clone();
        let pattern = self.key_builder.global_pattern();
        let max = self.max_cache_size;
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match kv.scan_all(&pattern, 200).await {
                Ok(keys) if keys.len() as u64 > max => {
                    metrics.incr_counter("devmesh_cache.global_size.overflow", &[], 1);
                    trigger.trigger(tenant_id).await;
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "global cache size check failed"),
            }
        });
    }

    pub async fn delete(&self, tenant_id: TenantId, query: &str) -> Result<bool, CoreError> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Ok(false);
        }
        let key = self.key_builder.query_key(tenant_id, &normalized);
        let existed = self.kv.get(&key).await?.is_some();
        self.kv.delete(std::slice::from_ref(&key)).await?;
        self.best_effort_index_delete(tenant_id, &normalized).await;
        Ok(existed)
    }

    /// Clears every entry for `tenant_id`: pages through the tenant's keys
    /// in batches of 100, deleting up to 1000 per round trip, per §4.9.
    pub async fn clear_tenant(&self, tenant_id: TenantId) -> Result<u64, CoreError> {
        let pattern = self.key_builder.tenant_pattern(tenant_id);
        let mut cursor = "0".to_string();
        let mut removed = 0u64;
        loop {
            let page = self.kv.scan(&cursor, &pattern, 100).await?;
            for chunk in page.keys.chunks(1000) {
                self.kv.delete(chunk).await?;
            }
            removed += page.keys.len() as u64;
            if page.cursor == "0" {
                break;
            }
            cursor = page.cursor;
        }
        self.vector_index.clear_tenant(tenant_id).await?;
        Ok(removed)
    }

    async fn persist_entry(
        &self,
        tenant_id: TenantId,
        cache_key: &str,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<(), CoreError> {
        let serialized =
            serde_json::to_vec(entry).map_err(|e| CoreError::Corrupt(e.to_string()))?;
        let framed = compression::compress_if_worthwhile(&serialized, self.compression_min_size)
            .unwrap_or_else(|err| {
                warn!(error = %err, "compression failed, storing entry uncompressed");
                serialized
            });
        let key = self.key_builder.query_key(tenant_id, cache_key);
        self.kv.set(&key, framed, ttl).await?;
        Ok(())
    }

    fn decode_entry(&self, raw: &[u8]) -> Result<CacheEntry, CoreError> {
        let decompressed =
            compression::decompress(raw).map_err(|e| CoreError::Corrupt(e.to_string()))?;
        serde_json::from_slice(&decompressed).map_err(|e| CoreError::Corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmesh_core::clock::FixedClock;
    use devmesh_core::metrics::InMemoryMetrics;
    use devmesh_storage::kv::InMemoryKVStore;
    use devmesh_storage::vector::InProcessVectorIndex;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId::new(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()).unwrap()
    }

    fn core(clock: Arc<dyn Clock>) -> CacheCore {
        CacheCore::new(
            Arc::new(InMemoryKVStore::new()),
            Arc::new(InProcessVectorIndex::new()),
            KeyBuilder::new("devmesh"),
            clock,
            Arc::new(InMemoryMetrics::new()),
            1024,
        )
    }

    #[tokio::test]
    async fn exact_match_returns_stored_results() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let cache = core(clock);
        let t = tenant();
        cache
            .set(
                t,
                "what is rust?",
                vec![1.0, 0.0],
                vec![CachedSearchResult::new("r1", "a systems language", 1.0)],
                Duration::from_secs(60),
                HashMap::new(),
            )
            .await
            .unwrap();

        let hit = cache
            .get(t, "What IS Rust?", &[], 0.9, 10)
            .await
            .expect("exact hit expected");
        assert_eq!(hit.match_kind, MatchKind::Exact);
        assert_eq!(hit.entry.results[0].content, "a systems language");
    }

    #[tokio::test]
    async fn similarity_fallback_finds_close_embedding() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let cache = core(clock);
        let t = tenant();
        cache
            .set(
                t,
                "rust ownership rules",
                vec![1.0, 0.0, 0.0],
                vec![CachedSearchResult::new("r1", "ownership explainer", 1.0)],
                Duration::from_secs(60),
                HashMap::new(),
            )
            .await
            .unwrap();

        let hit = cache
            .get(t, "a totally different phrasing", &[0.99, 0.01, 0.0], 0.9, 10)
            .await
            .expect("similarity hit expected");
        assert_eq!(hit.match_kind, MatchKind::Similarity);
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_a_miss_and_evicted() {
        let now = chrono::Utc::now();
        let clock = Arc::new(FixedClock::new(now));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let cache = core(dyn_clock);
        let t = tenant();
        cache
            .set(t, "short lived", vec![], vec![], Duration::from_secs(1), HashMap::new())
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(2));
        assert!(cache.get(t, "short lived", &[], 0.9, 10).await.is_none());
    }

    #[tokio::test]
    async fn delete_removes_entry_from_both_stores() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let cache = core(clock);
        let t = tenant();
        cache
            .set(t, "to be deleted", vec![1.0], vec![], Duration::from_secs(60), HashMap::new())
            .await
            .unwrap();

        assert!(cache.delete(t, "to be deleted").await.unwrap());
        assert!(cache.get(t, "to be deleted", &[], 0.9, 10).await.is_none());
    }

    #[tokio::test]
    async fn clear_tenant_removes_all_entries_for_that_tenant() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let cache = core(clock);
        let t = tenant();
        cache.set(t, "q1", vec![], vec![], Duration::from_secs(60), HashMap::new()).await.unwrap();
        cache.set(t, "q2", vec![], vec![], Duration::from_secs(60), HashMap::new()).await.unwrap();

        let removed = cache.clear_tenant(t).await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get(t, "q1", &[], 0.9, 10).await.is_none());
    }

    #[tokio::test]
    async fn empty_query_never_stores_or_hits() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let cache = core(clock);
        let t = tenant();
        let stored = cache
            .set(t, "   ", vec![], vec![], Duration::from_secs(60), HashMap::new())
            .await
            .unwrap();
        assert!(stored.is_none());
        assert!(cache.get(t, "   ", &[], 0.9, 10).await.is_none());
    }

    #[tokio::test]
    async fn infrastructure_error_on_read_degrades_to_miss_not_error() {
        // A corrupt stored entry (bad JSON after "decompression") must read
        // as a miss, not propagate a decode failure to the caller.
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let kv = Arc::new(InMemoryKVStore::new());
        let builder = KeyBuilder::new("devmesh");
        let t = tenant();
        let key = builder.query_key(t, "garbage");
        kv.set(&key, b"not valid json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let cache = CacheCore::new(
            kv,
            Arc::new(InProcessVectorIndex::new()),
            builder,
            clock,
            Arc::new(InMemoryMetrics::new()),
            1024,
        );
        assert!(cache.get(t, "garbage", &[], 0.9, 10).await.is_none());
    }

    #[tokio::test]
    async fn set_and_get_register_the_tenant_for_eviction_discovery() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let registry = Arc::new(TenantRegistry::new());
        let cache = core(clock).with_tenant_registry(registry.clone());
        let t = tenant();

        cache
            .set(t, "q", vec![], vec![], Duration::from_secs(60), HashMap::new())
            .await
            .unwrap();
        assert_eq!(registry.all(), vec![t]);
    }

    #[tokio::test]
    async fn set_triggers_eviction_when_global_size_exceeds_max_cache_size() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct RecordingTrigger(Arc<AtomicBool>);

        #[async_trait::async_trait]
        impl EvictionTrigger for RecordingTrigger {
            async fn trigger(&self, _tenant_id: TenantId) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let triggered = Arc::new(AtomicBool::new(false));
        let cache = core(clock).with_overflow_check(1, Arc::new(RecordingTrigger(triggered.clone())));
        let t = tenant();

        cache.set(t, "q1", vec![], vec![], Duration::from_secs(60), HashMap::new()).await.unwrap();
        cache.set(t, "q2", vec![], vec![], Duration::from_secs(60), HashMap::new()).await.unwrap();

        // The check runs on a spawned task; give the runtime a chance to
        // drive it to completion.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(triggered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn overflow_check_is_disabled_by_default() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let cache = core(clock);
        let t = tenant();
        // No trigger configured; max_cache_size stays at 0. Must not panic
        // or spawn a check.
        cache.set(t, "q1", vec![], vec![], Duration::from_secs(60), HashMap::new()).await.unwrap();
    }
}
