//! Background per-tenant LRU eviction. Consumes recency batches from the
//! access tracker to keep an in-memory "last seen" index, and on a fixed
//! interval walks every known tenant, evicting the least-recently-used
//! entries once its entry count or byte budget is exceeded.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devmesh_cache::EvictionTrigger;
use devmesh_core::clock::Clock;
use devmesh_core::metrics::Metrics;
use devmesh_core::model::{TenantId, TenantStats};
use devmesh_core::tenant_config::TenantConfigRepository;
use devmesh_core::tenant_registry::TenantRegistry;
use devmesh_storage::kv::SharedKVStore;
use devmesh_storage::vector::VectorIndex;
use thiserror::Error;
use tracing::{info, warn};

use crate::access_tracker::RecencySink;

#[derive(Debug, Error)]
pub enum EvictionError {
    #[error("key/value store error: {0}")]
    Store(#[from] devmesh_storage::kv::KvError),
    #[error("vector index error: {0}")]
    Index(#[from] devmesh_storage::vector::VectorIndexError),
}

struct RecencyEntry {
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct RecencyIndex {
    by_tenant: HashMap<TenantId, HashMap<String, RecencyEntry>>,
}

/// Runs the periodic LRU sweep and doubles as the `RecencySink` the access
/// tracker flushes into.
pub struct EvictionManager {
    kv: SharedKVStore,
    vector_index: Arc<dyn VectorIndex>,
    key_prefix: String,
    tenant_config: Arc<dyn TenantConfigRepository>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
    batch_size: usize,
    recency: RwLock<RecencyIndex>,
    stats: RwLock<HashMap<TenantId, TenantStats>>,
    tenant_registry: Arc<TenantRegistry>,
}

impl EvictionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: SharedKVStore,
        vector_index: Arc<dyn VectorIndex>,
        key_prefix: impl Into<String>,
        tenant_config: Arc<dyn TenantConfigRepository>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn Metrics>,
        batch_size: usize,
        tenant_registry: Arc<TenantRegistry>,
    ) -> Self {
        Self {
            kv,
            vector_index,
            key_prefix: key_prefix.into(),
            tenant_config,
            clock,
            metrics,
            batch_size,
            recency: RwLock::new(RecencyIndex::default()),
            stats: RwLock::new(HashMap::new()),
            tenant_registry,
        }
    }

    pub fn stats_for(&self, tenant_id: TenantId) -> TenantStats {
        self.stats
            .read()
            .expect("eviction stats lock poisoned")
            .get(&tenant_id)
            .copied()
            .unwrap_or_default()
    }

    /// Spawns the periodic sweep loop; returns its join handle so callers
    /// can await or abort it during shutdown.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    /// Walks every tenant known either from recent `Get` traffic or from the
    /// shared tenant registry (populated by `CacheCore::set`), so a tenant
    /// that only ever writes is still found and swept.
    pub async fn sweep(&self) {
        let mut tenants: std::collections::HashSet<TenantId> = self
            .recency
            .read()
            .expect("eviction recency lock poisoned")
            .by_tenant
            .keys()
            .copied()
            .collect();
        tenants.extend(self.tenant_registry.all());

        for tenant_id in tenants {
            if let Err(err) = self.sweep_tenant(tenant_id).await {
                warn!(tenant = %tenant_id, error = %err, "eviction sweep failed for tenant");
            }
        }
    }

    /// Sweeps a single tenant. Exposed as `pub` so it can also be invoked
    /// on-demand as an [`EvictionTrigger`] from `CacheCore`'s global-size
    /// overflow check, outside the periodic schedule.
    pub async fn sweep_tenant(&self, tenant_id: TenantId) -> Result<(), EvictionError> {
        let config = self
            .tenant_config
            .get(tenant_id)
            .ok()
            .flatten();
        let (max_entries, max_bytes) = config
            .map(|c| (c.max_entries, c.max_bytes))
            .unwrap_or((10_000, 64 * 1024 * 1024));

        let pattern = format!("{}:{{{}}}:q:*", self.key_prefix, tenant_id.as_uuid());
        let keys = self.kv.scan_all(&pattern, 200).await?;
        // One round trip regardless of entry count (§4.10's byte-accounting
        // script), rather than a `memory_usage` call per key.
        let total_bytes = self.kv.total_memory_usage(&pattern).await?;

        self.update_stats(tenant_id, keys.len() as u64, total_bytes, None);

        let over_entries = keys.len() as u64 > max_entries;
        let over_bytes = total_bytes > max_bytes;
        if !over_entries && !over_bytes {
            return Ok(());
        }

        let ordered = self.recency_order(tenant_id, &keys);
        let mut to_evict: Vec<String> = Vec::new();
        let mut remaining_entries = keys.len() as u64;
        let mut remaining_bytes = total_bytes;

        for key in ordered {
            if remaining_entries <= max_entries && remaining_bytes <= max_bytes {
                break;
            }
            if to_evict.len() >= self.batch_size {
                break;
            }
            let size = self.kv.memory_usage(&key).await?.unwrap_or(0);
            remaining_entries = remaining_entries.saturating_sub(1);
            remaining_bytes = remaining_bytes.saturating_sub(size);
            to_evict.push(key);
        }

        if !to_evict.is_empty() {
            // Single pipelined batch per round, chunked to Redis's
            // recommended ceiling of 1000 keys per `DEL`.
            for chunk in to_evict.chunks(1000) {
                self.kv.delete(chunk).await?;
            }
            for key in &to_evict {
                if let Some(cache_key) = cache_key_suffix(key) {
                    self.vector_index.delete(tenant_id, cache_key).await?;
                }
            }

            let now = self.clock.now();
            self.update_stats(tenant_id, remaining_entries, remaining_bytes, Some(now));
            self.metrics.incr_counter(
                "devmesh_jobs.eviction.evicted_entries",
                &[],
                to_evict.len() as u64,
            );
            info!(tenant = %tenant_id, evicted = to_evict.len(), "evicted entries over budget");
        }

        Ok(())
    }

    fn recency_order(&self, tenant_id: TenantId, keys: &[String]) -> Vec<String> {
        let guard = self.recency.read().expect("eviction recency lock poisoned");
        let Some(tenant_recency) = guard.by_tenant.get(&tenant_id) else {
            return keys.to_vec();
        };

        let epoch = DateTime::<Utc>::from_timestamp(0, 0).expect("unix epoch is representable");
        let mut scored: Vec<(String, DateTime<Utc>)> = keys
            .iter()
            .map(|key| {
                let last_seen = cache_key_suffix(key)
                    .and_then(|suffix| tenant_recency.get(suffix))
                    .map(|entry| entry.last_seen)
                    .unwrap_or(epoch);
                (key.clone(), last_seen)
            })
            .collect();
        scored.sort_by_key(|(_, last_seen)| *last_seen);
        scored.into_iter().map(|(key, _)| key).collect()
    }

    fn update_stats(
        &self,
        tenant_id: TenantId,
        entry_count: u64,
        total_bytes: u64,
        last_eviction: Option<DateTime<Utc>>,
    ) {
        let mut stats = self.stats.write().expect("eviction stats lock poisoned");
        let entry = stats.entry(tenant_id).or_default();
        entry.entry_count = entry_count;
        entry.total_bytes = total_bytes;
        if let Some(when) = last_eviction {
            entry.last_eviction = Some(when);
        }
    }
}

fn cache_key_suffix(full_key: &str) -> Option<&str> {
    full_key.rsplit_once(":q:").map(|(_, suffix)| suffix)
}

#[async_trait]
impl EvictionTrigger for EvictionManager {
    async fn trigger(&self, tenant_id: TenantId) {
        if let Err(err) = self.sweep_tenant(tenant_id).await {
            warn!(tenant = %tenant_id, error = %err, "on-demand eviction trigger failed");
        }
    }
}

#[async_trait]
impl RecencySink for EvictionManager {
    async fn record_batch(&self, batch: Vec<(TenantId, String, u64, DateTime<Utc>)>) {
        let mut guard = self.recency.write().expect("eviction recency lock poisoned");
        for (tenant_id, cache_key, _count, last_seen) in batch {
            guard
                .by_tenant
                .entry(tenant_id)
                .or_default()
                .insert(cache_key, RecencyEntry { last_seen });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmesh_core::clock::FixedClock;
    use devmesh_core::metrics::InMemoryMetrics;
    use devmesh_core::tenant_config::{InMemoryTenantConfigRepository, TenantConfig};
    use devmesh_storage::kv::InMemoryKVStore;
    use devmesh_storage::vector::InProcessVectorIndex;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId::new(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()).unwrap()
    }

    async fn seed(kv: &InMemoryKVStore, tenant_id: TenantId, n: usize) {
        for i in 0..n {
            let key = format!("devmesh:{{{}}}:q:query-{i}", tenant_id.as_uuid());
            kv.set(&key, vec![0u8; 128], Duration::from_secs(3600)).await.unwrap();
        }
    }

    fn manager(kv: Arc<InMemoryKVStore>, max_entries: u64) -> (Arc<EvictionManager>, TenantId) {
        manager_with_registry(kv, max_entries, Arc::new(TenantRegistry::new()))
    }

    fn manager_with_registry(
        kv: Arc<InMemoryKVStore>,
        max_entries: u64,
        tenant_registry: Arc<TenantRegistry>,
    ) -> (Arc<EvictionManager>, TenantId) {
        let t = tenant();
        let now = Utc::now();
        let tenant_config = Arc::new(InMemoryTenantConfigRepository::new(Box::new(FixedClock::new(now))));
        let mut config = TenantConfig::new(t);
        config.max_entries = max_entries;
        config.max_bytes = u64::MAX;
        tenant_config.upsert(config).unwrap();

        let mgr = Arc::new(EvictionManager::new(
            kv,
            Arc::new(InProcessVectorIndex::new()),
            "devmesh",
            tenant_config,
            Arc::new(FixedClock::new(now)),
            Arc::new(InMemoryMetrics::new()),
            100,
            tenant_registry,
        ));
        (mgr, t)
    }

    #[tokio::test]
    async fn sweep_evicts_least_recently_used_first() {
        let kv = Arc::new(InMemoryKVStore::new());
        seed(&kv, tenant(), 5).await;
        let (mgr, t) = manager(kv.clone(), 3);

        // Mark query-2..4 as recently accessed, leaving 0 and 1 as LRU.
        let now = Utc::now();
        let batch: Vec<_> = (2..5)
            .map(|i| (t, format!("query-{i}"), 1u64, now))
            .collect();
        mgr.record_batch(batch).await;

        mgr.sweep().await;

        assert_eq!(kv.get(&format!("devmesh:{{{}}}:q:query-0", t.as_uuid())).await.unwrap(), None);
        assert_eq!(kv.get(&format!("devmesh:{{{}}}:q:query-1", t.as_uuid())).await.unwrap(), None);
        assert!(kv.get(&format!("devmesh:{{{}}}:q:query-4", t.as_uuid())).await.unwrap().is_some());

        let stats = mgr.stats_for(t);
        assert_eq!(stats.entry_count, 3);
        assert!(stats.last_eviction.is_some());
    }

    #[tokio::test]
    async fn sweep_is_a_no_op_under_budget() {
        let kv = Arc::new(InMemoryKVStore::new());
        seed(&kv, tenant(), 2).await;
        let (mgr, t) = manager(kv.clone(), 10);

        mgr.record_batch(vec![(t, "query-0".to_string(), 1, Utc::now())]).await;
        mgr.sweep().await;

        assert_eq!(mgr.stats_for(t).entry_count, 2);
    }

    #[tokio::test]
    async fn sweep_discovers_tenants_that_only_ever_set() {
        let kv = Arc::new(InMemoryKVStore::new());
        seed(&kv, tenant(), 5).await;
        let registry = Arc::new(TenantRegistry::new());
        registry.record(tenant());
        let (mgr, t) = manager_with_registry(kv.clone(), 3, registry);

        // No record_batch call at all: this tenant never appeared in a Get,
        // only in the shared registry, the way a Set-only tenant would.
        mgr.sweep().await;

        let stats = mgr.stats_for(t);
        assert_eq!(stats.entry_count, 3, "a set-only tenant must still be swept");
        assert!(stats.last_eviction.is_some());
    }

    #[tokio::test]
    async fn trigger_sweeps_the_requested_tenant_on_demand() {
        let kv = Arc::new(InMemoryKVStore::new());
        seed(&kv, tenant(), 5).await;
        let (mgr, t) = manager(kv.clone(), 2);

        mgr.trigger(t).await;

        assert_eq!(mgr.stats_for(t).entry_count, 2);
    }
}
