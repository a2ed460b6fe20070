use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use devmesh_core::model::{TenantId, VectorRecord};

/// Tenant-partitioned linear-scan ANN index, keyed by cache key rather than
/// a numeric id so the vector side and the KV side of an entry can be
/// addressed with the same handle. Acceptable for the candidate-set sizes a
/// per-tenant cache sees; a real HNSW/IVF index can implement [`VectorIndex`]
/// as a drop-in replacement.
#[derive(Default)]
pub struct LinearAnnIndex {
    records: RwLock<HashMap<TenantId, HashMap<String, VectorRecord>>>,
}

impl LinearAnnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: TenantId, cache_key: &str, embedding: Vec<f32>) {
        let mut guard = self.records.write().expect("ann index lock poisoned");
        guard.entry(tenant_id).or_default().insert(
            cache_key.to_string(),
            VectorRecord {
                tenant_id,
                cache_key: cache_key.to_string(),
                query_hash: cache_key.to_string(),
                embedding,
                last_accessed_at: Utc::now(),
            },
        );
    }

    pub fn delete(&self, tenant_id: TenantId, cache_key: &str) -> bool {
        let mut guard = self.records.write().expect("ann index lock poisoned");
        guard
            .get_mut(&tenant_id)
            .map(|tenant_map| tenant_map.remove(cache_key).is_some())
            .unwrap_or(false)
    }

    pub fn clear_tenant(&self, tenant_id: TenantId) {
        let mut guard = self.records.write().expect("ann index lock poisoned");
        guard.remove(&tenant_id);
    }

    /// Top-k nearest neighbors by cosine similarity, scoped to one tenant.
    /// Ties are broken by insertion/iteration order, which is unspecified —
    /// callers that need determinism should filter by a minimum threshold
    /// first.
    pub fn search(&self, tenant_id: TenantId, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let guard = self.records.read().expect("ann index lock poisoned");
        let Some(tenant_map) = guard.get(&tenant_id) else {
            return Vec::new();
        };

        let mut scores: Vec<(String, f32)> = tenant_map
            .iter()
            .filter_map(|(key, record)| {
                cosine_similarity(query, &record.embedding).map(|score| (key.clone(), score))
            })
            .collect();

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(k);
        scores
    }

    /// Refreshes `last_accessed_at` for a candidate that served a similarity
    /// hit; a no-op if the key isn't present (e.g. a race with a concurrent
    /// delete).
    pub fn touch(&self, tenant_id: TenantId, cache_key: &str) {
        let mut guard = self.records.write().expect("ann index lock poisoned");
        if let Some(record) = guard.get_mut(&tenant_id).and_then(|m| m.get_mut(cache_key)) {
            record.last_accessed_at = Utc::now();
        }
    }

    pub fn len(&self, tenant_id: TenantId) -> usize {
        let guard = self.records.read().expect("ann index lock poisoned");
        guard.get(&tenant_id).map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, tenant_id: TenantId) -> bool {
        self.len(tenant_id) == 0
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}
