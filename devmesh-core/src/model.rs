use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// A 128-bit tenant identifier. The nil UUID is never a valid tenant and is
/// rejected by every cache operation that accepts one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Option<Self> {
        if id.is_nil() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s)?;
        Ok(Self(id))
    }
}

/// A single result attached to a cached query, as returned by the upstream
/// search/completion path before caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSearchResult {
    pub id: String,
    pub content: String,
    pub content_type: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CachedSearchResult {
    pub fn new(id: impl Into<String>, content: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            content_type: "text/plain".to_string(),
            score,
            metadata: HashMap::new(),
        }
    }
}

/// The unit stored under one cache key: query, embedding, results, and
/// bookkeeping. `normalized_query` must never be empty for a stored entry —
/// the empty canonical form is the cache's "do not store" sentinel and is
/// filtered out before an entry ever reaches this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub query: String,
    pub normalized_query: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub results: Vec<CachedSearchResult>,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub hit_count: u64,
    pub ttl: Duration,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CacheEntry {
    pub fn new(
        query: String,
        normalized_query: String,
        embedding: Vec<f32>,
        results: Vec<CachedSearchResult>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "result_count".to_string(),
            serde_json::Value::from(results.len()),
        );
        Self {
            query,
            normalized_query,
            embedding,
            results,
            cached_at: now,
            last_accessed_at: now,
            hit_count: 0,
            ttl,
            metadata,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now >= self.cached_at + ttl,
            Err(_) => false,
        }
    }

    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
        self.hit_count = self.hit_count.saturating_add(1);
    }
}

/// The vector-side twin of a `CacheEntry`, unique per (tenant, cache key) and
/// destroyed no later than the entry it shadows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub tenant_id: TenantId,
    pub cache_key: String,
    pub query_hash: String,
    pub embedding: Vec<f32>,
    pub last_accessed_at: DateTime<Utc>,
}

/// A single observed access to a cache key, fed to the `AccessTracker`.
/// Transient: it lives only in the tracker's bounded queue and aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub tenant_id: TenantId,
    pub cache_key: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-tenant rollup maintained by the eviction manager and exposed for
/// introspection. `last_eviction` is monotone non-decreasing per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TenantStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub hit_rate: f64,
    pub last_eviction: Option<DateTime<Utc>>,
}

impl Default for TenantStats {
    fn default() -> Self {
        Self {
            entry_count: 0,
            total_bytes: 0,
            hit_rate: 0.0,
            last_eviction: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_uuid_is_rejected() {
        assert!(TenantId::new(Uuid::nil()).is_none());
    }

    #[test]
    fn non_nil_uuid_is_accepted() {
        let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        assert!(TenantId::new(id).is_some());
    }

    #[test]
    fn entry_records_result_count_in_metadata() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "q".into(),
            "q".into(),
            vec![],
            vec![CachedSearchResult::new("r1", "hi", 1.0)],
            now,
            Duration::from_secs(60),
        );
        assert_eq!(
            entry.metadata.get("result_count"),
            Some(&serde_json::Value::from(1))
        );
    }

    #[test]
    fn ttl_boundary_is_inclusive_at_expiry() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "q".into(),
            "q".into(),
            vec![],
            vec![],
            now,
            Duration::from_secs(60),
        );
        assert!(!entry.is_expired(now + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(60)));
    }
}
