use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TenantId;

/// Per-tenant override of the cache's global defaults. Any field left at its
/// `Default` value falls back to the value baked into `CacheConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: TenantId,
    pub semantic_cache_enabled: bool,
    pub similarity_threshold: f32,
    pub ttl: Duration,
    pub max_entries: u64,
    pub max_bytes: u64,
    pub encryption_enabled: bool,
    pub rate_limit_per_minute: Option<u32>,
}

impl TenantConfig {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            semantic_cache_enabled: true,
            similarity_threshold: 0.95,
            ttl: Duration::from_secs(86_400),
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            encryption_enabled: false,
            rate_limit_per_minute: None,
        }
    }

    pub fn validate(&self) -> Result<(), TenantConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(TenantConfigError::InvalidSimilarityThreshold {
                tenant: self.tenant_id,
                threshold: self.similarity_threshold,
            });
        }
        if self.max_entries == 0 {
            return Err(TenantConfigError::ZeroBudget {
                tenant: self.tenant_id,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TenantConfigError {
    #[error("similarity threshold {threshold} for tenant {tenant} must be in [0.0, 1.0]")]
    InvalidSimilarityThreshold { tenant: TenantId, threshold: f32 },
    #[error("tenant {tenant} has a zero entry budget")]
    ZeroBudget { tenant: TenantId },
    #[error("tenant config store lock poisoned")]
    StorePoisoned,
}

/// Source of truth for per-tenant configuration, consulted on the hot path
/// of every cache operation. Implementations are expected to cache entries
/// locally for a short TTL rather than round-tripping to a backing store on
/// every call.
pub trait TenantConfigRepository: Send + Sync {
    fn get(&self, tenant_id: TenantId) -> Result<Option<TenantConfig>, TenantConfigError>;
    fn upsert(&self, config: TenantConfig) -> Result<(), TenantConfigError>;
}

struct CachedEntry {
    config: TenantConfig,
    fetched_at: DateTime<Utc>,
}

/// In-memory repository with a 5-minute freshness window, used in tests and
/// as the default until a real backing store (database, config service) is
/// wired in.
pub struct InMemoryTenantConfigRepository {
    entries: RwLock<HashMap<TenantId, CachedEntry>>,
    ttl: chrono::Duration,
    clock: Box<dyn crate::clock::Clock>,
}

impl InMemoryTenantConfigRepository {
    pub fn new(clock: Box<dyn crate::clock::Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::minutes(5),
            clock,
        }
    }

    fn is_fresh(&self, entry: &CachedEntry) -> bool {
        self.clock.now() - entry.fetched_at < self.ttl
    }
}

impl TenantConfigRepository for InMemoryTenantConfigRepository {
    fn get(&self, tenant_id: TenantId) -> Result<Option<TenantConfig>, TenantConfigError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| TenantConfigError::StorePoisoned)?;
        match entries.get(&tenant_id) {
            Some(entry) if self.is_fresh(entry) => Ok(Some(entry.config.clone())),
            _ => Ok(None),
        }
    }

    fn upsert(&self, config: TenantConfig) -> Result<(), TenantConfigError> {
        config.validate()?;
        let mut entries = self
            .entries
            .write()
            .map_err(|_| TenantConfigError::StorePoisoned)?;
        entries.insert(
            config.tenant_id,
            CachedEntry {
                config,
                fetched_at: self.clock.now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId::new(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()).unwrap()
    }

    #[test]
    fn rejects_out_of_range_similarity_threshold() {
        let mut cfg = TenantConfig::new(tenant());
        cfg.similarity_threshold = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(TenantConfigError::InvalidSimilarityThreshold { .. })
        ));
    }

    #[test]
    fn entry_expires_after_ttl_elapses() {
        let now = Utc::now();
        let repo = InMemoryTenantConfigRepository::new(Box::new(FixedClock::new(now)));
        repo.upsert(TenantConfig::new(tenant())).unwrap();
        assert!(repo.get(tenant()).unwrap().is_some());

        // Rebuild with a clock far in the future over the same entries; the
        // stored fetched_at is untouched so the freshness check now fails.
        let later = InMemoryTenantConfigRepository {
            entries: repo.entries,
            ttl: repo.ttl,
            clock: Box::new(FixedClock::new(now + chrono::Duration::minutes(6))),
        };
        assert!(later.get(tenant()).unwrap().is_none());
    }
}
