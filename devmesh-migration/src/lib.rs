//! Dual-read/dual-write facade that lets a deployment migrate from a legacy,
//! non-tenant-scoped cache onto the tenant-aware one without a hard cutover.
//!
//! Reads check the new cache first; on a miss, they fall back to the legacy
//! cache and — if found there — kick off a best-effort background backfill
//! into the new cache so the next read is served from it directly. Writes
//! go to both caches so neither falls behind while the migration is in
//! flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devmesh_cache::{MatchKind, TenantAwareCache, TenantCacheError};
use devmesh_core::model::{CacheEntry, CachedSearchResult, TenantId};
use thiserror::Error;
use tracing::{error, info, warn};

const BACKFILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LegacyCacheError {
    #[error("legacy cache backend error: {0}")]
    Backend(String),
}

/// Narrow abstraction over whatever single-tenant cache predates this
/// workspace's multi-tenant one. Implementations typically wrap the old
/// deployment's client library.
#[async_trait]
pub trait LegacyCache: Send + Sync {
    async fn get(&self, query: &str) -> Result<Option<CacheEntry>, LegacyCacheError>;
    async fn set(&self, query: &str, entry: CacheEntry) -> Result<(), LegacyCacheError>;
    async fn delete(&self, query: &str) -> Result<bool, LegacyCacheError>;
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("new cache error: {0}")]
    New(#[from] TenantCacheError),
    #[error("legacy cache error: {0}")]
    Legacy(#[from] LegacyCacheError),
}

#[derive(Debug, Default)]
pub struct MigrationStats {
    pub new_hits: AtomicU64,
    pub legacy_hits: AtomicU64,
    pub misses: AtomicU64,
    pub backfills_succeeded: AtomicU64,
    pub backfills_failed: AtomicU64,
}

impl MigrationStats {
    pub fn snapshot(&self) -> MigrationStatsSnapshot {
        MigrationStatsSnapshot {
            new_hits: self.new_hits.load(Ordering::Relaxed),
            legacy_hits: self.legacy_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backfills_succeeded: self.backfills_succeeded.load(Ordering::Relaxed),
            backfills_failed: self.backfills_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationStatsSnapshot {
    pub new_hits: u64,
    pub legacy_hits: u64,
    pub misses: u64,
    pub backfills_succeeded: u64,
    pub backfills_failed: u64,
}

pub enum MigrationSource {
    New(MatchKind),
    Legacy,
}

pub struct MigrationBridge {
    new_cache: Arc<TenantAwareCache>,
    legacy_cache: Arc<dyn LegacyCache>,
    stats: Arc<MigrationStats>,
    backfill_enabled: bool,
}

impl MigrationBridge {
    pub fn new(
        new_cache: Arc<TenantAwareCache>,
        legacy_cache: Arc<dyn LegacyCache>,
        backfill_enabled: bool,
    ) -> Self {
        Self {
            new_cache,
            legacy_cache,
            stats: Arc::new(MigrationStats::default()),
            backfill_enabled,
        }
    }

    pub fn stats(&self) -> MigrationStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn get(
        &self,
        tenant_id: TenantId,
        query: &str,
        embedding: &[f32],
    ) -> Result<Option<(CacheEntry, MigrationSource)>, MigrationError> {
        match self.new_cache.get(tenant_id, query, embedding).await {
            Ok(Some((entry, match_kind, _score))) => {
                self.stats.new_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some((entry, MigrationSource::New(match_kind))));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "new cache lookup failed during migration read, falling back to legacy");
            }
        }

        match self.legacy_cache.get(query).await? {
            Some(entry) => {
                self.stats.legacy_hits.fetch_add(1, Ordering::Relaxed);
                if self.backfill_enabled {
                    self.spawn_backfill(tenant_id, entry.clone());
                }
                Ok(Some((entry, MigrationSource::Legacy)))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn set(
        &self,
        tenant_id: TenantId,
        query: &str,
        embedding: Vec<f32>,
        results: Vec<CachedSearchResult>,
        ttl: Option<Duration>,
    ) -> Result<(), MigrationError> {
        let entry_for_legacy = CacheEntry::new(
            query.to_string(),
            devmesh_cache::normalize_query(query),
            embedding.clone(),
            results.clone(),
            chrono::Utc::now(),
            ttl.unwrap_or(Duration::from_secs(3600)),
        );

        // Always attempt both writes, even if the new cache fails, so the
        // legacy cache never falls behind during the migration window.
        let new_result = self.new_cache.set(tenant_id, query, embedding, results, ttl).await;
        let legacy_result = self.legacy_cache.set(query, entry_for_legacy).await;

        match (new_result, legacy_result) {
            (Err(new_err), Err(legacy_err)) => {
                warn!(error = %legacy_err, "dual-write to legacy cache also failed");
                Err(new_err.into())
            }
            (Err(new_err), Ok(())) => Err(new_err.into()),
            (Ok(()), Err(legacy_err)) => Err(legacy_err.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    pub async fn delete(&self, tenant_id: TenantId, query: &str) -> Result<bool, MigrationError> {
        let new_deleted = self.new_cache.delete(tenant_id, query).await?;
        let legacy_deleted = self.legacy_cache.delete(query).await.unwrap_or_else(|err| {
            warn!(error = %err, "dual-delete from legacy cache failed");
            false
        });
        Ok(new_deleted || legacy_deleted)
    }

    fn spawn_backfill(&self, tenant_id: TenantId, entry: CacheEntry) {
        let new_cache = self.new_cache.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                BACKFILL_TIMEOUT,
                new_cache.set(
                    tenant_id,
                    &entry.query,
                    entry.embedding.clone(),
                    entry.results.clone(),
                    Some(entry.ttl),
                ),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    stats.backfills_succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(tenant = %tenant_id, "backfilled legacy entry into tenant-aware cache");
                }
                Ok(Err(err)) => {
                    stats.backfills_failed.fetch_add(1, Ordering::Relaxed);
                    error!(tenant = %tenant_id, error = %err, "backfill write failed");
                }
                Err(_) => {
                    stats.backfills_failed.fetch_add(1, Ordering::Relaxed);
                    error!(tenant = %tenant_id, "backfill write timed out");
                }
            }
        });
    }
}
