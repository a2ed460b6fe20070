use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration surface for a cache deployment. Loaded by
/// [`CacheConfig::load`] from a layered `config` stack:
/// `config/default.toml` overridden by `config/{RUN_MODE}.toml` (RUN_MODE
/// defaults to `development`) overridden by `DEVMESH_*` environment
/// variables (double-underscore separated, e.g. `DEVMESH_EVICTION__LRU_BATCH_SIZE`).
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub eviction: EvictionConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub defaults: TenantDefaults,
    /// Process-wide entry budget across every tenant, checked asynchronously
    /// on each `Set`. `0` disables the check.
    #[serde(default)]
    pub max_cache_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "devmesh".to_string(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub threshold: f32,
    pub max_candidates: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            max_candidates: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub interval_secs: u64,
    pub lru_batch_size: usize,
    pub max_entries_per_tenant: u64,
    pub max_bytes_per_tenant: u64,
}

impl EvictionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            lru_batch_size: 100,
            max_entries_per_tenant: 100_000,
            max_bytes_per_tenant: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub buffer_size: usize,
    pub flush_interval_secs: u64,
}

impl TrackingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            flush_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub min_size_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 1024,
        }
    }
}

/// Global encryption switch; per-tenant `encryption_enabled` still governs
/// whether a given tenant's writes actually get a sidecar encrypted, but an
/// operator can use this to disable the feature fleet-wide regardless of
/// tenant configuration. Which metadata keys count as sensitive is decided
/// structurally (see `devmesh_storage::crypto::is_sensitive_key`), not by
/// configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TenantDefaults {
    pub default_ttl_secs: u64,
    pub max_entries: u64,
    pub max_bytes: u64,
}

impl TenantDefaults {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for TenantDefaults {
    fn default() -> Self {
        Self {
            default_ttl_secs: 86_400,
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            similarity: SimilarityConfig::default(),
            eviction: EvictionConfig::default(),
            tracking: TrackingConfig::default(),
            compression: CompressionConfig::default(),
            encryption: EncryptionConfig::default(),
            defaults: TenantDefaults::default(),
            max_cache_size: 0,
        }
    }
}

impl CacheConfig {
    /// Loads configuration the way the rest of the fleet does: a base
    /// `config/default.toml`, an environment-specific overlay named by
    /// `RUN_MODE` (falling back to `development`), then `DEVMESH_`-prefixed
    /// environment variables taking final precedence.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(config::Environment::with_prefix("DEVMESH").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.redis.key_prefix, "devmesh");
        assert!(cfg.similarity.threshold > 0.0 && cfg.similarity.threshold <= 1.0);
        assert_eq!(cfg.tracking.buffer_size, 1000);
        assert_eq!(cfg.max_cache_size, 0, "overflow check disabled by default");
    }

    #[test]
    fn load_without_config_files_falls_back_to_defaults() {
        // No config/default.toml present in the test working directory, and
        // no DEVMESH_* vars set: every field should equal CacheConfig::default.
        let cfg = CacheConfig::load().expect("layered config should still build from env alone");
        assert_eq!(cfg.redis.pool_size, CacheConfig::default().redis.pool_size);
    }
}
