pub mod cache_core;
pub mod key;
pub mod normalize;
pub mod tenant_cache;
pub mod validate;

pub use cache_core::{CacheCore, CacheHit, CoreError, EvictionTrigger, MatchKind};
pub use key::KeyBuilder;
pub use normalize::normalize_query;
pub use tenant_cache::{AccessSink, NoOpAccessSink, TenantAwareCache, TenantCacheError};
pub use validate::{NoOpRateLimiter, RateLimiter, Validator};
