//! Builds the Redis hash-tagged keys the cache reads and writes.
//!
//! All keys for a tenant share the `{tenant-uuid}` hash tag so every key
//! belonging to one tenant lands on the same cluster slot, which is what
//! makes tenant-scoped `SCAN`/pipeline eviction possible on a Redis Cluster
//! deployment.

use devmesh_core::model::TenantId;

#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `<prefix>:{<tenant-uuid>}:q:<normalized-query>`, with key-unsafe
    /// characters in the query replaced so the result is always a single
    /// well-formed Redis key.
    pub fn query_key(&self, tenant_id: TenantId, normalized_query: &str) -> String {
        format!(
            "{}:{{{}}}:q:{}",
            self.prefix,
            tenant_id.as_uuid(),
            Self::sanitize_for_key(normalized_query)
        )
    }

    /// Glob pattern matching every key under this prefix, across tenants.
    pub fn global_pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Replaces whitespace and the characters that are structurally
    /// meaningful in a hash-tagged key (`:`, `{`, `}`) so a normalized query
    /// can never split or extend the key it's embedded in.
    fn sanitize_for_key(normalized_query: &str) -> String {
        normalized_query
            .chars()
            .map(|c| match c {
                c if c.is_whitespace() => '-',
                ':' | '{' | '}' => '_',
                c => c,
            })
            .collect()
    }

    /// Glob pattern matching every query key belonging to one tenant.
    pub fn tenant_pattern(&self, tenant_id: TenantId) -> String {
        format!("{}:{{{}}}:q:*", self.prefix, tenant_id.as_uuid())
    }

    /// Key under which the tenant's aggregate stats are tracked.
    pub fn stats_key(&self, tenant_id: TenantId) -> String {
        format!("{}:{{{}}}:stats", self.prefix, tenant_id.as_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId::new(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()).unwrap()
    }

    #[test]
    fn query_key_has_hash_tag_and_prefix() {
        let builder = KeyBuilder::new("devmesh");
        let key = builder.query_key(tenant(), "what is rust");
        assert_eq!(
            key,
            "devmesh:{11111111-1111-1111-1111-111111111111}:q:what-is-rust"
        );
    }

    #[test]
    fn query_key_sanitizes_structural_characters() {
        let builder = KeyBuilder::new("devmesh");
        let key = builder.query_key(tenant(), "a:weird{query}");
        assert_eq!(
            key,
            "devmesh:{11111111-1111-1111-1111-111111111111}:q:a_weird_query_"
        );
    }

    #[test]
    fn global_pattern_covers_every_tenant() {
        let builder = KeyBuilder::new("devmesh");
        assert_eq!(builder.global_pattern(), "devmesh:*");
    }

    #[test]
    fn tenant_pattern_matches_query_key_shape() {
        let builder = KeyBuilder::new("devmesh");
        let pattern = builder.tenant_pattern(tenant());
        assert!(pattern.ends_with(":q:*"));
        assert!(pattern.contains(&tenant().to_string()));
    }

    #[test]
    fn different_tenants_produce_different_hash_tags() {
        let builder = KeyBuilder::new("devmesh");
        let other = TenantId::new(Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap())
            .unwrap();
        assert_ne!(
            builder.query_key(tenant(), "q"),
            builder.query_key(other, "q")
        );
    }
}
