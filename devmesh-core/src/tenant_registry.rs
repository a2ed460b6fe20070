//! Tracks every tenant id the cache has seen a read or write for. The
//! eviction sweep's own recency index only learns about tenants through
//! `Get`-driven access batches, so a tenant that only ever calls `Set` would
//! otherwise never be discovered by the periodic sweep; this registry is the
//! shared source both sides record into and read from.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::model::TenantId;

#[derive(Default)]
pub struct TenantRegistry {
    seen: RwLock<HashSet<TenantId>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tenant_id: TenantId) {
        self.seen
            .write()
            .expect("tenant registry lock poisoned")
            .insert(tenant_id);
    }

    pub fn all(&self) -> Vec<TenantId> {
        self.seen
            .read()
            .expect("tenant registry lock poisoned")
            .iter()
            .copied()
            .collect()
    }
}
