//! Key/value storage abstraction over the byte strings the cache persists.
//!
//! [`KVStore`] is the narrow seam the rest of the crate depends on; the
//! production implementation talks to Redis, and [`InMemoryKVStore`] is a
//! dashmap-backed test double with identical TTL semantics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis connection error: {0}")]
    Connection(String),
    #[error("redis command failed: {0}")]
    Command(String),
}

impl devmesh_core::error::DevmeshError for KvError {
    fn error_code(&self) -> devmesh_core::error::ErrorCode {
        devmesh_core::error::ErrorCode::StoreUnavailable
    }
}

/// One page of a cursor-driven scan. A `cursor` of `"0"` means the scan is
/// complete; any other value is fed back into the next `scan` call to
/// continue where this page left off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: String,
    pub keys: Vec<String>,
}

/// Byte-oriented key/value store with TTLs and pattern scanning, the
/// primitives the cache core needs and nothing more.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;
    /// Batch delete; a no-op on an empty slice costs nothing.
    async fn delete(&self, keys: &[String]) -> Result<(), KvError>;
    /// One page of keys matching a Redis-style glob pattern
    /// (`tenant:{id}:*`), starting from `cursor` (`"0"` for a new scan).
    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, KvError>;
    /// Approximate serialized size of the value at `key`, in bytes.
    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, KvError>;
    /// Evaluates a Lua script with the given `KEYS`/`ARGV`, returning an
    /// integer result. Used by [`Self::total_memory_usage`]'s default
    /// implementation; a store with no server-side scripting engine (the
    /// in-memory test double) can return `KvError::Command` for direct
    /// callers, since it overrides `total_memory_usage` to skip `Eval`.
    async fn eval_int(&self, script: &str, keys: &[String], args: &[String]) -> Result<i64, KvError>;
    /// Sums `MEMORY USAGE` across every key matching `pattern` in one
    /// round trip, per §4.10's byte-accounting sketch: a naive
    /// scan-then-`memory_usage`-per-key loop costs O(n) round trips, which
    /// the Lua script collapses to one.
    async fn total_memory_usage(&self, pattern: &str) -> Result<u64, KvError> {
        let total = self
            .eval_int(BYTE_ACCOUNTING_SCRIPT, &[pattern.to_string()], &[])
            .await?;
        Ok(total.max(0) as u64)
    }
    /// Walks the scan cursor to collect every key matching `pattern`. Used by
    /// callers (`clear_tenant`, the eviction sweep) that need the full set
    /// rather than one page at a time.
    async fn scan_all(&self, pattern: &str, page_size: usize) -> Result<Vec<String>, KvError> {
        let mut cursor = "0".to_string();
        let mut out = Vec::new();
        loop {
            let page = self.scan(&cursor, pattern, page_size).await?;
            out.extend(page.keys);
            if page.cursor == "0" {
                break;
            }
            cursor = page.cursor;
        }
        Ok(out)
    }
}

/// Lua sketch from §4.10: walk the `SCAN` cursor for `KEYS[1]`, sum
/// `MEMORY USAGE` over every match, return the total. Keeps the per-tenant
/// overflow check to one round trip regardless of entry count.
const BYTE_ACCOUNTING_SCRIPT: &str = r#"
local cursor = "0"
local total = 0
repeat
    local result = redis.call("SCAN", cursor, "MATCH", KEYS[1], "COUNT", 200)
    cursor = result[1]
    for _, key in ipairs(result[2]) do
        local sz = redis.call("MEMORY", "USAGE", key)
        if sz then
            total = total + sz
        end
    end
until cursor == "0"
return total
"#;

/// Redis-backed implementation used in production. Reuses a single
/// connection manager across calls; redis-rs handles reconnection.
pub struct RedisKVStore {
    conn: Mutex<ConnectionManager>,
}

impl RedisKVStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl KVStore for RedisKVStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async(&mut *conn)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async(&mut *conn)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, KvError> {
        let mut conn = self.conn.lock().await;
        let cursor_num: u64 = cursor.parse().unwrap_or(0);
        let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor_num)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut *conn)
            .await
            .map_err(|e| KvError::Command(e.to_string()))?;
        Ok(ScanPage {
            cursor: next_cursor.to_string(),
            keys: batch,
        })
    }

    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, KvError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("MEMORY")
            .arg("USAGE")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn eval_int(&self, script: &str, keys: &[String], args: &[String]) -> Result<i64, KvError> {
        let mut conn = self.conn.lock().await;
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(keys.len() as i64);
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        cmd.query_async(&mut *conn)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: std::time::Instant,
}

/// In-memory test double backing the unit tests in this crate and in
/// `devmesh-cache`. Expired entries are lazily pruned on access.
#[derive(Default)]
pub struct InMemoryKVStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKVStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn glob_match(pattern: &str, key: &str) -> bool {
        // Minimal glob: '*' matches any run of characters, everything else
        // is literal. Sufficient for the tenant-prefixed patterns this
        // store sees (`devmesh:{tenant}:*`).
        fn matches<'a>(pattern: &'a [u8], text: &'a [u8]) -> bool {
            match (pattern.first(), text.first()) {
                (None, None) => true,
                (Some(b'*'), _) => {
                    (0..=text.len()).any(|i| matches(&pattern[1..], &text[i..]))
                }
                (Some(p), Some(t)) if p == t => matches(&pattern[1..], &text[1..]),
                _ => false,
            }
        }
        matches(pattern.as_bytes(), key.as_bytes())
    }
}

#[async_trait]
impl KVStore for InMemoryKVStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > std::time::Instant::now() => {
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<ScanPage, KvError> {
        let mut matched: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| Self::glob_match(pattern, key))
            .collect();
        // No native server-side cursor to delegate to; sort for a stable
        // pagination order across calls within one scan.
        matched.sort();

        let start: usize = cursor.parse().unwrap_or(0);
        let end = (start + count).min(matched.len());
        let page = matched.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = if end >= matched.len() {
            "0".to_string()
        } else {
            end.to_string()
        };
        Ok(ScanPage {
            cursor: next_cursor,
            keys: page,
        })
    }

    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, KvError> {
        Ok(self.entries.get(key).map(|entry| entry.value.len() as u64))
    }

    async fn eval_int(&self, _script: &str, _keys: &[String], _args: &[String]) -> Result<i64, KvError> {
        Err(KvError::Command("in-memory store has no Lua engine".into()))
    }

    /// No server round trips to economize on in-process; sum directly
    /// instead of going through `eval_int`.
    async fn total_memory_usage(&self, pattern: &str) -> Result<u64, KvError> {
        let mut total = 0u64;
        for key in self.scan_all(pattern, 200).await? {
            total += self.memory_usage(&key).await?.unwrap_or(0);
        }
        Ok(total)
    }
}

/// Shared handle, the form every collaborator actually stores.
pub type SharedKVStore = Arc<dyn KVStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryKVStore::new();
        store.set("k1", b"v1".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let store = InMemoryKVStore::new();
        store
            .set("k1", b"v1".to_vec(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_matches_glob_pattern() {
        let store = InMemoryKVStore::new();
        store.set("devmesh:{t1}:q:a", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("devmesh:{t1}:q:b", b"2".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("devmesh:{t2}:q:a", b"3".to_vec(), Duration::from_secs(60)).await.unwrap();

        let mut matched = store.scan_all("devmesh:{t1}:*", 100).await.unwrap();
        matched.sort();
        assert_eq!(matched, vec!["devmesh:{t1}:q:a", "devmesh:{t1}:q:b"]);
    }

    #[tokio::test]
    async fn scan_pages_through_a_cursor() {
        let store = InMemoryKVStore::new();
        for i in 0..5 {
            store
                .set(&format!("devmesh:{{t1}}:q:{i}"), b"v".to_vec(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let page1 = store.scan("0", "devmesh:{t1}:*", 2).await.unwrap();
        assert_eq!(page1.keys.len(), 2);
        assert_ne!(page1.cursor, "0");

        let page2 = store.scan(&page1.cursor, "devmesh:{t1}:*", 2).await.unwrap();
        assert_eq!(page2.keys.len(), 2);

        let page3 = store.scan(&page2.cursor, "devmesh:{t1}:*", 2).await.unwrap();
        assert_eq!(page3.keys.len(), 1);
        assert_eq!(page3.cursor, "0");
    }

    #[tokio::test]
    async fn total_memory_usage_sums_matching_keys() {
        let store = InMemoryKVStore::new();
        store.set("devmesh:{t1}:q:a", b"1234".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("devmesh:{t1}:q:b", b"12".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("devmesh:{t2}:q:a", b"999999".to_vec(), Duration::from_secs(60)).await.unwrap();

        let total = store.total_memory_usage("devmesh:{t1}:*").await.unwrap();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryKVStore::new();
        store.set("k1", b"v1".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.delete(&["k1".to_string()]).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_a_batch_of_keys() {
        let store = InMemoryKVStore::new();
        store.set("k1", b"v1".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("k2", b"v2".to_vec(), Duration::from_secs(60)).await.unwrap();
        store
            .delete(&["k1".to_string(), "k2".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get("k1").await.unwrap(), None);
        assert_eq!(store.get("k2").await.unwrap(), None);
    }
}
