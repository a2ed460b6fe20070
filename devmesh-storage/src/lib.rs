pub mod compression;
pub mod crypto;
pub mod index;
pub mod kv;
pub mod vector;

pub use kv::{InMemoryKVStore, KVStore, KvError, RedisKVStore, ScanPage, SharedKVStore};
pub use vector::{InProcessVectorIndex, VectorIndex, VectorIndexError};
