//! Key/value store client layer.
//!
//! This module provides:
//! - The `KeyValueStore` contract used by the cache layer and the queues
//! - A Redis-backed implementation with typed, traced operations
//! - An in-memory implementation satisfying the same contract for tests
//! - Operation counters exported for observability

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

/// KV errors.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("kv operation timed out: {0}")]
    Timeout(String),

    #[error("kv operation failed: {0}")]
    OperationFailed(String),
}

/// Result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Snapshot of client-side operation counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KvStats {
    pub ops_total: u64,
    pub errors_total: u64,
}

/// Point and list operations over the external KV store.
///
/// TTLs are honored by every implementation; list operations provide the
/// FIFO primitives the write-behind queues are built on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Point get. `None` for missing or expired keys.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Point set with optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Delete keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> KvResult<u64>;

    /// Key existence check.
    async fn exists(&self, key: &str) -> KvResult<bool>;

    /// Remaining TTL, if the key exists and has one.
    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>>;

    /// Increment a counter, starting a `window`-long expiry on first use.
    /// Returns the post-increment value.
    async fn incr_window(&self, key: &str, window: Duration) -> KvResult<i64>;

    /// Push to the head of a list; returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> KvResult<u64>;

    /// Blocking pop from the tail of a list, bounded by `timeout`.
    async fn brpop(&self, key: &str, timeout: Duration) -> KvResult<Option<String>>;

    /// List length.
    async fn llen(&self, key: &str) -> KvResult<u64>;

    /// List slice (inclusive indexes, negative allowed as in Redis).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>>;

    /// Trim a list to the inclusive index range.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()>;

    /// Pattern scan. Admin/debug only; never on the hot path.
    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>>;

    /// Client-side operation counters.
    fn stats(&self) -> KvStats;
}
