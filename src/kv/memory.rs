//! In-memory `KeyValueStore` for tests and local development.
//!
//! Honors the full contract, including TTLs and blocking pops. A failure
//! toggle lets tests exercise the cache layer's error semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KeyValueStore, KvError, KvResult, KvStats};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |t| t <= now)
    }
}

/// In-memory KV store. Lists are polled on a short interval to emulate
/// blocking pops.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    failing: AtomicBool,
    ops: AtomicU64,
    errors: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, for error-path tests.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> KvResult<()> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::SeqCst) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(KvError::OperationFailed("kv failure injected".to_string()));
        }
        Ok(())
    }

    fn pop_tail(&self, key: &str) -> Option<String> {
        let mut lists = self.lists.lock();
        lists.get_mut(key).and_then(|list| list.pop_back())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.check()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(now) {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.check()?;
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> KvResult<u64> {
        self.check()?;
        let mut entries = self.entries.lock();
        let mut lists = self.lists.lock();
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            let live = entries
                .remove(key)
                .map_or(false, |entry| !entry.is_expired(now));
            if live || lists.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        self.check()?;
        let entries = self.entries.lock();
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|t| t.saturating_duration_since(now)))
    }

    async fn incr_window(&self, key: &str, window: Duration) -> KvResult<i64> {
        self.check()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();

        let fresh = entries.get(key).map_or(true, |entry| entry.is_expired(now));
        if fresh {
            entries.insert(
                key.to_string(),
                Entry {
                    value: "1".to_string(),
                    expires_at: Some(now + window),
                },
            );
            return Ok(1);
        }

        let entry = entries
            .get_mut(key)
            .ok_or_else(|| KvError::OperationFailed("counter vanished".to_string()))?;
        let count = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = count.to_string();
        Ok(count)
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<u64> {
        self.check()?;
        let mut lists = self.lists.lock();
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> KvResult<Option<String>> {
        self.check()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.pop_tail(key) {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        self.check()?;
        let lists = self.lists.lock();
        Ok(lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        self.check()?;
        let lists = self.lists.lock();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let norm = |idx: i64| -> i64 {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx.min(len - 1)
            }
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, stop) = (norm(start), norm(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        let kept = self.lrange(key, start, stop).await?;
        let mut lists = self.lists.lock();
        lists.insert(key.to_string(), kept.into_iter().collect());
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.check()?;
        let entries = self.entries.lock();
        let now = Instant::now();
        let matches = |key: &str| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                key.starts_with(prefix)
            } else {
                key == pattern
            }
        };
        Ok(entries
            .iter()
            .filter(|(key, entry)| matches(key) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn stats(&self) -> KvStats {
        KvStats {
            ops_total: self.ops.load(Ordering::Relaxed),
            errors_total: self.errors.load(Ordering::Relaxed),
        }
    }
}
