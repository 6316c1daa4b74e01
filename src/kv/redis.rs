//! Redis-backed `KeyValueStore` over a managed async connection.
//!
//! Every operation is bounded by the configured timeout and counted; errors
//! are logged at the boundary so callers can treat them uniformly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue};
use tracing::warn;

use super::{KeyValueStore, KvError, KvResult, KvStats};

#[derive(Default)]
struct Counters {
    ops: AtomicU64,
    errors: AtomicU64,
}

/// Typed, traced Redis client wrapper.
pub struct RedisKv {
    conn: ConnectionManager,
    op_timeout: Duration,
    counters: Arc<Counters>,
}

impl RedisKv {
    /// Connect and build the managed connection.
    pub async fn connect(url: &str, op_timeout: Duration) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            op_timeout,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Run one command under the operation deadline.
    async fn run<T: FromRedisValue>(&self, op: &'static str, cmd: Cmd, deadline: Duration) -> KvResult<T> {
        self.counters.ops.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn.clone();

        match tokio::time::timeout(deadline, cmd.query_async::<_, T>(&mut conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(op, error = %e, "kv operation failed");
                Err(KvError::Redis(e))
            }
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(op, "kv operation timed out");
                Err(KvError::Timeout(op.to_string()))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("get", cmd, self.op_timeout).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.run("set", cmd, self.op_timeout).await
    }

    async fn delete(&self, keys: &[String]) -> KvResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.run("del", cmd, self.op_timeout).await
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let n: u64 = self.run("exists", cmd, self.op_timeout).await?;
        Ok(n > 0)
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let millis: i64 = self.run("pttl", cmd, self.op_timeout).await?;
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn incr_window(&self, key: &str, window: Duration) -> KvResult<i64> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        let count: i64 = self.run("incr", cmd, self.op_timeout).await?;

        if count == 1 {
            let mut expire = redis::cmd("PEXPIRE");
            expire.arg(key).arg(window.as_millis() as u64);
            let _: i64 = self.run("pexpire", expire, self.op_timeout).await?;
        }

        Ok(count)
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<u64> {
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key).arg(value);
        self.run("lpush", cmd, self.op_timeout).await
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> KvResult<Option<String>> {
        let mut cmd = redis::cmd("BRPOP");
        cmd.arg(key).arg(timeout.as_secs_f64());
        // The deadline must outlast the server-side block.
        let deadline = timeout + self.op_timeout;
        let popped: Option<(String, String)> = self.run("brpop", cmd, deadline).await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.run("llen", cmd, self.op_timeout).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.run("lrange", cmd, self.op_timeout).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        let mut cmd = redis::cmd("LTRIM");
        cmd.arg(key).arg(start).arg(stop);
        self.run("ltrim", cmd, self.op_timeout).await
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut cmd = redis::cmd("KEYS");
        cmd.arg(pattern);
        self.run("keys", cmd, self.op_timeout).await
    }

    fn stats(&self) -> KvStats {
        KvStats {
            ops_total: self.counters.ops.load(Ordering::Relaxed),
            errors_total: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}
