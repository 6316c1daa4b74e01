//! Write-behind queue.
//!
//! This module provides:
//! - The `MutationQueue` contract (durable FIFO per mutation kind)
//! - A KV-backed implementation over list primitives (LPUSH/BRPOP/LLEN)
//! - Dead-letter lists with bounded retention
//! - The worker pool draining the queues into the document store

pub mod backoff;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, warn};

use crate::kv::{KeyValueStore, KvError};
use crate::models::{DeadLetter, MutationKind, PendingMutation};

pub use worker::{WorkerPool, WorkerStats, WorkerStatsSnapshot};

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

fn queue_key(kind: MutationKind) -> String {
    format!("queue:mutations:{kind}")
}

fn dead_key(kind: MutationKind) -> String {
    format!("queue:dead:{kind}")
}

/// Durable FIFO of pending mutations, one list per kind.
///
/// `enqueue` returns only once the element is persisted; the handler may
/// acknowledge the client immediately afterwards.
#[async_trait]
pub trait MutationQueue: Send + Sync {
    async fn enqueue(&self, mutation: &PendingMutation) -> QueueResult<()>;

    /// Blocking pop bounded by `timeout`; `None` when nothing arrived.
    async fn pop(&self, kind: MutationKind, timeout: Duration) -> QueueResult<Option<PendingMutation>>;

    /// Put a mutation back (retry scheduling); served after current elements.
    async fn requeue(&self, mutation: &PendingMutation) -> QueueResult<()>;

    /// Route a mutation to the dead-letter list.
    async fn dead_letter(&self, mutation: &PendingMutation, reason: &str) -> QueueResult<()>;

    /// Current depth of one kind's FIFO.
    async fn depth(&self, kind: MutationKind) -> QueueResult<u64>;

    /// Current depth of one kind's dead-letter list.
    async fn dead_depth(&self, kind: MutationKind) -> QueueResult<u64>;

    /// Dead-letter contents for operator inspection, newest first.
    async fn dead_letters(&self, kind: MutationKind) -> QueueResult<Vec<DeadLetter>>;
}

/// KV-backed queue. The in-memory KV satisfies the same contract in tests.
pub struct KvQueue {
    kv: Arc<dyn KeyValueStore>,
    dead_letter_cap: usize,
}

impl KvQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>, dead_letter_cap: usize) -> Self {
        Self {
            kv,
            dead_letter_cap,
        }
    }
}

#[async_trait]
impl MutationQueue for KvQueue {
    async fn enqueue(&self, mutation: &PendingMutation) -> QueueResult<()> {
        let raw = serde_json::to_string(mutation)?;
        self.kv.lpush(&queue_key(mutation.kind), &raw).await?;
        Ok(())
    }

    async fn pop(&self, kind: MutationKind, timeout: Duration) -> QueueResult<Option<PendingMutation>> {
        let Some(raw) = self.kv.brpop(&queue_key(kind), timeout).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(mutation) => Ok(Some(mutation)),
            Err(e) => {
                // Poison element: park it where an operator can see it.
                warn!(%kind, error = %e, "undecodable queue element, dead-lettering raw payload");
                let parked = serde_json::json!({
                    "raw": raw,
                    "reason": format!("undecodable: {e}"),
                    "failed_at": Utc::now(),
                });
                self.kv.lpush(&dead_key(kind), &parked.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn requeue(&self, mutation: &PendingMutation) -> QueueResult<()> {
        // Head side: drained last, so younger elements keep moving.
        self.enqueue(mutation).await
    }

    async fn dead_letter(&self, mutation: &PendingMutation, reason: &str) -> QueueResult<()> {
        let letter = DeadLetter {
            mutation: mutation.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let raw = serde_json::to_string(&letter)?;
        let key = dead_key(mutation.kind);
        self.kv.lpush(&key, &raw).await?;
        self.kv.ltrim(&key, 0, self.dead_letter_cap as i64 - 1).await?;
        error!(kind = %mutation.kind, id = %mutation.id, reason, "mutation dead-lettered");
        Ok(())
    }

    async fn depth(&self, kind: MutationKind) -> QueueResult<u64> {
        Ok(self.kv.llen(&queue_key(kind)).await?)
    }

    async fn dead_depth(&self, kind: MutationKind) -> QueueResult<u64> {
        Ok(self.kv.llen(&dead_key(kind)).await?)
    }

    async fn dead_letters(&self, kind: MutationKind) -> QueueResult<Vec<DeadLetter>> {
        let raw = self.kv.lrange(&dead_key(kind), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|item| serde_json::from_str(item).ok())
            .collect())
    }
}
