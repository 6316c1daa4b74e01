//! Audit transport: accepted writes produce an `AuditRecord` that rides the
//! write-behind queue as its own mutation kind. Recording is best-effort and
//! never fails the write it describes.

use std::sync::Arc;

use tracing::warn;

use crate::models::{AuditRecord, MutationPayload, PendingMutation};
use crate::queue::MutationQueue;

/// Queue-backed audit sink.
pub struct AuditSink {
    queue: Arc<dyn MutationQueue>,
}

impl AuditSink {
    pub fn new(queue: Arc<dyn MutationQueue>) -> Self {
        Self { queue }
    }

    pub async fn record(&self, record: AuditRecord) {
        let id = record.id;
        let mutation = PendingMutation::new(id.to_string(), MutationPayload::Audit(record));
        if let Err(e) = self.queue.enqueue(&mutation).await {
            warn!(audit_id = %id, error = %e, "audit record dropped");
        }
    }
}
