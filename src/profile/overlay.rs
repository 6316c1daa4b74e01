//! Overlay write path: address, email, ethnicity, and the phone slots.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::audit::AuditSink;
use crate::cache::CitizenCache;
use crate::error::ServiceResult;
use crate::models::overlay::OverlayPatch;
use crate::models::{AuditRecord, MutationPayload, PendingMutation, SelfDeclaredOverlay};
use crate::queue::MutationQueue;
use crate::store::StoreGateway;

/// Staged write-behind for the self-declared overlay.
pub struct OverlayService {
    cache: Arc<CitizenCache>,
    gateway: Arc<StoreGateway>,
    queue: Arc<dyn MutationQueue>,
    audit: Arc<AuditSink>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OverlayService {
    pub fn new(
        cache: Arc<CitizenCache>,
        gateway: Arc<StoreGateway>,
        queue: Arc<dyn MutationQueue>,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            cache,
            gateway,
            queue,
            audit,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, cpf: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(cpf.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The overlay this write builds on: staged cache copy first (it may be
    /// ahead of the store), then the store, then the implicit empty overlay.
    pub async fn current(&self, cpf: &str) -> ServiceResult<SelfDeclaredOverlay> {
        if let Some(staged) = self.cache.get_overlay(cpf).await {
            return Ok(staged);
        }

        match self.gateway.load_overlay(cpf).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Ok(SelfDeclaredOverlay::empty(cpf)),
            Err(e) if e.is_retryable() => {
                // Store down: writes stay accepted. Starting from the empty
                // overlay is safe; a version conflict at apply time rebases.
                warn!(cpf, error = %e, "overlay load failed, staging from empty");
                Ok(SelfDeclaredOverlay::empty(cpf))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one field patch through the staged write machine.
    pub async fn put(
        &self,
        cpf: &str,
        patch: OverlayPatch,
        actor: &str,
    ) -> ServiceResult<SelfDeclaredOverlay> {
        let lock = self.lock_for(cpf);
        let _guard = lock.lock().await;

        let field = patch.field_name();
        let current = self.current(cpf).await?;
        let next = current.apply(patch, Utc::now());

        // CacheStaged: the write becomes visible to reads immediately.
        let prior = self.cache.put_overlay(&next).await?;

        // Queued: durability point. A failed enqueue rolls the cache back.
        let mutation = PendingMutation::new(cpf, MutationPayload::Overlay(next.clone()));
        if let Err(e) = self.queue.enqueue(&mutation).await {
            self.cache.restore_overlay(cpf, prior).await;
            return Err(e.into());
        }

        self.audit
            .record(
                AuditRecord::new(actor, format!("overlay.{field}.update"), "self_declared", cpf)
                    .with_before(serde_json::json!({ "version": current.version }))
                    .with_after(serde_json::json!({ "version": next.version, "field": field })),
            )
            .await;

        Ok(next)
    }
}
