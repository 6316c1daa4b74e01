//! Worker pool draining the write-behind queues into the document store.
//!
//! Each worker loops on a blocking pop, applies the mutation through the
//! gateway, and classifies failures: retryable errors requeue with
//! exponential backoff up to the attempt cap, version conflicts rebase
//! against the stored document (bounded by the rebase budget), everything
//! else dead-letters. Workers ignore request deadlines and answer only to
//! the shutdown signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CitizenCache};
use crate::config::QueueConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::merge;
use crate::models::{MutationKind, MutationPayload, PendingMutation, SelfDeclaredOverlay, UserConfig};
use crate::store::StoreGateway;

use super::{backoff, MutationQueue};

/// Cumulative worker counters.
#[derive(Default)]
pub struct WorkerStats {
    pub applied: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub rebases: AtomicU64,
    pub dead_lettered: AtomicU64,
    last_applied_at: Mutex<Option<DateTime<Utc>>>,
}

/// Snapshot of the worker counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatsSnapshot {
    pub applied: u64,
    pub failed: u64,
    pub retries: u64,
    pub rebases: u64,
    pub dead_lettered: u64,
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rebases: self.rebases.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            last_applied_at: *self.last_applied_at.lock(),
        }
    }

    fn mark_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        *self.last_applied_at.lock() = Some(Utc::now());
    }
}

#[derive(Clone)]
struct WorkerContext {
    queue: Arc<dyn MutationQueue>,
    gateway: Arc<StoreGateway>,
    cache: Arc<CitizenCache>,
    config: QueueConfig,
    stats: Arc<WorkerStats>,
}

/// Fixed worker pool, one set of workers per mutation kind.
pub struct WorkerPool {
    context: WorkerContext,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn MutationQueue>,
        gateway: Arc<StoreGateway>,
        cache: Arc<CitizenCache>,
        config: QueueConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            context: WorkerContext {
                queue,
                gateway,
                cache,
                config,
                stats: Arc::new(WorkerStats::default()),
            },
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.context.stats)
    }

    /// Spawn the configured number of workers for every mutation kind.
    pub fn start(&mut self) {
        for kind in MutationKind::ALL {
            for worker_index in 0..self.context.config.workers_per_kind {
                let context = self.context.clone();
                let shutdown = self.shutdown_tx.subscribe();
                self.handles.push(tokio::spawn(async move {
                    run_worker(kind, worker_index, context, shutdown).await;
                }));
            }
        }
        info!(
            workers_per_kind = self.context.config.workers_per_kind,
            "write-behind workers started"
        );
    }

    /// Signal workers to finish their current item and stop, then join them.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        futures::future::join_all(self.handles.drain(..)).await;
        info!("write-behind workers stopped");
    }
}

async fn run_worker(
    kind: MutationKind,
    worker_index: usize,
    context: WorkerContext,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%kind, worker_index, "worker loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let popped = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            popped = context.queue.pop(kind, context.config.pop_timeout()) => popped,
        };

        match popped {
            Ok(Some(mutation)) => process(&context, mutation).await,
            Ok(None) => {}
            Err(e) => {
                warn!(%kind, error = %e, "queue pop failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
    debug!(%kind, worker_index, "worker loop stopped");
}

async fn process(context: &WorkerContext, mutation: PendingMutation) {
    let now = Utc::now();
    if !mutation.is_due(now) {
        // Scheduled for later: push back and yield briefly so a lone delayed
        // element does not spin the loop.
        if let Err(e) = context.queue.requeue(&mutation).await {
            error!(id = %mutation.id, error = %e, "requeue of delayed mutation failed");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        return;
    }

    let mut current = mutation;
    loop {
        match apply(context, &current).await {
            Ok(()) => {
                context.stats.mark_applied();
                confirm(context, &current).await;
                return;
            }
            Err(e) if e.is_version_conflict() => {
                context.stats.rebases.fetch_add(1, Ordering::Relaxed);
                current.rebases += 1;
                if current.rebases > context.config.rebase_budget {
                    dead_letter(context, &current, "rebase budget exhausted").await;
                    return;
                }
                match rebase(context, &mut current).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        // Already reflected in the store: nothing to write.
                        context.stats.mark_applied();
                        confirm(context, &current).await;
                        return;
                    }
                    Err(re) => {
                        schedule_retry(context, current, &re).await;
                        return;
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                schedule_retry(context, current, &e).await;
                return;
            }
            Err(e) => {
                dead_letter(context, &current, &format!("permanent apply error: {e}")).await;
                return;
            }
        }
    }
}

async fn apply(context: &WorkerContext, mutation: &PendingMutation) -> ServiceResult<()> {
    match &mutation.payload {
        MutationPayload::Overlay(overlay) => {
            context
                .gateway
                .upsert_overlay(overlay, overlay.version - 1)
                .await?;
        }
        MutationPayload::UserConfig(config) => {
            context
                .gateway
                .upsert_user_config(config, config.version - 1)
                .await?;
        }
        MutationPayload::PhoneMapping(mapping) => {
            context.gateway.upsert_phone_mapping(mapping).await?;
        }
        MutationPayload::Audit(record) => {
            context.gateway.append_audit(record).await?;
        }
        MutationPayload::VerificationCreate(verification) => {
            context.gateway.create_verification(verification).await?;
        }
        MutationPayload::VerificationDelete { cpf, telefone } => {
            context.gateway.delete_verification(cpf, telefone).await?;
        }
    }
    Ok(())
}

/// Post-apply confirmation: force the next read to recompute the merged view.
async fn confirm(context: &WorkerContext, mutation: &PendingMutation) {
    if mutation.kind == MutationKind::OverlayUpsert {
        context
            .cache
            .invalidate(&[CacheKey::Citizen(&mutation.key)])
            .await;
    }
}

/// Rebase a conflicted mutation against the stored document.
///
/// Returns `Ok(true)` when the payload was rebased and should be re-applied,
/// `Ok(false)` when the store already reflects the change.
async fn rebase(context: &WorkerContext, mutation: &mut PendingMutation) -> ServiceResult<bool> {
    match &mutation.payload {
        MutationPayload::Overlay(ours) => {
            let stored = context.gateway.load_overlay(&ours.cpf).await?;
            let Some(stored) = stored else {
                // Conflict without a stored document: expected version drifted
                // below zero. Reset to a create.
                let mut reset = ours.clone();
                reset.version = 1;
                mutation.payload = MutationPayload::Overlay(reset);
                return Ok(true);
            };

            let rebased = merge::rebase_overlay(ours, &stored);
            if overlay_fields_equal(&rebased, &stored) {
                return Ok(false);
            }
            debug!(
                cpf = %rebased.cpf,
                version = rebased.version,
                "overlay rebased after version conflict"
            );
            mutation.payload = MutationPayload::Overlay(rebased);
            Ok(true)
        }
        MutationPayload::UserConfig(ours) => {
            let stored = context.gateway.load_user_config(&ours.cpf).await?;
            let Some(stored) = stored else {
                let mut reset = ours.clone();
                reset.version = 1;
                mutation.payload = MutationPayload::UserConfig(reset);
                return Ok(true);
            };

            if user_config_fields_equal(ours, &stored) {
                return Ok(false);
            }
            // Whole-document last-writer-wins on top of the stored version.
            let mut rebased = ours.clone();
            rebased.version = stored.version + 1;
            mutation.payload = MutationPayload::UserConfig(rebased);
            Ok(true)
        }
        // Remaining kinds are idempotent by natural key and cannot conflict.
        _ => Ok(false),
    }
}

fn overlay_fields_equal(a: &SelfDeclaredOverlay, b: &SelfDeclaredOverlay) -> bool {
    a.endereco == b.endereco
        && a.email == b.email
        && a.telefone == b.telefone
        && a.telefone_pendente == b.telefone_pendente
        && a.etnia == b.etnia
}

fn user_config_fields_equal(a: &UserConfig, b: &UserConfig) -> bool {
    a.first_login == b.first_login
        && a.opt_in == b.opt_in
        && a.opt_in_categorias == b.opt_in_categorias
        && a.avatar_id == b.avatar_id
}

async fn schedule_retry(context: &WorkerContext, mut mutation: PendingMutation, cause: &ServiceError) {
    mutation.attempts += 1;
    context.stats.retries.fetch_add(1, Ordering::Relaxed);

    if mutation.attempts >= context.config.max_attempts {
        context.stats.failed.fetch_add(1, Ordering::Relaxed);
        dead_letter(
            context,
            &mutation,
            &format!("attempt cap reached after: {cause}"),
        )
        .await;
        return;
    }

    let delay = backoff::delay(&context.config, mutation.attempts);
    mutation.earliest_retry_at =
        Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
    warn!(
        id = %mutation.id,
        kind = %mutation.kind,
        attempts = mutation.attempts,
        delay_ms = delay.as_millis() as u64,
        error = %cause,
        "apply failed, retry scheduled"
    );

    if let Err(e) = context.queue.requeue(&mutation).await {
        // The mutation is lost from the queue; this is the loudest we can be.
        error!(id = %mutation.id, error = %e, "requeue failed, mutation dropped");
    }
}

async fn dead_letter(context: &WorkerContext, mutation: &PendingMutation, reason: &str) {
    context.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = context.queue.dead_letter(mutation, reason).await {
        error!(id = %mutation.id, error = %e, "dead-letter write failed");
    }
}
