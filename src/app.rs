//! Application wiring.
//!
//! All shared state lives in one explicit `AppContext` built at startup and
//! handed to the API layer; background tasks (workers, monitor) derive their
//! lifetime from a root shutdown channel. No globals.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::audit::AuditSink;
use crate::cache::CitizenCache;
use crate::config::ServiceConfig;
use crate::kv::{KeyValueStore, RedisKv};
use crate::merge::MergePolicy;
use crate::monitor::Controller;
use crate::notifier::{self, CodeNotifier};
use crate::profile::{OverlayService, UserConfigService};
use crate::queue::{KvQueue, MutationQueue, WorkerPool};
use crate::store::{DocumentBackend, SqlBackend, StoreGateway};
use crate::verify::PhoneVerifier;

/// Everything the request path needs, built once at startup.
pub struct AppContext {
    pub config: ServiceConfig,
    pub kv: Arc<dyn KeyValueStore>,
    pub gateway: Arc<StoreGateway>,
    pub cache: Arc<CitizenCache>,
    pub queue: Arc<dyn MutationQueue>,
    pub overlay: Arc<OverlayService>,
    pub user_config: Arc<UserConfigService>,
    pub verifier: Arc<PhoneVerifier>,
    pub audit: Arc<AuditSink>,
    pub monitor: Arc<Controller>,
}

/// The assembled service: context plus background machinery.
pub struct App {
    pub context: Arc<AppContext>,
    workers: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl App {
    /// Connect the production backends and assemble the service.
    pub async fn connect(config: ServiceConfig) -> anyhow::Result<Self> {
        let kv = RedisKv::connect(&config.kv.url, config.kv.op_timeout()).await?;
        let backend =
            SqlBackend::connect(&config.store.database_url, config.store.max_connections).await?;
        let delivery = notifier::from_config(&config.verification);

        let app = Self::assemble(config, Arc::new(kv), Arc::new(backend), delivery);

        // Index maintenance at startup; a down store is not fatal (the
        // service can boot straight into degraded mode).
        if let Err(e) = app.context.gateway.ensure_indexes().await {
            warn!(error = %e, "index maintenance failed at startup");
        }

        Ok(app)
    }

    /// Wire the service over explicit backends. Tests pass the in-memory
    /// implementations here.
    pub fn assemble(
        config: ServiceConfig,
        kv: Arc<dyn KeyValueStore>,
        backend: Arc<dyn DocumentBackend>,
        delivery: Arc<dyn CodeNotifier>,
    ) -> Self {
        let degraded = Arc::new(AtomicBool::new(false));

        let gateway = Arc::new(StoreGateway::new(backend, config.store.op_timeout()));
        let cache = Arc::new(CitizenCache::new(
            Arc::clone(&kv),
            Arc::clone(&gateway),
            config.cache.clone(),
            MergePolicy::from_config(&config.merge),
            Arc::clone(&degraded),
        ));
        let queue: Arc<dyn MutationQueue> =
            Arc::new(KvQueue::new(Arc::clone(&kv), config.queue.dead_letter_cap));
        let audit = Arc::new(AuditSink::new(Arc::clone(&queue)));
        let overlay = Arc::new(OverlayService::new(
            Arc::clone(&cache),
            Arc::clone(&gateway),
            Arc::clone(&queue),
            Arc::clone(&audit),
        ));
        let user_config = Arc::new(UserConfigService::new(
            Arc::clone(&cache),
            Arc::clone(&gateway),
            Arc::clone(&queue),
            Arc::clone(&audit),
        ));
        let verifier = Arc::new(PhoneVerifier::new(
            Arc::clone(&cache),
            Arc::clone(&gateway),
            Arc::clone(&queue),
            Arc::clone(&overlay),
            delivery,
            Arc::clone(&audit),
            config.verification.clone(),
        ));

        let workers = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&gateway),
            Arc::clone(&cache),
            config.queue.clone(),
        );
        let monitor = Controller::new(
            Arc::clone(&gateway),
            Arc::clone(&queue),
            Arc::clone(&kv),
            cache.counters(),
            workers.stats(),
            config.monitor.clone(),
            degraded,
        );

        let (shutdown_tx, _) = watch::channel(false);

        let context = Arc::new(AppContext {
            config,
            kv,
            gateway,
            cache,
            queue,
            overlay,
            user_config,
            verifier,
            audit,
            monitor,
        });

        Self {
            context,
            workers,
            shutdown_tx,
            monitor_handle: None,
        }
    }

    /// Start queue workers and the metrics/degraded-mode poller.
    pub fn start_background(&mut self) {
        self.workers.start();
        let monitor = Arc::clone(&self.context.monitor);
        let shutdown = self.shutdown_tx.subscribe();
        self.monitor_handle = Some(tokio::spawn(monitor.run(shutdown)));
    }

    /// Drain current work and stop background tasks.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.workers.shutdown().await;
        if let Some(handle) = self.monitor_handle.take() {
            let _ = handle.await;
        }
    }
}
