//! Metrics aggregation and the degraded-mode controller.
//!
//! A background poller probes document-store health on a fixed interval,
//! samples queue depths and cache counters, and flips the process-wide
//! degraded flag after a configurable number of consecutive probe failures.
//! The flag recovers only after enough consecutive successes, so a flapping
//! store does not toggle serving behavior on every poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::{CacheCounters, CacheStatsSnapshot};
use crate::config::MonitorConfig;
use crate::kv::{KeyValueStore, KvStats};
use crate::models::MutationKind;
use crate::queue::{MutationQueue, WorkerStats, WorkerStatsSnapshot};
use crate::store::StoreGateway;

/// One aggregated metrics sample.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub degraded: bool,
    pub store_healthy: bool,
    pub cache: CacheStatsSnapshot,
    pub workers: WorkerStatsSnapshot,
    pub kv: KvStats,
    pub queue_depths: HashMap<String, u64>,
    pub dead_letter_depths: HashMap<String, u64>,
    pub polled_at: Option<DateTime<Utc>>,
}

/// Degraded-mode controller and metrics poller.
pub struct Controller {
    gateway: Arc<StoreGateway>,
    queue: Arc<dyn MutationQueue>,
    kv: Arc<dyn KeyValueStore>,
    cache_counters: Arc<CacheCounters>,
    worker_stats: Arc<WorkerStats>,
    config: MonitorConfig,
    degraded: Arc<AtomicBool>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    snapshot: RwLock<MetricsSnapshot>,
}

impl Controller {
    pub fn new(
        gateway: Arc<StoreGateway>,
        queue: Arc<dyn MutationQueue>,
        kv: Arc<dyn KeyValueStore>,
        cache_counters: Arc<CacheCounters>,
        worker_stats: Arc<WorkerStats>,
        config: MonitorConfig,
        degraded: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            queue,
            kv,
            cache_counters,
            worker_stats,
            config,
            degraded,
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            snapshot: RwLock::new(MetricsSnapshot::default()),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.read().clone()
    }

    /// One poll cycle: health probe, depth sampling, snapshot refresh.
    pub async fn poll_once(&self) {
        let healthy = tokio::time::timeout(self.config.probe_timeout(), self.gateway.ping())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        self.apply_probe(healthy);

        let mut queue_depths = HashMap::new();
        let mut dead_letter_depths = HashMap::new();
        for kind in MutationKind::ALL {
            if let Ok(depth) = self.queue.depth(kind).await {
                queue_depths.insert(kind.as_str().to_string(), depth);
            }
            if let Ok(depth) = self.queue.dead_depth(kind).await {
                dead_letter_depths.insert(kind.as_str().to_string(), depth);
            }
        }

        let sample = MetricsSnapshot {
            degraded: self.is_degraded(),
            store_healthy: healthy,
            cache: self.cache_counters.snapshot(),
            workers: self.worker_stats.snapshot(),
            kv: self.kv.stats(),
            queue_depths,
            dead_letter_depths,
            polled_at: Some(Utc::now()),
        };

        *self.snapshot.write() = sample;
    }

    fn apply_probe(&self, healthy: bool) {
        if healthy {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.is_degraded() && successes >= self.config.recovery_threshold {
                self.degraded.store(false, Ordering::SeqCst);
                info!("document store recovered, leaving degraded mode");
            }
        } else {
            self.consecutive_successes.store(0, Ordering::SeqCst);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.is_degraded() && failures >= self.config.failure_threshold {
                self.degraded.store(true, Ordering::SeqCst);
                warn!(failures, "document store unreachable, entering degraded mode");
            }
        }
    }

    /// Background loop. Ignores request deadlines; stops on the shutdown
    /// signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        info!("monitor stopped");
    }

    /// Plain-text exposition of the current snapshot.
    pub fn render_metrics(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::with_capacity(1024);

        let gauge = |out: &mut String, name: &str, value: f64| {
            out.push_str(&format!("{name} {value}\n"));
        };

        gauge(&mut out, "civitas_degraded_mode", snapshot.degraded as u8 as f64);
        gauge(&mut out, "civitas_store_healthy", snapshot.store_healthy as u8 as f64);
        gauge(&mut out, "civitas_cache_hits_total", snapshot.cache.hits as f64);
        gauge(&mut out, "civitas_cache_misses_total", snapshot.cache.misses as f64);
        gauge(&mut out, "civitas_cache_negative_hits_total", snapshot.cache.negative_hits as f64);
        gauge(&mut out, "civitas_cache_hit_ratio", snapshot.cache.hit_ratio);
        gauge(&mut out, "civitas_cache_write_errors_total", snapshot.cache.write_errors as f64);
        gauge(&mut out, "civitas_mutations_applied_total", snapshot.workers.applied as f64);
        gauge(&mut out, "civitas_mutations_retried_total", snapshot.workers.retries as f64);
        gauge(&mut out, "civitas_mutations_rebased_total", snapshot.workers.rebases as f64);
        gauge(&mut out, "civitas_mutations_dead_lettered_total", snapshot.workers.dead_lettered as f64);
        gauge(&mut out, "civitas_kv_ops_total", snapshot.kv.ops_total as f64);
        gauge(&mut out, "civitas_kv_errors_total", snapshot.kv.errors_total as f64);

        for (kind, depth) in &snapshot.queue_depths {
            out.push_str(&format!("civitas_queue_depth{{kind=\"{kind}\"}} {depth}\n"));
        }
        for (kind, depth) in &snapshot.dead_letter_depths {
            out.push_str(&format!("civitas_dead_letter_depth{{kind=\"{kind}\"}} {depth}\n"));
        }

        out
    }
}
