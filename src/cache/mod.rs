//! Cache layer.
//!
//! This module provides:
//! - Read-through merged views with single-flight stampede protection
//! - Read-your-writes overlay staging (`put_overlay` before enqueue)
//! - Negative caching behind an in-process guard plus a KV sentinel
//! - Best-effort invalidation and hit/miss/ratio accounting
//! - Degraded-mode serving of stale entries when the store is down

pub mod keys;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache as MokaCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::kv::KeyValueStore;
use crate::merge::{self, CitizenView, MergePolicy};
use crate::models::{PhoneCpfMapping, PhoneVerification, SelfDeclaredOverlay, UserConfig};
use crate::store::StoreGateway;

pub use keys::{CacheKey, KeyFamily};

/// Sentinel value marking a known-missing entity.
const NEGATIVE_SENTINEL: &str = "__missing__";

/// How a merged view was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewSource {
    CacheHit,
    Computed,
    Degraded,
}

/// Cached merged view plus its logical freshness stamp. The KV entry outlives
/// `cached_at + ttl` so degraded mode has something stale to serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedView {
    view: CitizenView,
    cached_at: DateTime<Utc>,
}

#[derive(Clone)]
enum MergedOutcome {
    Found(CitizenView),
    Missing,
}

/// Cache hit/miss counters.
#[derive(Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub negative_hits: AtomicU64,
    pub computed: AtomicU64,
    pub degraded_serves: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
    pub invalidations: AtomicU64,
}

/// Point-in-time snapshot of the counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub computed: u64,
    pub degraded_serves: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
}

impl CacheCounters {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            degraded_serves: self.degraded_serves.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// The two-tier cache in front of the document store.
pub struct CitizenCache {
    kv: Arc<dyn KeyValueStore>,
    gateway: Arc<StoreGateway>,
    config: CacheConfig,
    merge_policy: MergePolicy,
    /// In-process guard for known-missing CPFs.
    negative_guard: MokaCache<String, ()>,
    /// Single-flight groups keyed by cache key.
    flights: Mutex<HashMap<String, Arc<OnceCell<MergedOutcome>>>>,
    counters: Arc<CacheCounters>,
    degraded: Arc<AtomicBool>,
}

impl CitizenCache {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        gateway: Arc<StoreGateway>,
        config: CacheConfig,
        merge_policy: MergePolicy,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        let negative_guard = MokaCache::builder()
            .max_capacity(config.negative_guard_capacity)
            .time_to_live(config.negative_ttl())
            .build();

        Self {
            kv,
            gateway,
            config,
            merge_policy,
            negative_guard,
            flights: Mutex::new(HashMap::new()),
            counters: Arc::new(CacheCounters::default()),
            degraded,
        }
    }

    pub fn counters(&self) -> Arc<CacheCounters> {
        Arc::clone(&self.counters)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn ttl_for(&self, family: KeyFamily) -> Duration {
        match family {
            KeyFamily::Citizen => self.config.citizen_ttl(),
            KeyFamily::Overlay => self.config.overlay_ttl(),
            KeyFamily::UserConfig => self.config.user_config_ttl(),
            KeyFamily::PhoneMapping => self.config.phone_mapping_ttl(),
            KeyFamily::Address => self.config.address_ttl(),
            // Verification and rate-limit TTLs are dictated by the caller.
            KeyFamily::Verification | KeyFamily::RateLimit => self.config.negative_ttl(),
        }
    }

    /// A cache read error is a miss; log, count, move on.
    async fn kv_get(&self, key: &str) -> Option<String> {
        match self.kv.get(key).await {
            Ok(value) => value,
            Err(e) => {
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// A cache write error never fails the caller unless the caller opts in.
    async fn kv_set_soft(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.kv.set(key, value, Some(ttl)).await {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key, error = %e, "cache write failed");
        }
    }

    // ------------------------------------------------------------------
    // Merged views
    // ------------------------------------------------------------------

    /// Read-through merged view for a CPF.
    pub async fn get_merged(&self, cpf: &str) -> ServiceResult<(CitizenView, ViewSource)> {
        let key = CacheKey::Citizen(cpf).render();
        let degraded = self.is_degraded();

        // In-process negative guard first, then the KV tier.
        if self.negative_guard.get(cpf).await.is_some() {
            self.counters.negative_hits.fetch_add(1, Ordering::Relaxed);
            return Err(ServiceError::NotFound(format!("citizen {cpf}")));
        }

        let mut stale: Option<CitizenView> = None;
        if let Some(raw) = self.kv_get(&key).await {
            if raw == NEGATIVE_SENTINEL {
                self.counters.negative_hits.fetch_add(1, Ordering::Relaxed);
                self.negative_guard.insert(cpf.to_string(), ()).await;
                return Err(ServiceError::NotFound(format!("citizen {cpf}")));
            }
            match serde_json::from_str::<CachedView>(&raw) {
                Ok(cached) => {
                    let fresh = Utc::now()
                        .signed_duration_since(cached.cached_at)
                        .to_std()
                        .map_or(true, |age| age < self.config.citizen_ttl());
                    if degraded {
                        self.counters.degraded_serves.fetch_add(1, Ordering::Relaxed);
                        return Ok((cached.view, ViewSource::Degraded));
                    }
                    if fresh {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok((cached.view, ViewSource::CacheHit));
                    }
                    // Logically stale: recompute, but keep it for fallback.
                    stale = Some(cached.view);
                }
                Err(e) => {
                    self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "cached view undecodable, recomputing");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let cell = {
            let mut flights = self.flights.lock().await;
            Arc::clone(
                flights
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let outcome = cell
            .get_or_try_init(|| self.compute_merged(cpf))
            .await
            .map(Clone::clone);

        {
            let mut flights = self.flights.lock().await;
            if let Some(current) = flights.get(&key) {
                if Arc::ptr_eq(current, &cell) {
                    flights.remove(&key);
                }
            }
        }

        match outcome {
            Ok(MergedOutcome::Found(view)) => {
                self.counters.computed.fetch_add(1, Ordering::Relaxed);
                Ok((view, ViewSource::Computed))
            }
            Ok(MergedOutcome::Missing) => Err(ServiceError::NotFound(format!("citizen {cpf}"))),
            Err(e) if e.is_store_unavailable() => {
                if let Some(view) = stale {
                    self.counters.degraded_serves.fetch_add(1, Ordering::Relaxed);
                    return Ok((view, ViewSource::Degraded));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch base and overlay, merge, store. Exactly one in-flight execution
    /// per key thanks to the single-flight cell.
    async fn compute_merged(&self, cpf: &str) -> ServiceResult<MergedOutcome> {
        let (base, stored_overlay) =
            tokio::join!(self.gateway.load_base(cpf), self.gateway.load_overlay(cpf));
        let base = base?;
        let stored_overlay = stored_overlay?;

        // The staged overlay in KV may be ahead of the store; newest wins.
        let staged_overlay = self.get_overlay(cpf).await;
        let overlay = match (staged_overlay, stored_overlay) {
            (Some(a), Some(b)) => Some(if a.version >= b.version { a } else { b }),
            (a, b) => a.or(b),
        };

        if base.is_none() && overlay.is_none() {
            self.mark_negative(cpf).await;
            return Ok(MergedOutcome::Missing);
        }

        let view = merge::merge_view(
            cpf,
            base.as_ref(),
            overlay.as_ref(),
            &self.merge_policy,
            Utc::now(),
        );

        let cached = CachedView {
            view: view.clone(),
            cached_at: Utc::now(),
        };
        if let Ok(raw) = serde_json::to_string(&cached) {
            let physical_ttl = self.config.citizen_ttl() + self.config.degraded_retention();
            self.kv_set_soft(&CacheKey::Citizen(cpf).render(), &raw, physical_ttl)
                .await;
        }

        Ok(MergedOutcome::Found(view))
    }

    /// Record that a CPF resolves to nothing, shielding the store.
    pub async fn mark_negative(&self, cpf: &str) {
        self.negative_guard.insert(cpf.to_string(), ()).await;
        self.kv_set_soft(
            &CacheKey::Citizen(cpf).render(),
            NEGATIVE_SENTINEL,
            self.config.negative_ttl(),
        )
        .await;
        debug!(cpf, "negative-cached");
    }

    // ------------------------------------------------------------------
    // Overlay staging
    // ------------------------------------------------------------------

    /// Latest overlay known to this process, if cached.
    pub async fn get_overlay(&self, cpf: &str) -> Option<SelfDeclaredOverlay> {
        let raw = self.kv_get(&CacheKey::Overlay(cpf).render()).await?;
        match serde_json::from_str(&raw) {
            Ok(overlay) => Some(overlay),
            Err(e) => {
                warn!(cpf, error = %e, "cached overlay undecodable");
                None
            }
        }
    }

    /// Stage an overlay ahead of the store write. Returns the prior raw cache
    /// entry so a failed enqueue can roll back. The merged view is deleted,
    /// not overwritten, to force a recompute on the next read.
    pub async fn put_overlay(
        &self,
        overlay: &SelfDeclaredOverlay,
    ) -> ServiceResult<Option<String>> {
        let cpf = overlay.cpf.as_str();
        let key = CacheKey::Overlay(cpf).render();
        let prior = self.kv_get(&key).await;

        let raw = serde_json::to_string(overlay)?;
        if let Err(e) = self
            .kv
            .set(&key, &raw, Some(self.config.overlay_ttl()))
            .await
        {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            if self.is_degraded() {
                // In degraded-or-unknown states the queue is the safety net.
                warn!(cpf, error = %e, "overlay stage failed under degraded mode, continuing");
            } else {
                return Err(ServiceError::Cache(format!("overlay stage failed: {e}")));
            }
        }

        // The entity now definitely exists.
        self.negative_guard.invalidate(cpf).await;
        self.invalidate(&[CacheKey::Citizen(cpf)]).await;
        Ok(prior)
    }

    /// Roll a failed staging back to the prior cache state.
    pub async fn restore_overlay(&self, cpf: &str, prior: Option<String>) {
        let key = CacheKey::Overlay(cpf).render();
        match prior {
            Some(raw) => {
                self.kv_set_soft(&key, &raw, self.config.overlay_ttl()).await;
            }
            None => {
                self.invalidate(&[CacheKey::Overlay(cpf)]).await;
            }
        }
        self.invalidate(&[CacheKey::Citizen(cpf)]).await;
    }

    // ------------------------------------------------------------------
    // User config and phone mappings
    // ------------------------------------------------------------------

    pub async fn get_user_config(&self, cpf: &str) -> Option<UserConfig> {
        let raw = self.kv_get(&CacheKey::UserConfig(cpf).render()).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn put_user_config(&self, config: &UserConfig) -> ServiceResult<Option<String>> {
        let key = CacheKey::UserConfig(&config.cpf).render();
        let prior = self.kv_get(&key).await;
        let raw = serde_json::to_string(config)?;
        if let Err(e) = self
            .kv
            .set(&key, &raw, Some(self.config.user_config_ttl()))
            .await
        {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            if !self.is_degraded() {
                return Err(ServiceError::Cache(format!("user config stage failed: {e}")));
            }
            warn!(cpf = %config.cpf, error = %e, "user config stage failed under degraded mode");
        }
        Ok(prior)
    }

    pub async fn restore_user_config(&self, cpf: &str, prior: Option<String>) {
        let key = CacheKey::UserConfig(cpf).render();
        match prior {
            Some(raw) => self.kv_set_soft(&key, &raw, self.config.user_config_ttl()).await,
            None => self.invalidate(&[CacheKey::UserConfig(cpf)]).await,
        }
    }

    pub async fn get_phone_mapping(&self, telefone: &str) -> Option<PhoneCpfMapping> {
        let raw = self.kv_get(&CacheKey::PhoneMapping(telefone).render()).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn put_phone_mapping(&self, mapping: &PhoneCpfMapping) {
        if let Ok(raw) = serde_json::to_string(mapping) {
            self.kv_set_soft(
                &CacheKey::PhoneMapping(&mapping.telefone).render(),
                &raw,
                self.config.phone_mapping_ttl(),
            )
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Verification documents and rate limiting
    // ------------------------------------------------------------------

    pub async fn get_verification(&self, cpf: &str, telefone: &str) -> Option<PhoneVerification> {
        let key = CacheKey::Verification { cpf, telefone }.render();
        let raw = self.kv_get(&key).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn put_verification(
        &self,
        verification: &PhoneVerification,
        ttl: Duration,
    ) -> ServiceResult<()> {
        let key = CacheKey::Verification {
            cpf: &verification.cpf,
            telefone: &verification.telefone,
        }
        .render();
        let raw = serde_json::to_string(verification)?;
        self.kv
            .set(&key, &raw, Some(ttl))
            .await
            .map_err(|e| ServiceError::Cache(format!("verification stage failed: {e}")))
    }

    /// Atomic single-winner delete: exactly one concurrent caller sees `true`.
    pub async fn take_verification(&self, cpf: &str, telefone: &str) -> ServiceResult<bool> {
        let key = CacheKey::Verification { cpf, telefone }.render();
        let removed = self.kv.delete(&[key]).await?;
        Ok(removed > 0)
    }

    /// Bump the issuance counter; returns the in-window count.
    pub async fn bump_verify_rate(&self, cpf: &str, window: Duration) -> ServiceResult<i64> {
        let key = CacheKey::VerifyRateLimit(cpf).render();
        Ok(self.kv.incr_window(&key, window).await?)
    }

    /// Remaining window on the issuance counter, for the reset hint.
    pub async fn verify_rate_reset(&self, cpf: &str) -> Option<Duration> {
        let key = CacheKey::VerifyRateLimit(cpf).render();
        self.kv.ttl(&key).await.ok().flatten()
    }

    // ------------------------------------------------------------------
    // Reference data
    // ------------------------------------------------------------------

    /// Read-mostly address reference lookup.
    pub async fn get_reference(&self, key: &CacheKey<'_>) -> Option<serde_json::Value> {
        let raw = self.kv_get(&key.render()).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn put_reference(&self, key: &CacheKey<'_>, value: &serde_json::Value) {
        if let Ok(raw) = serde_json::to_string(value) {
            let ttl = self.ttl_for(key.family());
            self.kv_set_soft(&key.render(), &raw, ttl).await;
        }
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Best-effort delete; failures are logged and counted, never surfaced.
    pub async fn invalidate(&self, keys: &[CacheKey<'_>]) {
        let rendered: Vec<String> = keys.iter().map(CacheKey::render).collect();
        match self.kv.delete(&rendered).await {
            Ok(n) => {
                self.counters.invalidations.fetch_add(n, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(keys = ?rendered, error = %e, "invalidation failed");
            }
        }
    }
}
