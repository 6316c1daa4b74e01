//! Service configuration.
//!
//! Every subsystem gets its own config struct with a `Default` impl; the
//! aggregate `ServiceConfig` is loaded from a TOML file and selectively
//! overridden from the environment (connection URLs and secrets only).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address for the API listener.
    pub bind_addr: String,

    /// Per-request budget in seconds.
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// Authentication configuration. Token *issuance* belongs to the external
/// identity provider; this service only validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret shared with the identity provider.
    pub jwt_secret: String,

    /// Role that bypasses CPF ownership checks.
    pub admin_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            admin_role: "admin".to_string(),
        }
    }
}

/// Key/value store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Redis connection URL.
    pub url: String,

    /// Per-operation timeout in milliseconds.
    pub op_timeout_ms: u64,
}

impl KvConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            op_timeout_ms: 2_000,
        }
    }
}

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Postgres connection URL.
    pub database_url: String,

    /// Maximum pool connections.
    pub max_connections: u32,

    /// Per-operation deadline in milliseconds.
    pub op_timeout_ms: u64,
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/civitas".to_string(),
            max_connections: 16,
            op_timeout_ms: 5_000,
        }
    }
}

/// Cache layer configuration. TTLs are per key family; negative entries are
/// always shorter-lived than positive ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Merged citizen view TTL (seconds).
    pub citizen_ttl_secs: u64,

    /// Self-declared overlay TTL (seconds).
    pub overlay_ttl_secs: u64,

    /// User config TTL (seconds).
    pub user_config_ttl_secs: u64,

    /// Phone mapping TTL (seconds).
    pub phone_mapping_ttl_secs: u64,

    /// Address reference data TTL (seconds).
    pub address_ttl_secs: u64,

    /// Negative-cache sentinel TTL (seconds).
    pub negative_ttl_secs: u64,

    /// How long stale merged views are retained for degraded-mode serving,
    /// beyond their logical TTL (seconds).
    pub degraded_retention_secs: u64,

    /// Capacity of the in-process negative-cache guard.
    pub negative_guard_capacity: u64,
}

impl CacheConfig {
    pub fn citizen_ttl(&self) -> Duration {
        Duration::from_secs(self.citizen_ttl_secs)
    }

    pub fn overlay_ttl(&self) -> Duration {
        Duration::from_secs(self.overlay_ttl_secs)
    }

    pub fn user_config_ttl(&self) -> Duration {
        Duration::from_secs(self.user_config_ttl_secs)
    }

    pub fn phone_mapping_ttl(&self) -> Duration {
        Duration::from_secs(self.phone_mapping_ttl_secs)
    }

    pub fn address_ttl(&self) -> Duration {
        Duration::from_secs(self.address_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn degraded_retention(&self) -> Duration {
        Duration::from_secs(self.degraded_retention_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            citizen_ttl_secs: 6 * 3600,
            overlay_ttl_secs: 6 * 3600,
            user_config_ttl_secs: 3600,
            phone_mapping_ttl_secs: 3600,
            address_ttl_secs: 24 * 3600,
            negative_ttl_secs: 300,
            degraded_retention_secs: 24 * 3600,
            negative_guard_capacity: 100_000,
        }
    }
}

/// Write-behind queue and worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Workers per mutation kind.
    pub workers_per_kind: usize,

    /// Blocking pop timeout (seconds); workers recheck shutdown between pops.
    pub pop_timeout_secs: u64,

    /// Maximum apply attempts before dead-lettering.
    pub max_attempts: u32,

    /// Base backoff delay (milliseconds).
    pub backoff_base_ms: u64,

    /// Backoff ceiling (milliseconds).
    pub backoff_cap_ms: u64,

    /// Random jitter added to each backoff (milliseconds).
    pub backoff_jitter_ms: u64,

    /// Version-conflict rebase budget per item (does not count as attempts).
    pub rebase_budget: u32,

    /// Dead-letter list retention per kind.
    pub dead_letter_cap: usize,
}

impl QueueConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers_per_kind: 2,
            pop_timeout_secs: 2,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 60_000,
            backoff_jitter_ms: 250,
            rebase_budget: 16,
            dead_letter_cap: 1000,
        }
    }
}

/// Phone verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Code lifetime (seconds).
    pub code_ttl_secs: u64,

    /// Maximum confirm attempts before the pending verification is deleted.
    pub max_attempts: u32,

    /// Sliding rate-limit window for issuance (seconds).
    pub rate_window_secs: u64,

    /// Issues allowed per CPF per window.
    pub rate_budget: u64,

    /// When false, codes are logged instead of delivered.
    pub delivery_enabled: bool,

    /// Delivery endpoint for the external notifier.
    pub delivery_url: Option<String>,
}

impl VerificationConfig {
    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: 300,
            max_attempts: 3,
            rate_window_secs: 3600,
            rate_budget: 5,
            delivery_enabled: false,
            delivery_url: None,
        }
    }
}

/// Degraded-mode controller and metrics poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Poll interval for store health and queue depths (seconds).
    pub poll_interval_secs: u64,

    /// Consecutive probe failures before entering degraded mode.
    pub failure_threshold: u32,

    /// Consecutive probe successes before leaving degraded mode.
    pub recovery_threshold: u32,

    /// Store probe timeout (milliseconds).
    pub probe_timeout_ms: u64,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            failure_threshold: 3,
            recovery_threshold: 2,
            probe_timeout_ms: 2_000,
        }
    }
}

/// Merge engine freshness policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// A field older than this is flagged `is_outdated` (days).
    pub outdated_after_days: i64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            outdated_after_days: 365,
        }
    }
}

/// Aggregate service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub kv: KvConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub verification: VerificationConfig,
    pub monitor: MonitorConfig,
    pub merge: MergeConfig,
}

impl ServiceConfig {
    /// Parse a TOML document, falling back to defaults for missing fields.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Apply environment overrides for deployment-specific values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("CIVITAS_REDIS_URL") {
            self.kv.url = url;
        }
        if let Ok(url) = std::env::var("CIVITAS_DATABASE_URL") {
            self.store.database_url = url;
        }
        if let Ok(secret) = std::env::var("CIVITAS_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(bind) = std::env::var("CIVITAS_BIND") {
            self.http.bind_addr = bind;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.queue.workers_per_kind, 2);
        assert_eq!(config.verification.max_attempts, 3);
        assert!(config.cache.negative_ttl_secs < config.cache.citizen_ttl_secs);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ServiceConfig::from_toml(
            r#"
            [cache]
            citizen_ttl_secs = 60

            [queue]
            workers_per_kind = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.citizen_ttl_secs, 60);
        assert_eq!(config.queue.workers_per_kind, 4);
        // Untouched sections keep their defaults.
        assert_eq!(config.verification.rate_budget, 5);
    }

    #[test]
    fn test_duration_helpers() {
        let config = ServiceConfig::default();
        assert_eq!(config.kv.op_timeout(), Duration::from_secs(2));
        assert_eq!(config.queue.pop_timeout(), Duration::from_secs(2));
    }
}
