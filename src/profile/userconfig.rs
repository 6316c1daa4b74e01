//! User-config write path: first login, opt-in flags, avatar.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::audit::AuditSink;
use crate::cache::CitizenCache;
use crate::error::ServiceResult;
use crate::models::user_config::UserConfigPatch;
use crate::models::{AuditRecord, MutationPayload, PendingMutation, UserConfig};
use crate::queue::MutationQueue;
use crate::store::StoreGateway;

/// Staged write-behind for per-CPF preferences.
pub struct UserConfigService {
    cache: Arc<CitizenCache>,
    gateway: Arc<StoreGateway>,
    queue: Arc<dyn MutationQueue>,
    audit: Arc<AuditSink>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserConfigService {
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

    /// Read path: cache, then store (cached on the way out), then defaults.
    pub async fn get(&self, cpf: &str) -> ServiceResult<UserConfig> {
        if let Some(cached) = self.cache.get_user_config(cpf).await {
            return Ok(cached);
        }

        match self.gateway.load_user_config(cpf).await {
            Ok(Some(stored)) => {
                let _ = self.cache.put_user_config(&stored).await;
                Ok(stored)
            }
            Ok(None) => Ok(UserConfig::empty(cpf)),
            Err(e) if e.is_retryable() => {
                warn!(cpf, error = %e, "user config load failed, serving defaults");
                Ok(UserConfig::empty(cpf))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one preference patch through the staged write machine.
    pub async fn put(
        &self,
        cpf: &str,
        patch: UserConfigPatch,
        actor: &str,
    ) -> ServiceResult<UserConfig> {
        let lock = self.lock_for(cpf);
        let _guard = lock.lock().await;

        let field = patch.field_name();
        let current = self.get(cpf).await?;
        let next = current.apply(patch, Utc::now());

        let prior = self.cache.put_user_config(&next).await?;

        let mutation = PendingMutation::new(cpf, MutationPayload::UserConfig(next.clone()));
        if let Err(e) = self.queue.enqueue(&mutation).await {
            self.cache.restore_user_config(cpf, prior).await;
            return Err(e.into());
        }

        self.audit
            .record(
                AuditRecord::new(actor, format!("user_config.{field}.update"), "user_config", cpf)
                    .with_before(serde_json::json!({ "version": current.version }))
                    .with_after(serde_json::json!({ "version": next.version, "field": field })),
            )
            .await;

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, MergeConfig};
    use crate::kv::{KeyValueStore, MemoryKv};
    use crate::merge::MergePolicy;
    use crate::models::MutationKind;
    use crate::queue::KvQueue;
    use crate::store::{DocumentBackend, MemoryBackend};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn service() -> (Arc<UserConfigService>, Arc<KvQueue>) {
        let kv = Arc::new(MemoryKv::new());
        let backend = Arc::new(MemoryBackend::new());
        let gateway = Arc::new(StoreGateway::new(
            backend as Arc<dyn DocumentBackend>,
            Duration::from_secs(5),
        ));
        let cache = Arc::new(CitizenCache::new(
            kv.clone() as Arc<dyn KeyValueStore>,
            gateway.clone(),
            CacheConfig::default(),
            MergePolicy::from_config(&MergeConfig::default()),
            Arc::new(AtomicBool::new(false)),
        ));
        let queue = Arc::new(KvQueue::new(kv as Arc<dyn KeyValueStore>, 100));
        let audit = Arc::new(AuditSink::new(queue.clone() as Arc<dyn MutationQueue>));
        (
            Arc::new(UserConfigService::new(
                cache,
                gateway,
                queue.clone() as Arc<dyn MutationQueue>,
                audit,
            )),
            queue,
        )
    }

    #[tokio::test]
    async fn test_defaults_before_any_write() {
        let (service, _) = service();
        let config = service.get("123").await.unwrap();
        assert!(config.first_login);
        assert_eq!(config.version, 0);
    }

    #[tokio::test]
    async fn test_put_first_login() {
        let (service, queue) = service();
        let next = service
            .put("123", UserConfigPatch::FirstLogin(false), "123")
            .await
            .unwrap();
        assert!(!next.first_login);
        assert_eq!(next.version, 1);

        // Read-your-writes through the cache.
        let read = service.get("123").await.unwrap();
        assert!(!read.first_login);
        assert_eq!(
            queue.depth(MutationKind::UserConfigUpsert).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_opt_in_roundtrip() {
        let (service, _) = service();
        service
            .put("123", UserConfigPatch::OptIn(true), "123")
            .await
            .unwrap();
        let read = service.get("123").await.unwrap();
        assert!(read.opt_in);
    }
}
