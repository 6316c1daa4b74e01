//! Phone verification state machine.
//!
//! A (CPF, phone) pair moves `None → Pending → (Confirmed | Expired |
//! Exhausted)`. At most one code is active per pair: a second issue while
//! pending returns the existing state and never regenerates the code.
//! Confirmation is single-winner: the atomic delete of the verification key
//! gates promotion, and the overlay's version check serializes the write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::warn;

use crate::audit::AuditSink;
use crate::cache::CitizenCache;
use crate::config::VerificationConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::models::overlay::OverlayPatch;
use crate::models::{
    AuditRecord, MutationPayload, PendingMutation, PhoneCpfMapping, PhoneVerification, Telefone,
};
use crate::notifier::CodeNotifier;
use crate::profile::OverlayService;
use crate::queue::MutationQueue;
use crate::store::StoreGateway;

/// Channel recorded on mappings established by this flow.
const SELF_SERVICE_CHANNEL: &str = "self_service";

/// Outcome of an issue call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IssueOutcome {
    /// A fresh code was generated and handed to the notifier.
    Issued { expires_at: DateTime<Utc> },
    /// A verification was already pending; the existing code stays active.
    AlreadyPending { expires_at: DateTime<Utc> },
}

/// The verification state machine.
pub struct PhoneVerifier {
    cache: Arc<CitizenCache>,
    gateway: Arc<StoreGateway>,
    queue: Arc<dyn MutationQueue>,
    overlay: Arc<OverlayService>,
    notifier: Arc<dyn CodeNotifier>,
    audit: Arc<AuditSink>,
    config: VerificationConfig,
}

impl PhoneVerifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<CitizenCache>,
        gateway: Arc<StoreGateway>,
        queue: Arc<dyn MutationQueue>,
        overlay: Arc<OverlayService>,
        notifier: Arc<dyn CodeNotifier>,
        audit: Arc<AuditSink>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            cache,
            gateway,
            queue,
            overlay,
            notifier,
            audit,
            config,
        }
    }

    fn generate_code() -> String {
        format!("{:06}", rand::thread_rng().gen_range(0..=999_999u32))
    }

    /// Pending verification, if any: cache first, store as fallback (the
    /// cache may have been evicted while the document still lives).
    async fn load_pending(&self, cpf: &str, telefone: &str) -> ServiceResult<Option<PhoneVerification>> {
        if let Some(cached) = self.cache.get_verification(cpf, telefone).await {
            return Ok(Some(cached));
        }

        match self.gateway.load_verification(cpf, telefone).await {
            Ok(Some(stored)) => {
                if let Ok(remaining) = stored.expires_at.signed_duration_since(Utc::now()).to_std() {
                    let _ = self.cache.put_verification(&stored, remaining).await;
                }
                Ok(Some(stored))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_retryable() => {
                // Store down: the cache is the only authority we have.
                warn!(cpf, telefone, error = %e, "verification store read failed");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the verification document: synchronous store write on the
    /// happy path, write-behind fallback when the store is unreachable.
    async fn persist_verification(&self, verification: &PhoneVerification) -> ServiceResult<()> {
        match self.gateway.create_verification(verification).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                warn!(
                    cpf = %verification.cpf,
                    error = %e,
                    "verification store write failed, queueing"
                );
                let mutation = PendingMutation::new(
                    verification.telefone.as_str(),
                    MutationPayload::VerificationCreate(verification.clone()),
                );
                self.queue.enqueue(&mutation).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup(&self, cpf: &str, telefone: &str) {
        if let Err(e) = self.cache.take_verification(cpf, telefone).await {
            warn!(cpf, telefone, error = %e, "verification cache cleanup failed");
        }
        match self.gateway.delete_verification(cpf, telefone).await {
            Ok(_) => {}
            Err(e) => {
                warn!(cpf, telefone, error = %e, "verification store delete failed, queueing");
                let mutation = PendingMutation::new(
                    telefone,
                    MutationPayload::VerificationDelete {
                        cpf: cpf.to_string(),
                        telefone: telefone.to_string(),
                    },
                );
                if let Err(e) = self.queue.enqueue(&mutation).await {
                    // The store document still carries its TTL; expiry reaps it.
                    warn!(cpf, telefone, error = %e, "verification delete enqueue failed");
                }
            }
        }
    }

    /// Issue a code for (CPF, phone). Rate-limited per CPF; a pending pair
    /// short-circuits without generating a new code.
    pub async fn issue(
        &self,
        cpf: &str,
        telefone: &Telefone,
        actor: &str,
    ) -> ServiceResult<IssueOutcome> {
        let canonical = telefone.canonical();

        // Budget check happens before any store traffic.
        let count = self
            .cache
            .bump_verify_rate(cpf, self.config.rate_window())
            .await?;
        if count > self.config.rate_budget as i64 {
            let retry_after = self
                .cache
                .verify_rate_reset(cpf)
                .await
                .unwrap_or_else(|| self.config.rate_window());
            return Err(ServiceError::RateLimited { retry_after });
        }

        let now = Utc::now();
        if let Some(existing) = self.load_pending(cpf, &canonical).await? {
            if !existing.is_expired(now) {
                return Ok(IssueOutcome::AlreadyPending {
                    expires_at: existing.expires_at,
                });
            }
            // Expired leftovers are swept before reissuing.
            self.cleanup(cpf, &canonical).await;
        }

        let verification = PhoneVerification {
            cpf: cpf.to_string(),
            telefone: canonical.clone(),
            code: Self::generate_code(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.config.code_ttl())
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            attempts: 0,
        };

        self.cache
            .put_verification(&verification, self.config.code_ttl())
            .await?;

        if let Err(e) = self.persist_verification(&verification).await {
            let _ = self.cache.take_verification(cpf, &canonical).await;
            return Err(e);
        }

        // The pending phone becomes visible through the dedicated endpoints
        // (never in the merged view).
        if let Err(e) = self
            .overlay
            .put(cpf, OverlayPatch::TelefonePendente(Some(telefone.clone())), actor)
            .await
        {
            self.cleanup(cpf, &canonical).await;
            return Err(e);
        }

        if let Err(e) = self
            .notifier
            .deliver(cpf, &canonical, &verification.code)
            .await
        {
            // The code stays valid; the citizen can retry delivery by
            // cancelling and reissuing.
            warn!(cpf, telefone = %canonical, error = %e, "code delivery failed");
        }

        self.audit
            .record(
                AuditRecord::new(actor, "phone.verification.issue", "phone_verification", &canonical)
                    .with_after(serde_json::json!({ "expires_at": verification.expires_at })),
            )
            .await;

        Ok(IssueOutcome::Issued {
            expires_at: verification.expires_at,
        })
    }

    /// Confirm a code. On success the pending phone is promoted atomically:
    /// verification deleted, overlay bumped, mapping bound, view recomputed.
    pub async fn confirm(
        &self,
        cpf: &str,
        telefone: &Telefone,
        code: &str,
        actor: &str,
    ) -> ServiceResult<()> {
        let canonical = telefone.canonical();
        let now = Utc::now();

        let Some(mut verification) = self.load_pending(cpf, &canonical).await? else {
            return Err(ServiceError::VerificationNotFound);
        };

        if verification.is_expired(now) {
            self.cleanup(cpf, &canonical).await;
            return Err(ServiceError::VerificationExpired);
        }

        verification.attempts += 1;

        if verification.code != code {
            if verification.attempts >= self.config.max_attempts {
                self.cleanup(cpf, &canonical).await;
                return Err(ServiceError::AttemptsExhausted);
            }

            // Persist the attempt count so retries survive cache eviction
            // and process restarts.
            let remaining = verification
                .expires_at
                .signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::from_secs(1));
            let _ = self.cache.put_verification(&verification, remaining).await;
            if let Err(e) = self.persist_verification(&verification).await {
                warn!(cpf, error = %e, "attempt count persist failed");
            }

            return Err(ServiceError::InvalidCode {
                attempts_left: self.config.max_attempts - verification.attempts,
            });
        }

        // Single winner: whoever deletes the key promotes.
        if !self.cache.take_verification(cpf, &canonical).await? {
            return Err(ServiceError::VerificationNotFound);
        }

        if let Err(e) = self.gateway.delete_verification(cpf, &canonical).await {
            warn!(cpf, error = %e, "verification store delete failed, queueing");
            let mutation = PendingMutation::new(
                &canonical,
                MutationPayload::VerificationDelete {
                    cpf: cpf.to_string(),
                    telefone: canonical.clone(),
                },
            );
            if let Err(e) = self.queue.enqueue(&mutation).await {
                warn!(cpf, error = %e, "verification delete enqueue failed");
            }
        }

        // Promote: the overlay's version check serializes concurrent writes.
        let current = self.overlay.current(cpf).await?;
        let patch = match &current.telefone_pendente {
            Some(pending) if pending.canonical() == canonical => OverlayPatch::PromoteTelefone,
            _ => OverlayPatch::Telefone(telefone.clone()),
        };
        self.overlay.put(cpf, patch, actor).await?;

        // Bind the number to the CPF for phone→CPF resolution.
        let mapping = PhoneCpfMapping::bound(
            canonical.clone(),
            cpf,
            Some(SELF_SERVICE_CHANNEL.to_string()),
        );
        self.cache.put_phone_mapping(&mapping).await;
        let mutation = PendingMutation::new(&canonical, MutationPayload::PhoneMapping(mapping));
        if let Err(e) = self.queue.enqueue(&mutation).await {
            warn!(cpf, error = %e, "phone mapping enqueue failed");
        }

        self.audit
            .record(AuditRecord::new(
                actor,
                "phone.verification.confirm",
                "phone_verification",
                &canonical,
            ))
            .await;

        Ok(())
    }

    /// Cancel a pending verification and clear the overlay's pending phone.
    pub async fn cancel(&self, cpf: &str, telefone: &Telefone, actor: &str) -> ServiceResult<()> {
        let canonical = telefone.canonical();

        if self.load_pending(cpf, &canonical).await?.is_none() {
            return Err(ServiceError::VerificationNotFound);
        }

        self.cleanup(cpf, &canonical).await;
        self.overlay
            .put(cpf, OverlayPatch::TelefonePendente(None), actor)
            .await?;

        self.audit
            .record(AuditRecord::new(
                actor,
                "phone.verification.cancel",
                "phone_verification",
                &canonical,
            ))
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, MergeConfig, QueueConfig};
    use crate::kv::{KeyValueStore, MemoryKv};
    use crate::merge::MergePolicy;
    use crate::notifier::RecordingNotifier;
    use crate::queue::KvQueue;
    use crate::store::{DocumentBackend, MemoryBackend};
    use std::sync::atomic::AtomicBool;

    struct Fixture {
        verifier: PhoneVerifier,
        notifier: Arc<RecordingNotifier>,
        overlay: Arc<OverlayService>,
    }

    fn fixture(config: VerificationConfig) -> Fixture {
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
        let queue = Arc::new(KvQueue::new(
            kv as Arc<dyn KeyValueStore>,
            QueueConfig::default().dead_letter_cap,
        ));
        let audit = Arc::new(AuditSink::new(queue.clone() as Arc<dyn MutationQueue>));
        let overlay = Arc::new(OverlayService::new(
            cache.clone(),
            gateway.clone(),
            queue.clone() as Arc<dyn MutationQueue>,
            audit.clone(),
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let verifier = PhoneVerifier::new(
            cache,
            gateway,
            queue as Arc<dyn MutationQueue>,
            overlay.clone(),
            notifier.clone() as Arc<dyn CodeNotifier>,
            audit,
            config,
        );
        Fixture {
            verifier,
            notifier,
            overlay,
        }
    }

    fn phone() -> Telefone {
        Telefone {
            ddi: "55".to_string(),
            ddd: "21".to_string(),
            valor: "999887766".to_string(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_issue_then_confirm_promotes() {
        let f = fixture(VerificationConfig::default());
        let outcome = f.verifier.issue("111", &phone(), "111").await.unwrap();
        assert!(matches!(outcome, IssueOutcome::Issued { .. }));

        // Pending set, confirmed phone still absent.
        let overlay = f.overlay.current("111").await.unwrap();
        assert!(overlay.telefone_pendente.is_some());
        assert!(overlay.telefone.is_none());

        let code = f.notifier.last_code("111", "5521999887766").unwrap();
        f.verifier.confirm("111", &phone(), &code, "111").await.unwrap();

        let overlay = f.overlay.current("111").await.unwrap();
        assert!(overlay.telefone_pendente.is_none());
        assert_eq!(overlay.telefone.unwrap().valor, "999887766");
    }

    #[tokio::test]
    async fn test_second_issue_returns_pending_without_new_code() {
        let f = fixture(VerificationConfig::default());
        f.verifier.issue("111", &phone(), "111").await.unwrap();
        let outcome = f.verifier.issue("111", &phone(), "111").await.unwrap();

        assert!(matches!(outcome, IssueOutcome::AlreadyPending { .. }));
        assert_eq!(f.notifier.delivery_count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_codes_exhaust() {
        let f = fixture(VerificationConfig {
            max_attempts: 3,
            ..VerificationConfig::default()
        });
        f.verifier.issue("111", &phone(), "111").await.unwrap();
        let code = f.notifier.last_code("111", "5521999887766").unwrap();
        let wrong = if code == "000000" { "000001" } else { "000000" };

        let e1 = f.verifier.confirm("111", &phone(), wrong, "111").await.unwrap_err();
        assert!(matches!(e1, ServiceError::InvalidCode { attempts_left: 2 }));
        let e2 = f.verifier.confirm("111", &phone(), wrong, "111").await.unwrap_err();
        assert!(matches!(e2, ServiceError::InvalidCode { attempts_left: 1 }));
        let e3 = f.verifier.confirm("111", &phone(), wrong, "111").await.unwrap_err();
        assert!(matches!(e3, ServiceError::AttemptsExhausted));

        // The correct code is useless now.
        let e4 = f.verifier.confirm("111", &phone(), &code, "111").await.unwrap_err();
        assert!(matches!(e4, ServiceError::VerificationNotFound));
    }

    #[tokio::test]
    async fn test_confirm_twice_second_not_found() {
        let f = fixture(VerificationConfig::default());
        f.verifier.issue("111", &phone(), "111").await.unwrap();
        let code = f.notifier.last_code("111", "5521999887766").unwrap();

        f.verifier.confirm("111", &phone(), &code, "111").await.unwrap();
        let err = f.verifier.confirm("111", &phone(), &code, "111").await.unwrap_err();
        assert!(matches!(err, ServiceError::VerificationNotFound));
    }

    #[tokio::test]
    async fn test_rate_limit_budget() {
        let f = fixture(VerificationConfig {
            rate_budget: 2,
            ..VerificationConfig::default()
        });

        // Distinct numbers so the pending short-circuit does not kick in;
        // the budget is per CPF regardless.
        for i in 0..2 {
            let t = Telefone {
                valor: format!("99988776{i}"),
                ..phone()
            };
            f.verifier.issue("111", &t, "111").await.unwrap();
        }

        let t = Telefone {
            valor: "999887769".to_string(),
            ..phone()
        };
        let err = f.verifier.issue("111", &t, "111").await.unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_cancel_clears_pending() {
        let f = fixture(VerificationConfig::default());
        f.verifier.issue("111", &phone(), "111").await.unwrap();
        f.verifier.cancel("111", &phone(), "111").await.unwrap();

        let overlay = f.overlay.current("111").await.unwrap();
        assert!(overlay.telefone_pendente.is_none());

        // Nothing left to cancel.
        let err = f.verifier.cancel("111", &phone(), "111").await.unwrap_err();
        assert!(matches!(err, ServiceError::VerificationNotFound));
    }

    #[tokio::test]
    async fn test_expired_code_rejected() {
        let f = fixture(VerificationConfig {
            code_ttl_secs: 0,
            ..VerificationConfig::default()
        });
        f.verifier.issue("111", &phone(), "111").await.unwrap();
        let code = f.notifier.last_code("111", "5521999887766");

        // TTL zero: the cache entry is already gone or the doc is expired.
        let err = f
            .verifier
            .confirm("111", &phone(), code.as_deref().unwrap_or("000000"), "111")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::VerificationExpired | ServiceError::VerificationNotFound
        ));
    }
}
