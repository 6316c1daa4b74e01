//! Typed gateway over the document backend.
//!
//! Every operation takes the configured deadline and maps (de)serialization
//! onto `StoreError`. This is the only place documents cross between their
//! typed form and the stored JSON form.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::models::{
    AuditRecord, Citizen, PhoneCpfMapping, PhoneVerification, SelfDeclaredOverlay, UserConfig,
};

use super::{Collection, DocumentBackend, StoreError, StoreResult, StoredDocument};

/// Typed, deadline-bounded document-store operations.
pub struct StoreGateway {
    backend: Arc<dyn DocumentBackend>,
    op_timeout: Duration,
}

impl StoreGateway {
    pub fn new(backend: Arc<dyn DocumentBackend>, op_timeout: Duration) -> Self {
        Self {
            backend,
            op_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(op.to_string())),
        }
    }

    async fn load<T: DeserializeOwned>(
        &self,
        op: &'static str,
        collection: Collection,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let doc = self.bounded(op, self.backend.get(collection, key)).await?;
        doc.map(|d| serde_json::from_value(d.body).map_err(StoreError::from))
            .transpose()
    }

    fn encode<T: Serialize>(value: &T) -> StoreResult<serde_json::Value> {
        serde_json::to_value(value).map_err(StoreError::from)
    }

    /// Authoritative base record. Read-only to this service.
    #[instrument(skip(self))]
    pub async fn load_base(&self, cpf: &str) -> StoreResult<Option<Citizen>> {
        self.load("load_base", Collection::Citizens, cpf).await
    }

    #[instrument(skip(self))]
    pub async fn load_overlay(&self, cpf: &str) -> StoreResult<Option<SelfDeclaredOverlay>> {
        self.load("load_overlay", Collection::SelfDeclared, cpf).await
    }

    /// CAS upsert: succeeds only when the stored version is `expected_version`.
    #[instrument(skip(self, overlay), fields(version = overlay.version))]
    pub async fn upsert_overlay(
        &self,
        overlay: &SelfDeclaredOverlay,
        expected_version: i64,
    ) -> StoreResult<()> {
        let doc = StoredDocument::new(overlay.version, Self::encode(overlay)?);
        self.bounded(
            "upsert_overlay",
            self.backend
                .put(Collection::SelfDeclared, &overlay.cpf, doc, Some(expected_version)),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn load_user_config(&self, cpf: &str) -> StoreResult<Option<UserConfig>> {
        self.load("load_user_config", Collection::UserConfig, cpf).await
    }

    #[instrument(skip(self, config), fields(version = config.version))]
    pub async fn upsert_user_config(
        &self,
        config: &UserConfig,
        expected_version: i64,
    ) -> StoreResult<()> {
        let doc = StoredDocument::new(config.version, Self::encode(config)?);
        self.bounded(
            "upsert_user_config",
            self.backend
                .put(Collection::UserConfig, &config.cpf, doc, Some(expected_version)),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn load_phone_mapping(&self, telefone: &str) -> StoreResult<Option<PhoneCpfMapping>> {
        self.load("load_phone_mapping", Collection::PhoneMapping, telefone)
            .await
    }

    /// Idempotent by natural key (the phone number).
    #[instrument(skip(self, mapping))]
    pub async fn upsert_phone_mapping(&self, mapping: &PhoneCpfMapping) -> StoreResult<()> {
        let doc = StoredDocument::new(0, Self::encode(mapping)?);
        self.bounded(
            "upsert_phone_mapping",
            self.backend
                .put(Collection::PhoneMapping, &mapping.telefone, doc, None),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn load_verification(
        &self,
        cpf: &str,
        telefone: &str,
    ) -> StoreResult<Option<PhoneVerification>> {
        let key = PhoneVerification::key(cpf, telefone);
        self.load("load_verification", Collection::PhoneVerification, &key)
            .await
    }

    /// Idempotent by natural key (cpf, phone); carries the document TTL.
    #[instrument(skip(self, verification))]
    pub async fn create_verification(&self, verification: &PhoneVerification) -> StoreResult<()> {
        let key = PhoneVerification::key(&verification.cpf, &verification.telefone);
        let doc = StoredDocument::new(0, Self::encode(verification)?)
            .with_expiry(verification.expires_at);
        self.bounded(
            "create_verification",
            self.backend.put(Collection::PhoneVerification, &key, doc, None),
        )
        .await
    }

    /// Returns whether a live verification existed. Idempotent.
    #[instrument(skip(self))]
    pub async fn delete_verification(&self, cpf: &str, telefone: &str) -> StoreResult<bool> {
        let key = PhoneVerification::key(cpf, telefone);
        self.bounded(
            "delete_verification",
            self.backend.delete(Collection::PhoneVerification, &key),
        )
        .await
    }

    /// Append-only; keyed by record id.
    #[instrument(skip(self, record), fields(action = %record.action))]
    pub async fn append_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        let doc = StoredDocument::new(0, Self::encode(record)?);
        self.bounded(
            "append_audit",
            self.backend
                .put(Collection::AuditLogs, &record.id.to_string(), doc, None),
        )
        .await
    }

    pub async fn ensure_indexes(&self) -> StoreResult<()> {
        self.bounded("ensure_indexes", self.backend.ensure_indexes())
            .await
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.bounded("ping", self.backend.ping()).await
    }
}
