//! Document store access.
//!
//! This module provides:
//! - The `DocumentBackend` contract: point get, CAS upsert, delete, health
//! - A Postgres implementation storing JSONB documents per collection
//! - An in-memory implementation with failure injection for tests
//! - `StoreGateway`: typed operations with per-call deadlines

pub mod gateway;
pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use gateway::StoreGateway;
pub use memory::MemoryBackend;
pub use sql::SqlBackend;

/// Store errors, classified for the worker retry policy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: i64,
        found: i64,
    },

    #[error("store rejected document: {0}")]
    SchemaReject(String),

    #[error("store permission denied: {0}")]
    Permission(String),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Retryable with backoff; everything else is either a rebase
    /// (`VersionConflict`) or permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Named collections this service reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Citizens,
    SelfDeclared,
    UserConfig,
    PhoneMapping,
    PhoneVerification,
    AuditLogs,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Citizens => "citizens",
            Collection::SelfDeclared => "self_declared",
            Collection::UserConfig => "user_config",
            Collection::PhoneMapping => "phone_mapping",
            Collection::PhoneVerification => "phone_verification",
            Collection::AuditLogs => "audit_logs",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned document as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub version: i64,
    pub body: serde_json::Value,
    /// Passed-through TTL; expired documents read as absent.
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredDocument {
    pub fn new(version: i64, body: serde_json::Value) -> Self {
        Self {
            version,
            body,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Point operations over an opaque document store.
///
/// `put` semantics: `expected_version = None` upserts unconditionally
/// (idempotent by natural key); `Some(v)` succeeds only when the stored
/// version equals `v` (`0` meaning "must not exist yet").
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<StoredDocument>>;

    async fn put(
        &self,
        collection: Collection,
        key: &str,
        doc: StoredDocument,
        expected_version: Option<i64>,
    ) -> StoreResult<()>;

    /// Delete; returns whether a live document existed.
    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool>;

    /// Create collections/indexes at startup.
    async fn ensure_indexes(&self) -> StoreResult<()>;

    /// Cheap health probe for the degraded-mode controller.
    async fn ping(&self) -> StoreResult<()>;
}
