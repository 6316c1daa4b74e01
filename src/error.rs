//! Service-wide error taxonomy.
//!
//! Subsystem errors (`KvError`, `StoreError`, `QueueError`) convert into
//! `ServiceError` via `From` impls. The API layer maps `ServiceError` onto
//! the HTTP status taxonomy; workers use `is_retryable`/`is_permanent` to
//! classify apply failures.

use std::time::Duration;

use thiserror::Error;

use crate::kv::KvError;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Top-level error type for the edge service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("verification is not pending")]
    VerificationNotFound,

    #[error("verification expired")]
    VerificationExpired,

    #[error("invalid verification code ({attempts_left} attempts left)")]
    InvalidCode { attempts_left: u32 },

    #[error("verification attempts exhausted")]
    AttemptsExhausted,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Whether the document store is the culprit and the read path should
    /// fall back to stale cache (503 when it cannot).
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            ServiceError::Store(StoreError::Unavailable(_)) | ServiceError::Store(StoreError::Timeout(_))
        )
    }

    /// Whether a worker should retry this failure with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Store(e) => e.is_retryable(),
            ServiceError::Kv(_) => true,
            ServiceError::Queue(QueueError::Kv(_)) => true,
            _ => false,
        }
    }

    /// Version conflicts are handled by rebase, outside the attempt cap.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::VersionConflict { .. }))
    }

    /// Whether a worker should route the mutation to the dead-letter list.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable() && !self.is_version_conflict()
    }
}
