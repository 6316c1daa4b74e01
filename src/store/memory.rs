//! In-memory `DocumentBackend` for tests and local development.
//!
//! Supports the full CAS contract, lazy expiry, an unavailability toggle for
//! degraded-mode tests, and per-collection read counters for cache-stampede
//! assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{Collection, DocumentBackend, StoreError, StoreResult, StoredDocument};

/// In-memory document store.
#[derive(Default)]
pub struct MemoryBackend {
    docs: Mutex<HashMap<(&'static str, String), StoredDocument>>,
    reads: Mutex<HashMap<&'static str, u64>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down; every operation fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many reads a collection has served. Test hook.
    pub fn reads(&self, collection: Collection) -> u64 {
        *self.reads.lock().get(collection.as_str()).unwrap_or(&0)
    }

    /// Directly seed a document, bypassing CAS. Test hook.
    pub fn seed(&self, collection: Collection, key: &str, doc: StoredDocument) {
        self.docs
            .lock()
            .insert((collection.as_str(), key.to_string()), doc);
    }

    /// How many live documents a collection holds. Test hook.
    pub fn count(&self, collection: Collection) -> usize {
        let now = Utc::now();
        self.docs
            .lock()
            .iter()
            .filter(|((name, _), doc)| {
                *name == collection.as_str() && doc.expires_at.map_or(true, |t| t > now)
            })
            .count()
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store unavailable (injected)".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<StoredDocument>> {
        self.check()?;
        *self.reads.lock().entry(collection.as_str()).or_insert(0) += 1;

        let now = Utc::now();
        let mut docs = self.docs.lock();
        let map_key = (collection.as_str(), key.to_string());
        if let Some(doc) = docs.get(&map_key) {
            if doc.expires_at.map_or(false, |t| t <= now) {
                docs.remove(&map_key);
                return Ok(None);
            }
            return Ok(Some(doc.clone()));
        }
        Ok(None)
    }

    async fn put(
        &self,
        collection: Collection,
        key: &str,
        doc: StoredDocument,
        expected_version: Option<i64>,
    ) -> StoreResult<()> {
        self.check()?;
        let now = Utc::now();
        let mut docs = self.docs.lock();
        let map_key = (collection.as_str(), key.to_string());

        if let Some(expected) = expected_version {
            let found = docs
                .get(&map_key)
                .filter(|d| d.expires_at.map_or(true, |t| t > now))
                .map_or(0, |d| d.version);
            if found != expected {
                return Err(StoreError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    found,
                });
            }
        }

        docs.insert(map_key, doc);
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Utc::now();
        let mut docs = self.docs.lock();
        let removed = docs.remove(&(collection.as_str(), key.to_string()));
        Ok(removed.map_or(false, |d| d.expires_at.map_or(true, |t| t > now)))
    }

    async fn ensure_indexes(&self) -> StoreResult<()> {
        self.check()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_cas_create_and_conflict() {
        let backend = MemoryBackend::new();

        // Create at version 1, expecting nothing stored.
        backend
            .put(
                Collection::SelfDeclared,
                "123",
                StoredDocument::new(1, json!({"v": 1})),
                Some(0),
            )
            .await
            .unwrap();

        // A second create against version 0 conflicts.
        let err = backend
            .put(
                Collection::SelfDeclared,
                "123",
                StoredDocument::new(1, json!({"v": 1})),
                Some(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { found: 1, .. }));

        // Updating from the stored version succeeds.
        backend
            .put(
                Collection::SelfDeclared,
                "123",
                StoredDocument::new(2, json!({"v": 2})),
                Some(1),
            )
            .await
            .unwrap();

        let doc = backend.get(Collection::SelfDeclared, "123").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_expired_documents_read_as_absent() {
        let backend = MemoryBackend::new();
        let doc = StoredDocument::new(0, json!({}))
            .with_expiry(Utc::now() - chrono::Duration::seconds(1));
        backend.seed(Collection::PhoneVerification, "k", doc);

        assert!(backend
            .get(Collection::PhoneVerification, "k")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unavailability() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        assert!(backend.ping().await.is_err());
        assert!(backend.get(Collection::Citizens, "1").await.is_err());
        backend.set_unavailable(false);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_read_counters() {
        let backend = MemoryBackend::new();
        let _ = backend.get(Collection::Citizens, "1").await;
        let _ = backend.get(Collection::Citizens, "1").await;
        assert_eq!(backend.reads(Collection::Citizens), 2);
    }
}
