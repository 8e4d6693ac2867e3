//! Storage backend interface and an in-memory implementation
//!
//! The backend is an opaque async key-value store of serialized document
//! blobs keyed by document id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use worldforge_common::{DocumentId, DocumentKind, Error, Result};

/// A persisted document blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub kind: DocumentKind,
    pub blob: Bytes,
    /// Incremented on every update
    pub revision: u64,
}

/// Persistent document store
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch a document, `None` when it was never created
    async fn get_document(&self, id: &DocumentId) -> Result<Option<StoredDocument>>;

    /// Create a document; fails with `DocumentExists` if the id is taken
    async fn create_document(
        &self,
        id: &DocumentId,
        kind: DocumentKind,
        blob: Bytes,
    ) -> Result<StoredDocument>;

    /// Replace the blob of an existing document
    async fn update_document(&self, id: &DocumentId, blob: Bytes) -> Result<()>;

    /// Release resources; later calls fail
    async fn dispose(&self) -> Result<()>;
}

/// In-memory storage backend with call counters and failure injection
#[derive(Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<DocumentId, StoredDocument>>,
    get_calls: AtomicU64,
    create_calls: AtomicU64,
    update_calls: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    disposed: AtomicBool,
    read_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,
    updates_in_flight: AtomicU64,
    max_updates_in_flight: AtomicU64,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document directly, bypassing counters
    pub fn insert(&self, id: DocumentId, kind: DocumentKind, blob: impl Into<Bytes>) {
        let doc = StoredDocument {
            id: id.clone(),
            kind,
            blob: blob.into(),
            revision: 0,
        };
        self.documents.write().insert(id, doc);
    }

    /// Current stored state of a document
    pub fn stored(&self, id: &DocumentId) -> Option<StoredDocument> {
        self.documents.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Most updates ever running at once
    pub fn max_updates_in_flight(&self) -> u64 {
        self.max_updates_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every read, to widen race windows in tests
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every create/update
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn apply_update(&self, id: &DocumentId, blob: Bytes) -> Result<()> {
        self.check_open()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("injected update failure for {id}")));
        }

        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        doc.blob = blob;
        doc.revision += 1;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::storage("store closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_document(&self, id: &DocumentId) -> Result<Option<StoredDocument>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.read_delay_ms).await;
        self.check_open()?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("injected read failure for {id}")));
        }
        Ok(self.documents.read().get(id).cloned())
    }

    async fn create_document(
        &self,
        id: &DocumentId,
        kind: DocumentKind,
        blob: Bytes,
    ) -> Result<StoredDocument> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.write_delay_ms).await;
        self.check_open()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("injected create failure for {id}")));
        }

        let mut documents = self.documents.write();
        if documents.contains_key(id) {
            return Err(Error::DocumentExists(id.to_string()));
        }
        let doc = StoredDocument {
            id: id.clone(),
            kind,
            blob,
            revision: 1,
        };
        documents.insert(id.clone(), doc.clone());
        Ok(doc)
    }

    async fn update_document(&self, id: &DocumentId, blob: Bytes) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.updates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_updates_in_flight.fetch_max(running, Ordering::SeqCst);

        Self::pause(&self.write_delay_ms).await;
        let result = self.apply_update(id, blob);
        self.updates_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DocumentId {
        DocumentId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let storage = MemoryStorage::new();
        assert!(storage.get_document(&id("terrain")).await.unwrap().is_none());

        let created = storage
            .create_document(&id("terrain"), DocumentKind::Terrain, Bytes::from_static(b"v1"))
            .await
            .unwrap();
        assert_eq!(created.revision, 1);

        storage
            .update_document(&id("terrain"), Bytes::from_static(b"v2"))
            .await
            .unwrap();
        let stored = storage.stored(&id("terrain")).unwrap();
        assert_eq!(stored.blob.as_ref(), b"v2");
        assert_eq!(stored.revision, 2);
        assert_eq!(storage.create_calls(), 1);
        assert_eq!(storage.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_create_existing_and_update_missing() {
        let storage = MemoryStorage::new();
        storage.insert(id("layer:a"), DocumentKind::Layer, Bytes::new());

        let err = storage
            .create_document(&id("layer:a"), DocumentKind::Layer, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DocumentExists(_)));

        let err = storage
            .update_document(&id("layer:b"), Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_tracked() {
        let storage = MemoryStorage::new();
        storage.insert(id("layer:a"), DocumentKind::Layer, Bytes::new());
        storage.insert(id("layer:b"), DocumentKind::Layer, Bytes::new());
        storage.set_write_delay(Duration::from_millis(10));

        let (id_a, id_b) = (id("layer:a"), id("layer:b"));
        let (a, b) = tokio::join!(
            storage.update_document(&id_a, Bytes::from_static(b"a")),
            storage.update_document(&id_b, Bytes::from_static(b"b")),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(storage.max_updates_in_flight(), 2);

        // failed updates release their slot
        storage.update_document(&id("missing"), Bytes::new()).await.unwrap_err();
        storage.update_document(&id("layer:a"), Bytes::new()).await.unwrap();
        assert_eq!(storage.max_updates_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_and_dispose() {
        let storage = MemoryStorage::new();
        storage.set_fail_reads(true);
        assert!(storage.get_document(&id("x")).await.unwrap_err().is_retryable());
        storage.set_fail_reads(false);

        storage.dispose().await.unwrap();
        assert!(storage.is_disposed());
        assert!(storage.get_document(&id("x")).await.is_err());
    }
}
