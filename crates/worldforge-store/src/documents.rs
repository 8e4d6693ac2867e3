//! Persistent document store backed by redb.
//!
//! One table maps document id to a bincode `DocumentRecord`. Every call is a
//! single read or write transaction run on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use worldforge_common::{DocumentId, DocumentKind, Result};
use worldforge_docs::{StorageBackend, StoredDocument};

use crate::error::{StoreError, StoreResult};
use crate::{run_blocking, tables};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRecord {
    kind: DocumentKind,
    blob: Vec<u8>,
    revision: u64,
}

fn read_record(db: &Database, id: &str) -> StoreResult<Option<DocumentRecord>> {
    let rtx = db.begin_read()?;
    let table = rtx.open_table(tables::DOCUMENTS)?;
    match table.get(id)? {
        Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
        None => Ok(None),
    }
}

fn insert_record(db: &Database, id: &str, record: &DocumentRecord) -> StoreResult<()> {
    let bytes = bincode::serialize(record)?;
    let wtx = db.begin_write()?;
    {
        let mut table = wtx.open_table(tables::DOCUMENTS)?;
        if table.get(id)?.is_some() {
            return Err(StoreError::Exists(id.to_string()));
        }
        table.insert(id, bytes.as_slice())?;
    }
    wtx.commit()?;
    Ok(())
}

fn replace_blob(db: &Database, id: &str, blob: Vec<u8>) -> StoreResult<u64> {
    let wtx = db.begin_write()?;
    let revision = {
        let mut table = wtx.open_table(tables::DOCUMENTS)?;
        let mut record: DocumentRecord = match table.get(id)? {
            Some(value) => bincode::deserialize(value.value())?,
            None => return Err(StoreError::Missing(id.to_string())),
        };
        record.blob = blob;
        record.revision += 1;
        let bytes = bincode::serialize(&record)?;
        table.insert(id, bytes.as_slice())?;
        record.revision
    };
    wtx.commit()?;
    Ok(revision)
}

/// Document storage backend persisted in a redb file
pub struct RedbDocumentStore {
    db: Arc<Database>,
    path: PathBuf,
    closed: AtomicBool,
}

impl RedbDocumentStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let wtx = db.begin_write()?;
        wtx.open_table(tables::DOCUMENTS)?;
        wtx.commit()?;

        info!("Opened document store at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ids and kinds of every stored document
    pub fn list(&self) -> StoreResult<Vec<(String, DocumentKind, u64)>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(tables::DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let record: DocumentRecord = bincode::deserialize(value.value())?;
            result.push((key.value().to_string(), record.kind, record.revision));
        }
        Ok(result)
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RedbDocumentStore {
    async fn get_document(&self, id: &DocumentId) -> Result<Option<StoredDocument>> {
        self.check_open().map_err(StoreError::into_storage_error)?;
        let key = id.to_string();
        let record = run_blocking(&self.db, move |db| read_record(db, &key))
            .await
            .map_err(StoreError::into_storage_error)?;
        Ok(record.map(|record| StoredDocument {
            id: id.clone(),
            kind: record.kind,
            blob: Bytes::from(record.blob),
            revision: record.revision,
        }))
    }

    async fn create_document(
        &self,
        id: &DocumentId,
        kind: DocumentKind,
        blob: Bytes,
    ) -> Result<StoredDocument> {
        self.check_open().map_err(StoreError::into_storage_error)?;
        let record = DocumentRecord {
            kind,
            blob: blob.to_vec(),
            revision: 1,
        };
        let key = id.to_string();
        run_blocking(&self.db, move |db| insert_record(db, &key, &record))
            .await
            .map_err(StoreError::into_storage_error)?;
        debug!("Created {kind} document {id} ({} bytes)", blob.len());
        Ok(StoredDocument {
            id: id.clone(),
            kind,
            blob,
            revision: 1,
        })
    }

    async fn update_document(&self, id: &DocumentId, blob: Bytes) -> Result<()> {
        self.check_open().map_err(StoreError::into_storage_error)?;
        let key = id.to_string();
        let len = blob.len();
        let revision = run_blocking(&self.db, move |db| replace_blob(db, &key, blob.to_vec()))
            .await
            .map_err(StoreError::into_storage_error)?;
        debug!("Updated document {id} to revision {revision} ({len} bytes)");
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closed document store at {}", self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldforge_common::Error;

    fn id(s: &str) -> DocumentId {
        DocumentId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_get_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbDocumentStore::open(dir.path().join("docs.redb")).unwrap();

        assert!(store.get_document(&id("terrain")).await.unwrap().is_none());
        let created = store
            .create_document(&id("terrain"), DocumentKind::Terrain, Bytes::from_static(b"v1"))
            .await
            .unwrap();
        assert_eq!(created.revision, 1);

        store
            .update_document(&id("terrain"), Bytes::from_static(b"v2"))
            .await
            .unwrap();
        let stored = store.get_document(&id("terrain")).await.unwrap().unwrap();
        assert_eq!(stored.kind, DocumentKind::Terrain);
        assert_eq!(stored.blob.as_ref(), b"v2");
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn test_create_existing_and_update_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbDocumentStore::open(dir.path().join("docs.redb")).unwrap();
        store
            .create_document(&id("layer:a"), DocumentKind::Layer, Bytes::new())
            .await
            .unwrap();

        let err = store
            .create_document(&id("layer:a"), DocumentKind::Layer, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DocumentExists(_)));

        let err = store
            .update_document(&id("layer:b"), Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("docs.redb");
        {
            let store = RedbDocumentStore::open(&path).unwrap();
            store
                .create_document(&id("layer:a"), DocumentKind::Layer, Bytes::from_static(b"abc"))
                .await
                .unwrap();
        }

        let store = RedbDocumentStore::open(&path).unwrap();
        let stored = store.get_document(&id("layer:a")).await.unwrap().unwrap();
        assert_eq!(stored.blob.as_ref(), b"abc");
        assert_eq!(
            store.list().unwrap(),
            vec![("layer:a".to_string(), DocumentKind::Layer, 1)]
        );
    }

    #[tokio::test]
    async fn test_dispose_closes_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbDocumentStore::open(dir.path().join("docs.redb")).unwrap();
        store.dispose().await.unwrap();
        store.dispose().await.unwrap();

        let err = store.get_document(&id("terrain")).await.unwrap_err();
        assert_eq!(err.to_string(), "storage error: store closed");
        assert!(
            store
                .update_document(&id("terrain"), Bytes::new())
                .await
                .is_err()
        );
    }
}
