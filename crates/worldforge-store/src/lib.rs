//! Worldforge Store - Persistent backends on redb
//!
//! This crate provides:
//! - `RedbDocumentStore`: the document storage backend
//! - `RedbArchive`: a landblock record archive

pub mod archive;
pub mod documents;
pub mod error;
mod tables;

pub use archive::RedbArchive;
pub use documents::RedbDocumentStore;
pub use error::{StoreError, StoreResult};

use std::sync::Arc;

use redb::Database;

/// Run a redb operation on the blocking pool
pub(crate) async fn run_blocking<T, F>(db: &Arc<Database>, op: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || op(&db))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
