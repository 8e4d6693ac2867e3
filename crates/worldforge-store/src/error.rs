//! Store error types

use worldforge_common::Error;

/// Error type for redb store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document already exists: {0}")]
    Exists(String),
    #[error("document not found: {0}")]
    Missing(String),
    #[error("store closed")]
    Closed,
    #[error("blocking task failed: {0}")]
    Task(String),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Map into the shared taxonomy as a document storage failure
    pub fn into_storage_error(self) -> Error {
        match self {
            Self::Exists(id) => Error::DocumentExists(id),
            Self::Missing(id) => Error::DocumentNotFound(id),
            other => Error::storage(other.to_string()),
        }
    }

    /// Map into the shared taxonomy as an asset archive failure
    pub fn into_archive_error(self) -> Error {
        Error::archive(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_keeps_not_found_and_exists() {
        assert!(matches!(
            StoreError::Exists("terrain".into()).into_storage_error(),
            Error::DocumentExists(_)
        ));
        assert!(
            StoreError::Missing("terrain".into())
                .into_storage_error()
                .is_not_found()
        );
        assert!(StoreError::Closed.into_storage_error().is_retryable());
        assert!(matches!(
            StoreError::Closed.into_archive_error(),
            Error::Archive(_)
        ));
    }
}
