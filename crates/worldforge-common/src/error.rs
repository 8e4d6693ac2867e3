//! Error types for Worldforge
//!
//! This module defines the common error types used throughout the system.

use crate::types::{DocumentKind, LandblockKey};
use thiserror::Error;

/// Common result type for Worldforge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Worldforge
#[derive(Debug, Error)]
pub enum Error {
    // Identity errors
    #[error("document {id} is open as {actual}, requested as {expected}")]
    IdentityConflict {
        id: String,
        expected: DocumentKind,
        actual: DocumentKind,
    },

    #[error("document not available: {id}: {reason}")]
    Unavailable { id: String, reason: String },

    #[error("unknown document kind: {0}")]
    UnknownKind(String),

    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),

    // Terrain errors
    #[error("landblock not found: {0}")]
    LandblockNotFound(LandblockKey),

    #[error("invalid cell index: {0} (expected 0..81)")]
    InvalidCellIndex(usize),

    #[error("invalid landblock key: {0}")]
    InvalidLandblockKey(String),

    // Backend errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("document not found in storage: {0}")]
    DocumentNotFound(String),

    #[error("document already exists in storage: {0}")]
    DocumentExists(String),

    #[error("asset archive error: {0}")]
    Archive(String),

    #[error("archive record not found: {0:#010x}")]
    RecordNotFound(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timeout")]
    Timeout,

    // Lifecycle errors
    #[error("document manager is shutting down")]
    ShuttingDown,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Wrap a load/create failure as "not available" for the caller.
    pub fn unavailable(id: impl Into<String>, source: &Self) -> Self {
        Self::Unavailable {
            id: id.into(),
            reason: source.to_string(),
        }
    }

    /// Check if this is a retryable error
    ///
    /// Identity conflicts and validation failures are programmer errors and
    /// never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Storage(_) | Self::Archive(_) | Self::Io(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::LandblockNotFound(_) | Self::DocumentNotFound(_) | Self::RecordNotFound(_)
        )
    }
}
