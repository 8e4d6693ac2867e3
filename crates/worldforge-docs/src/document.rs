//! Document contract shared by every persisted document type
//!
//! A document owns its in-memory state behind its own lock, tracks unsaved
//! mutations with a [`ChangeTracker`], and produces a [`Projection`] (the
//! serialized byte form) for the storage backend.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bincode::Options;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use worldforge_common::{DocumentId, DocumentKind, Error, Result};

use crate::archive::AssetArchive;
use crate::base_cache::BaseCacheHandle;

/// Serialized document state together with the mutation version it reflects
#[derive(Clone, Debug)]
pub struct Projection {
    pub bytes: Bytes,
    pub version: u64,
}

/// Result of a successful export
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Landblock records written to the archive
    pub landblocks: usize,
}

/// Receiver of document-changed notifications
///
/// The payload is only the document id; the subscriber reads current state
/// itself when it needs it.
pub trait ChangeListener: Send + Sync {
    fn document_changed(&self, id: &DocumentId);
}

/// Mutation version tracking and the single change subscription of a document
///
/// A document is dirty while its mutation version is ahead of the last saved
/// version. Versions only move forward.
pub struct ChangeTracker {
    version: AtomicU64,
    saved: AtomicU64,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
}

impl ChangeTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            listener: RwLock::new(None),
        }
    }

    /// Current mutation version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Version of the last successful save
    pub fn saved_version(&self) -> u64 {
        self.saved.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.version() > self.saved_version()
    }

    /// Record a mutation. Call while holding the document's state lock.
    pub fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record that the state at `version` has been persisted
    pub fn mark_saved(&self, version: u64) {
        self.saved.fetch_max(version, Ordering::SeqCst);
    }

    /// Mark the current state as persisted (after a load)
    pub fn mark_clean(&self) {
        self.mark_saved(self.version());
    }

    /// Register the change subscriber, replacing any previous one
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Remove the change subscriber; returns whether one was registered
    pub fn unsubscribe(&self) -> bool {
        self.listener.write().take().is_some()
    }

    pub fn has_subscriber(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Notify the subscriber. Must not be called with the state lock held.
    pub fn notify(&self, id: &DocumentId) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.document_changed(id);
        }
    }
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared collaborators handed to documents during initialization
#[derive(Clone)]
pub struct DocumentContext {
    pub archive: Arc<dyn AssetArchive>,
    pub base_cache: BaseCacheHandle,
}

impl DocumentContext {
    pub fn new(archive: Arc<dyn AssetArchive>, base_cache: BaseCacheHandle) -> Self {
        Self {
            archive,
            base_cache,
        }
    }
}

/// A unit of persistence managed by the document manager
#[async_trait]
pub trait Document: Send + Sync + 'static {
    fn id(&self) -> &DocumentId;

    fn kind(&self) -> DocumentKind;

    fn tracker(&self) -> &ChangeTracker;

    /// Serialize the current state
    fn projection(&self) -> Result<Projection>;

    /// Replace the state from a persisted projection.
    ///
    /// Undecodable input is logged and yields a fresh, empty state.
    fn load_projection(&self, bytes: &[u8]);

    /// Prepare a brand-new document from the asset archive
    async fn initialize(&self, ctx: &DocumentContext) -> Result<()>;

    /// Hook run after a persisted projection has been loaded
    async fn on_loaded(&self, _ctx: &DocumentContext) -> Result<()> {
        Ok(())
    }

    /// Write the document back into the asset archive
    async fn export(&self, archive: &dyn AssetArchive, iteration: u32) -> Result<ExportSummary>;

    /// Upcast for typed retrieval after the kind tag has been checked
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn is_dirty(&self) -> bool {
        self.tracker().is_dirty()
    }
}

/// A concrete document type known at compile time
pub trait DocumentType: Document + Sized {
    const KIND: DocumentKind;

    fn create(id: DocumentId) -> Self;
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode a projection payload
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    codec()
        .serialize(value)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a projection payload; the whole input must be consumed
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    codec()
        .deserialize(bytes)
        .map_err(|e| Error::Deserialization(e.to_string()))
}
