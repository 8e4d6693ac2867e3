//! Worldforge Docs - Document model, caching and persistence
//!
//! This crate provides:
//! - The document contract and change tracking
//! - Terrain documents layered over a shared base cache, with edge sync
//! - Sparse layer documents with per-cell field masks
//! - The document manager: identity cache and batched saves
//! - Storage and asset archive traits with in-memory implementations

pub mod archive;
pub mod backend;
pub mod base_cache;
pub mod document;
pub mod edge_sync;
pub mod layer;
pub mod manager;
pub mod registry;
pub mod terrain;

pub use archive::{AssetArchive, LandblockRecord, MemoryArchive, TerrainInfo, landblock_record_id};
pub use backend::{MemoryStorage, StorageBackend, StoredDocument};
pub use base_cache::{BaseCache, BaseCacheHandle, BuildReport};
pub use document::{
    ChangeListener, ChangeTracker, Document, DocumentContext, DocumentType, ExportSummary,
    Projection,
};
pub use edge_sync::{ChangeSet, TerrainUpdate};
pub use layer::LayerDocument;
pub use manager::{DocumentManager, FlushReport, ManagerStats};
pub use registry::{DocumentConstructor, DocumentRegistry};
pub use terrain::TerrainDocument;
