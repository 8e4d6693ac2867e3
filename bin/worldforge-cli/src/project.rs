//! Opening a project: backends, base cache and the document manager

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::info;

use worldforge_common::{Config, DocumentId};
use worldforge_docs::{
    AssetArchive, BaseCacheHandle, DocumentContext, DocumentManager, DocumentRegistry,
    MemoryArchive, MemoryStorage, StorageBackend,
};
use worldforge_store::{RedbArchive, RedbDocumentStore};

/// Landblocks per side of the world used by `--in-memory`
const SCRATCH_EXTENT: u8 = 8;

/// Id of the authoritative terrain document
pub fn terrain_id() -> Result<DocumentId> {
    Ok(DocumentId::new("terrain")?)
}

/// Id of a named layer document
pub fn layer_id(name: &str) -> Result<DocumentId> {
    DocumentId::new(format!("layer:{name}")).context("invalid layer name")
}

enum Backends {
    Redb {
        archive: Arc<RedbArchive>,
        documents: Arc<RedbDocumentStore>,
    },
    Memory {
        archive: Arc<MemoryArchive>,
        documents: Arc<MemoryStorage>,
    },
}

pub struct Project {
    pub config: Config,
    backends: Backends,
    base_cache: BaseCacheHandle,
}

impl Project {
    pub fn open(config: Config, in_memory: bool) -> Result<Self> {
        let (backends, base_cache) = if in_memory {
            info!("Using an in-memory {SCRATCH_EXTENT}x{SCRATCH_EXTENT} scratch world");
            (
                Backends::Memory {
                    archive: Arc::new(MemoryArchive::flat(SCRATCH_EXTENT, 0)),
                    documents: Arc::new(MemoryStorage::new()),
                },
                BaseCacheHandle::in_memory(&config.terrain),
            )
        } else {
            let data_dir = &config.project.data_dir;
            let archive = RedbArchive::open(data_dir.join("archive.redb"))
                .context("failed to open asset archive")?;
            let documents = RedbDocumentStore::open(data_dir.join("documents.redb"))
                .context("failed to open document store")?;
            (
                Backends::Redb {
                    archive: Arc::new(archive),
                    documents: Arc::new(documents),
                },
                BaseCacheHandle::new(&config.project.cache_dir, &config.terrain),
            )
        };
        Ok(Self {
            config,
            backends,
            base_cache,
        })
    }

    pub fn archive(&self) -> Arc<dyn AssetArchive> {
        match &self.backends {
            Backends::Redb { archive, .. } => archive.clone(),
            Backends::Memory { archive, .. } => archive.clone(),
        }
    }

    fn storage(&self) -> Arc<dyn StorageBackend> {
        match &self.backends {
            Backends::Redb { documents, .. } => documents.clone(),
            Backends::Memory { documents, .. } => documents.clone(),
        }
    }

    /// The persistent archive, for commands that only make sense on disk
    pub fn redb_archive(&self) -> Result<&RedbArchive> {
        match &self.backends {
            Backends::Redb { archive, .. } => Ok(archive),
            Backends::Memory { .. } => bail!("this command needs a persistent project"),
        }
    }

    pub fn redb_documents(&self) -> Result<&RedbDocumentStore> {
        match &self.backends {
            Backends::Redb { documents, .. } => Ok(documents),
            Backends::Memory { .. } => bail!("this command needs a persistent project"),
        }
    }

    pub fn base_cache(&self) -> &BaseCacheHandle {
        &self.base_cache
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.base_cache.snapshot_path().map(PathBuf::from)
    }

    /// Start a document manager over this project's backends
    pub fn manager(&self) -> Result<DocumentManager> {
        let context = DocumentContext::new(self.archive(), self.base_cache.clone());
        let manager = DocumentManager::new(
            self.storage(),
            context,
            DocumentRegistry::with_defaults(),
            self.config.manager.clone(),
        )?;
        Ok(manager)
    }
}
