//! Document constructors by kind tag

use std::collections::HashMap;
use std::sync::Arc;

use worldforge_common::{DocumentId, DocumentKind, Error, Result};

use crate::document::Document;
use crate::layer::LayerDocument;
use crate::terrain::TerrainDocument;

/// Builds an empty document of one kind
pub type DocumentConstructor = fn(DocumentId) -> Arc<dyn Document>;

/// Explicit mapping from kind tag to constructor, populated at startup
#[derive(Clone, Default)]
pub struct DocumentRegistry {
    constructors: HashMap<DocumentKind, DocumentConstructor>,
}

impl DocumentRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the terrain and layer documents
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DocumentKind::Terrain, TerrainDocument::constructor);
        registry.register(DocumentKind::Layer, LayerDocument::constructor);
        registry
    }

    /// Register (or replace) the constructor for `kind`
    pub fn register(&mut self, kind: DocumentKind, constructor: DocumentConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn contains(&self, kind: DocumentKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Construct an empty document of `kind`
    pub fn create(&self, id: DocumentId, kind: DocumentKind) -> Result<Arc<dyn Document>> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        let doc = constructor(id);
        if doc.kind() != kind {
            return Err(Error::internal(format!(
                "constructor registered for {kind} built a {} document",
                doc.kind()
            )));
        }
        Ok(doc)
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}
