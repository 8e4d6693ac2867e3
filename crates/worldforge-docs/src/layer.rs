//! Sparse, stackable terrain layers
//!
//! A layer stores only the cells it has authored. A cell whose packed value
//! is the default (zero) has no entry, and a landblock with no cells has no
//! entry either. Per-cell field masks record which of the four fields the
//! layer has explicitly set, for compositing with other layers.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use worldforge_common::{
    CELLS_PER_LANDBLOCK, Direction, DocumentId, DocumentKind, Error, FieldMask, LandblockCells,
    LandblockKey, Result, TerrainField, check_cell_index, packed_field, replace_field,
};

use crate::archive::AssetArchive;
use crate::document::{
    ChangeTracker, Document, DocumentContext, DocumentType, ExportSummary, Projection, decode,
    encode,
};
use crate::edge_sync::{ChangeSet, TerrainUpdate, derive_neighbor_changes, merge_changes};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

type SparseCells = BTreeMap<u8, u32>;
type SparseMasks = BTreeMap<u8, FieldMask>;

/// Persisted form of a layer
#[derive(Debug, Default, Serialize, Deserialize)]
struct LayerPayload {
    cells: Vec<(u16, Vec<(u8, u32)>)>,
    masks: Vec<(u16, Vec<(u8, u8)>)>,
}

/// Older persisted form, written before field masks existed
#[derive(Debug, Deserialize)]
struct LegacyLayerPayload {
    cells: Vec<(u16, Vec<(u8, u32)>)>,
}

#[derive(Default)]
struct LayerState {
    cells: HashMap<LandblockKey, SparseCells>,
    masks: HashMap<LandblockKey, SparseMasks>,
}

impl LayerState {
    fn value(&self, key: LandblockKey, index: u8) -> u32 {
        self.cells
            .get(&key)
            .and_then(|cells| cells.get(&index))
            .copied()
            .unwrap_or(0)
    }

    /// Neighbour value for edge sync: only landblocks this layer already holds take part
    fn sync_value(&self, key: LandblockKey, index: usize) -> Option<u32> {
        let cells = self.cells.get(&key)?;
        if cells.is_empty() {
            warn!("Layer landblock {key} is present with no cells; treating it as default");
        }
        Some(cells.get(&(index as u8)).copied().unwrap_or(0))
    }

    fn mask(&self, key: LandblockKey, index: u8) -> FieldMask {
        self.masks
            .get(&key)
            .and_then(|masks| masks.get(&index))
            .copied()
            .unwrap_or_default()
    }

    /// Direct write: the bits of `fields` follow the written bytes
    fn write(&mut self, key: LandblockKey, index: u8, value: u32, fields: &[TerrainField]) {
        let mut mask = self.mask(key, index);
        for &field in fields {
            if packed_field(value, field) == field.default_value() {
                mask.remove(field);
            } else {
                mask.insert(field);
            }
        }
        self.store(key, index, value, mask);
    }

    fn store(&mut self, key: LandblockKey, index: u8, value: u32, mask: FieldMask) {
        if value == 0 {
            if let Some(cells) = self.cells.get_mut(&key) {
                cells.remove(&index);
            }
            if let Some(masks) = self.masks.get_mut(&key) {
                masks.remove(&index);
            }
        } else {
            self.cells.entry(key).or_default().insert(index, value);
            let masks = self.masks.entry(key).or_default();
            if mask.is_empty() {
                masks.remove(&index);
            } else {
                masks.insert(index, mask);
            }
        }

        if self.cells.get(&key).is_none_or(BTreeMap::is_empty) {
            self.cells.remove(&key);
            self.masks.remove(&key);
        } else if self.masks.get(&key).is_some_and(BTreeMap::is_empty) {
            self.masks.remove(&key);
        }
    }

    /// Combined mask of the directly written vertices mirrored at `(neighbor, dst)`
    fn source_mask(&self, direct: &ChangeSet, neighbor: LandblockKey, dst: usize) -> FieldMask {
        let mut mask = FieldMask::NONE;
        for (&key, written) in direct {
            for direction in Direction::ALL {
                if key.neighbor(direction) != Some(neighbor) {
                    continue;
                }
                for (src, shared) in direction.shared_vertices() {
                    if shared == dst && written.contains_key(&(src as u8)) {
                        for field in self.mask(key, src as u8).fields() {
                            mask.insert(field);
                        }
                    }
                }
            }
        }
        mask
    }

    fn from_payload(payload: LayerPayload) -> Self {
        let mut state = Self::default();
        for (raw, cells) in payload.cells {
            let cells: SparseCells = cells.into_iter().filter(|(_, v)| *v != 0).collect();
            if !cells.is_empty() {
                state.cells.insert(LandblockKey::from_raw(raw), cells);
            }
        }
        for (raw, masks) in payload.masks {
            let key = LandblockKey::from_raw(raw);
            let Some(cells) = state.cells.get(&key) else {
                continue;
            };
            let masks: SparseMasks = masks
                .into_iter()
                .filter(|(index, _)| cells.contains_key(index))
                .map(|(index, bits)| (index, FieldMask::from_bits(bits)))
                .filter(|(_, mask)| !mask.is_empty())
                .collect();
            if !masks.is_empty() {
                state.masks.insert(key, masks);
            }
        }
        state
    }

    fn to_payload(&self) -> LayerPayload {
        let mut cells: Vec<_> = self
            .cells
            .iter()
            .map(|(key, cells)| (key.raw(), cells.iter().map(|(i, v)| (*i, *v)).collect()))
            .collect();
        cells.sort_unstable_by_key(|(raw, _)| *raw);
        let mut masks: Vec<_> = self
            .masks
            .iter()
            .map(|(key, masks)| (key.raw(), masks.iter().map(|(i, m)| (*i, m.bits())).collect()))
            .collect();
        masks.sort_unstable_by_key(|(raw, _)| *raw);
        LayerPayload { cells, masks }
    }

    /// Mark every stored cell as fully authored
    fn synthesize_masks(&mut self) -> usize {
        let mut count = 0;
        for (key, cells) in &self.cells {
            let masks: SparseMasks = cells.keys().map(|i| (*i, FieldMask::ALL)).collect();
            count += masks.len();
            self.masks.insert(*key, masks);
        }
        count
    }
}

/// Non-destructive sparse overlay with per-field authorship
pub struct LayerDocument {
    id: DocumentId,
    tracker: ChangeTracker,
    state: Mutex<LayerState>,
    updates: broadcast::Sender<TerrainUpdate>,
}

impl LayerDocument {
    pub fn new(id: DocumentId) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            id,
            tracker: ChangeTracker::new(),
            state: Mutex::new(LayerState::default()),
            updates,
        }
    }

    /// Registry constructor
    pub fn constructor(id: DocumentId) -> Arc<dyn Document> {
        Arc::new(Self::new(id))
    }

    /// Full landblock with defaults where the layer has nothing
    pub fn get_landblock(&self, key: LandblockKey) -> LandblockCells {
        let mut cells = [0u32; CELLS_PER_LANDBLOCK];
        if let Some(sparse) = self.state.lock().cells.get(&key) {
            for (&index, &value) in sparse {
                cells[usize::from(index)] = value;
            }
        }
        cells
    }

    pub fn get_cell(&self, key: LandblockKey, index: usize) -> Result<u32> {
        let index = check_cell_index(index)?;
        Ok(self.state.lock().value(key, index))
    }

    /// Authored fields of one cell
    pub fn field_mask(&self, key: LandblockKey, index: usize) -> Result<FieldMask> {
        let index = check_cell_index(index)?;
        Ok(self.state.lock().mask(key, index))
    }

    /// Stored cells of one landblock
    pub fn sparse_cells(&self, key: LandblockKey) -> BTreeMap<u8, u32> {
        self.state.lock().cells.get(&key).cloned().unwrap_or_default()
    }

    /// Landblocks holding at least one cell, ascending
    pub fn landblock_keys(&self) -> Vec<LandblockKey> {
        let mut keys: Vec<_> = self.state.lock().cells.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Total stored cells
    pub fn cell_count(&self) -> usize {
        self.state.lock().cells.values().map(BTreeMap::len).sum()
    }

    /// Write a whole packed value; all four fields count as written
    pub fn set_cell(&self, key: LandblockKey, index: usize, value: u32) -> Result<TerrainUpdate> {
        self.update_cells(None, &[(key, index, value)])
    }

    /// Write one field of one cell
    pub fn set_field(
        &self,
        key: LandblockKey,
        index: usize,
        field: TerrainField,
        byte: u8,
    ) -> Result<TerrainUpdate> {
        let index = check_cell_index(index)?;
        check_key(key)?;
        self.transact(Some(field), |state| {
            let value = replace_field(state.value(key, index), field, byte);
            Ok(ChangeSet::from([(key, BTreeMap::from([(index, value)]))]))
        })
    }

    /// Write packed values in one transaction. `field` names the field the
    /// values were produced for, or `None` when every field was written.
    pub fn update_cells(
        &self,
        field: Option<TerrainField>,
        writes: &[(LandblockKey, usize, u32)],
    ) -> Result<TerrainUpdate> {
        let mut direct = ChangeSet::new();
        for &(key, index, value) in writes {
            let index = check_cell_index(index)?;
            check_key(key)?;
            direct.entry(key).or_default().insert(index, value);
        }
        self.transact(field, move |_| Ok(direct))
    }

    fn transact<F>(&self, field: Option<TerrainField>, build: F) -> Result<TerrainUpdate>
    where
        F: FnOnce(&LayerState) -> Result<ChangeSet>,
    {
        let fields: &[TerrainField] = match &field {
            Some(field) => std::slice::from_ref(field),
            None => &TerrainField::ALL,
        };

        let update = {
            let mut state = self.state.lock();
            let direct = build(&*state)?;
            if direct.is_empty() {
                return Ok(TerrainUpdate {
                    field,
                    changes: ChangeSet::new(),
                });
            }

            let mut post = BTreeMap::new();
            for (&key, cells) in &direct {
                let mut cells_after = [0u32; CELLS_PER_LANDBLOCK];
                if let Some(sparse) = state.cells.get(&key) {
                    for (&index, &value) in sparse {
                        cells_after[usize::from(index)] = value;
                    }
                }
                for (&index, &value) in cells {
                    cells_after[usize::from(index)] = value;
                }
                post.insert(key, cells_after);
            }

            let derived = derive_neighbor_changes(&direct, &post, |k, i| state.sync_value(k, i));
            for (&key, cells) in &direct {
                for (&index, &value) in cells {
                    state.write(key, index, value, fields);
                }
            }
            // a mirrored vertex carries the authorship of the vertex it mirrors
            for (&key, cells) in &derived {
                for (&index, &value) in cells {
                    let mask = state.source_mask(&direct, key, usize::from(index));
                    state.store(key, index, value, mask);
                }
            }
            let changes = merge_changes(direct, derived);
            self.tracker.bump();
            TerrainUpdate { field, changes }
        };

        debug!(
            "Layer {} updated {} cells across {} landblocks",
            self.id,
            update.len(),
            update.changes.len()
        );
        self.tracker.notify(&self.id);
        // no receivers is fine
        let _ = self.updates.send(update.clone());
        Ok(update)
    }

    /// Receive every applied update
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TerrainUpdate> {
        self.updates.subscribe()
    }

    fn decode_state(&self, bytes: &[u8]) -> Result<LayerState> {
        if let Ok(payload) = decode::<LayerPayload>(bytes) {
            return Ok(LayerState::from_payload(payload));
        }
        let legacy: LegacyLayerPayload = decode(bytes)?;
        debug!("Layer {} projection uses the format without field masks", self.id);
        Ok(LayerState::from_payload(LayerPayload {
            cells: legacy.cells,
            masks: Vec::new(),
        }))
    }
}

fn check_key(key: LandblockKey) -> Result<()> {
    if key.in_grid() {
        Ok(())
    } else {
        Err(Error::LandblockNotFound(key))
    }
}

#[async_trait]
impl Document for LayerDocument {
    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Layer
    }

    fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    fn projection(&self) -> Result<Projection> {
        let state = self.state.lock();
        let bytes = encode(&state.to_payload())?;
        Ok(Projection {
            bytes: Bytes::from(bytes),
            version: self.tracker.version(),
        })
    }

    fn load_projection(&self, bytes: &[u8]) {
        let mut loaded = match self.decode_state(bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!("Discarding corrupt layer projection for {}: {e}", self.id);
                LayerState::default()
            }
        };
        if loaded.masks.is_empty() && !loaded.cells.is_empty() {
            let migrated = loaded.synthesize_masks();
            info!("Layer {}: synthesized field masks for {migrated} cells", self.id);
        }
        *self.state.lock() = loaded;
    }

    async fn initialize(&self, _ctx: &DocumentContext) -> Result<()> {
        // layers start empty and never read the base terrain
        Ok(())
    }

    async fn export(&self, _archive: &dyn AssetArchive, _iteration: u32) -> Result<ExportSummary> {
        Err(Error::unsupported(format!(
            "layer {} cannot be exported directly; composite it into terrain first",
            self.id
        )))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl DocumentType for LayerDocument {
    const KIND: DocumentKind = DocumentKind::Layer;

    fn create(id: DocumentId) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use worldforge_common::{cell_index, pack};

    fn layer() -> LayerDocument {
        LayerDocument::new(DocumentId::new("layer:roads").unwrap())
    }

    #[test]
    fn test_empty_layer_reads_defaults() {
        let doc = layer();
        assert_eq!(doc.get_landblock(LandblockKey::new(3, 3)), [0; 81]);
        assert_eq!(doc.cell_count(), 0);
        assert!(doc.get_cell(LandblockKey::new(3, 3), 81).is_err());
    }

    #[test]
    fn test_sparsity_preserved() {
        let doc = layer();
        let key = LandblockKey::new(3, 3);

        doc.set_cell(key, 40, pack(1, 0, 0, 0)).unwrap();
        assert_eq!(doc.landblock_keys(), vec![key]);
        assert_eq!(doc.sparse_cells(key), BTreeMap::from([(40, 1)]));

        doc.set_cell(key, 40, 0).unwrap();
        assert!(doc.sparse_cells(key).is_empty());
        assert!(doc.landblock_keys().is_empty());
        assert!(doc.field_mask(key, 40).unwrap().is_empty());

        doc.set_cell(key, 40, pack(0, 0, 0, 9)).unwrap();
        assert_eq!(doc.landblock_keys(), vec![key]);
        assert_eq!(doc.get_cell(key, 40).unwrap(), pack(0, 0, 0, 9));
    }

    #[test]
    fn test_last_cell_removes_landblock() {
        let doc = layer();
        let key = LandblockKey::new(3, 3);
        doc.set_cell(key, 10, 5).unwrap();
        doc.set_cell(key, 11, 6).unwrap();

        doc.set_cell(key, 10, 0).unwrap();
        assert_eq!(doc.landblock_keys(), vec![key]);
        doc.set_cell(key, 11, 0).unwrap();
        assert!(doc.landblock_keys().is_empty());
        assert_eq!(doc.cell_count(), 0);
    }

    #[test]
    fn test_field_masks_follow_written_fields() {
        let doc = layer();
        let key = LandblockKey::new(2, 2);

        doc.set_field(key, 40, TerrainField::Road, 3).unwrap();
        assert_eq!(doc.field_mask(key, 40).unwrap(), TerrainField::Road.mask());

        doc.set_field(key, 40, TerrainField::Height, 50).unwrap();
        assert_eq!(doc.field_mask(key, 40).unwrap().bits(), 0x9);
        assert_eq!(doc.get_cell(key, 40).unwrap(), pack(3, 0, 0, 50));

        // clearing one field keeps the cell and the other bit
        doc.set_field(key, 40, TerrainField::Road, 0).unwrap();
        assert_eq!(doc.field_mask(key, 40).unwrap(), TerrainField::Height.mask());
        assert_eq!(doc.get_cell(key, 40).unwrap(), pack(0, 0, 0, 50));

        doc.set_field(key, 40, TerrainField::Height, 0).unwrap();
        assert!(doc.field_mask(key, 40).unwrap().is_empty());
        assert!(doc.landblock_keys().is_empty());
    }

    #[test]
    fn test_whole_cell_write_sets_masks_for_nonzero_fields() {
        let doc = layer();
        let key = LandblockKey::new(2, 2);
        doc.set_cell(key, 12, pack(1, 0, 7, 0)).unwrap();
        assert_eq!(doc.field_mask(key, 12).unwrap().bits(), 0x5);
    }

    #[test]
    fn test_edge_sync_only_into_existing_landblocks() {
        let doc = layer();
        let key = LandblockKey::new(3, 3);
        let east = LandblockKey::new(4, 3);

        // east neighbour has no entries yet: not created by sync
        let update = doc.set_cell(key, cell_index(8, 4), 11).unwrap();
        assert_eq!(update.landblocks().collect::<Vec<_>>(), vec![key]);
        assert_eq!(doc.landblock_keys(), vec![key]);

        // once the neighbour holds something, its shared vertex follows
        doc.set_cell(east, cell_index(4, 4), 1).unwrap();
        let update = doc.set_cell(key, cell_index(8, 5), 12).unwrap();
        assert_eq!(update.value(east, cell_index(0, 5)), Some(12));
        assert_eq!(doc.get_cell(east, cell_index(0, 5)).unwrap(), 12);
        assert_eq!(doc.field_mask(east, cell_index(0, 5)).unwrap(), FieldMask::from_bits(0x1));
    }

    #[test]
    fn test_mirrored_vertex_takes_source_mask() {
        let doc = layer();
        let key = LandblockKey::new(3, 3);
        let east = LandblockKey::new(4, 3);
        let vertex = cell_index(8, 5);
        let mirrored = cell_index(0, 5);

        doc.set_field(key, vertex, TerrainField::Height, 9).unwrap();
        doc.set_cell(east, cell_index(4, 4), 1).unwrap();
        doc.set_field(key, vertex, TerrainField::Road, 2).unwrap();

        assert_eq!(doc.get_cell(key, vertex).unwrap(), pack(2, 0, 0, 9));
        assert_eq!(doc.get_cell(east, mirrored).unwrap(), pack(2, 0, 0, 9));
        assert_eq!(doc.field_mask(key, vertex).unwrap().bits(), 0x9);
        assert_eq!(
            doc.field_mask(east, mirrored).unwrap(),
            doc.field_mask(key, vertex).unwrap()
        );

        // the neighbour's own fields are replaced, not merged
        doc.set_field(east, mirrored, TerrainField::Scenery, 4).unwrap();
        assert_eq!(doc.field_mask(key, vertex).unwrap().bits(), 0xB);
        doc.set_cell(key, vertex, pack(0, 0, 0, 7)).unwrap();
        assert_eq!(doc.field_mask(east, mirrored).unwrap(), TerrainField::Height.mask());
    }

    #[test]
    fn test_edge_sync_clears_neighbor_vertex() {
        let doc = layer();
        let key = LandblockKey::new(3, 3);
        let east = LandblockKey::new(4, 3);
        doc.update_cells(None, &[(key, cell_index(8, 2), 4), (east, cell_index(4, 4), 1)])
            .unwrap();
        doc.set_cell(key, cell_index(8, 2), 4).unwrap();
        assert_eq!(doc.get_cell(east, cell_index(0, 2)).unwrap(), 4);

        doc.set_cell(key, cell_index(8, 2), 0).unwrap();
        assert_eq!(doc.get_cell(east, cell_index(0, 2)).unwrap(), 0);
        assert_eq!(doc.sparse_cells(east), BTreeMap::from([(40, 1)]));
        assert_eq!(doc.landblock_keys(), vec![east]);
    }

    #[test]
    fn test_projection_roundtrip() {
        let doc = layer();
        let key = LandblockKey::new(1, 1);
        doc.set_field(key, 3, TerrainField::Scenery, 9).unwrap();
        doc.set_cell(LandblockKey::new(7, 7), 80, 0x0102_0304).unwrap();
        let projection = doc.projection().unwrap();

        let loaded = layer();
        loaded.load_projection(&projection.bytes);
        assert_eq!(loaded.landblock_keys(), doc.landblock_keys());
        assert_eq!(loaded.field_mask(key, 3).unwrap(), TerrainField::Scenery.mask());
        assert_eq!(loaded.field_mask(LandblockKey::new(7, 7), 80).unwrap(), FieldMask::ALL);
    }

    #[test]
    fn test_legacy_projection_gets_full_masks() {
        let legacy = encode(&(vec![(0x0303u16, vec![(10u8, 5u32), (20, 6)])],)).unwrap();
        let doc = layer();
        doc.load_projection(&legacy);

        let key = LandblockKey::from_raw(0x0303);
        assert_eq!(doc.sparse_cells(key), BTreeMap::from([(10, 5), (20, 6)]));
        assert_eq!(doc.field_mask(key, 10).unwrap(), FieldMask::ALL);
        assert_eq!(doc.field_mask(key, 20).unwrap(), FieldMask::ALL);
        assert!(!doc.is_dirty());
    }

    #[test]
    fn test_corrupt_projection_yields_empty_layer() {
        let doc = layer();
        doc.set_cell(LandblockKey::new(1, 1), 0, 1).unwrap();
        doc.load_projection(&[0xFF; 5]);
        assert_eq!(doc.cell_count(), 0);
    }

    #[tokio::test]
    async fn test_export_unsupported() {
        let doc = layer();
        doc.set_cell(LandblockKey::new(1, 1), 0, 1).unwrap();
        let archive = MemoryArchive::flat(2, 0);
        let err = doc.export(&archive, 1).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(archive.write_count(), 0);
    }
}
