//! Authoritative outdoor terrain document
//!
//! Reads go through a two-tier lookup: the edited overlay first, then the
//! immutable base cache. The first write to a landblock copies its base
//! array into the overlay.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use worldforge_common::{
    CELLS_PER_LANDBLOCK, DocumentId, DocumentKind, Error, LandblockCells, LandblockKey, Result,
    TerrainField, check_cell_index, replace_field,
};

use crate::archive::{AssetArchive, landblock_record_id};
use crate::base_cache::BaseCache;
use crate::document::{
    ChangeTracker, Document, DocumentContext, DocumentType, ExportSummary, Projection, decode,
    encode,
};
use crate::edge_sync::{ChangeSet, TerrainUpdate, derive_neighbor_changes, merge_changes};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Persisted form of the overlay
#[derive(Debug, Default, Serialize, Deserialize)]
struct TerrainPayload {
    overlay: Vec<(u16, Vec<u32>)>,
}

struct TerrainState {
    base: Arc<BaseCache>,
    overlay: HashMap<LandblockKey, Box<LandblockCells>>,
    /// Cells written since the last export
    dirty_cells: HashMap<LandblockKey, BTreeSet<u8>>,
}

impl TerrainState {
    fn landblock(&self, key: LandblockKey) -> Option<LandblockCells> {
        self.overlay
            .get(&key)
            .map(|cells| **cells)
            .or_else(|| self.base.get(key).copied())
    }

    /// Neighbour value for edge sync: only landblocks present in the base take part
    fn sync_value(&self, key: LandblockKey, index: usize) -> Option<u32> {
        let base = self.base.get(key)?;
        Some(self.overlay.get(&key).map_or(base[index], |cells| cells[index]))
    }

    fn apply(&mut self, changes: &ChangeSet) {
        for (&key, cells) in changes {
            let base = &self.base;
            let overlay = self
                .overlay
                .entry(key)
                .or_insert_with(|| Box::new(base.get(key).copied().unwrap_or([0; CELLS_PER_LANDBLOCK])));
            let dirty = self.dirty_cells.entry(key).or_default();
            for (&index, &value) in cells {
                overlay[usize::from(index)] = value;
                dirty.insert(index);
            }
        }
    }
}

/// Outdoor terrain: base cache plus copy-on-write overlay
pub struct TerrainDocument {
    id: DocumentId,
    tracker: ChangeTracker,
    state: Mutex<TerrainState>,
    updates: broadcast::Sender<TerrainUpdate>,
}

impl TerrainDocument {
    pub fn new(id: DocumentId) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            id,
            tracker: ChangeTracker::new(),
            state: Mutex::new(TerrainState {
                base: Arc::new(BaseCache::empty()),
                overlay: HashMap::new(),
                dirty_cells: HashMap::new(),
            }),
            updates,
        }
    }

    /// Registry constructor
    pub fn constructor(id: DocumentId) -> Arc<dyn Document> {
        Arc::new(Self::new(id))
    }

    /// Attach the base cache (normally done by initialization)
    pub fn set_base(&self, base: Arc<BaseCache>) {
        self.state.lock().base = base;
    }

    /// Full state of a landblock: overlay if edited, else base
    pub fn get_landblock(&self, key: LandblockKey) -> Result<LandblockCells> {
        self.state
            .lock()
            .landblock(key)
            .ok_or(Error::LandblockNotFound(key))
    }

    pub fn get_cell(&self, key: LandblockKey, index: usize) -> Result<u32> {
        let index = check_cell_index(index)?;
        Ok(self.get_landblock(key)?[usize::from(index)])
    }

    /// Write one packed cell value
    pub fn update_cell(&self, key: LandblockKey, index: usize, value: u32) -> Result<TerrainUpdate> {
        self.update_cells(&[(key, index, value)])
    }

    /// Write several packed cell values in one transaction
    pub fn update_cells(&self, writes: &[(LandblockKey, usize, u32)]) -> Result<TerrainUpdate> {
        self.transact(None, |state| {
            let mut direct = ChangeSet::new();
            for &(key, index, value) in writes {
                let index = check_cell_index(index)?;
                if !state.base.contains(key) {
                    return Err(Error::LandblockNotFound(key));
                }
                direct.entry(key).or_default().insert(index, value);
            }
            Ok(direct)
        })
    }

    /// Write one field of one cell, keeping the other fields
    pub fn update_field(
        &self,
        key: LandblockKey,
        index: usize,
        field: TerrainField,
        byte: u8,
    ) -> Result<TerrainUpdate> {
        self.transact(Some(field), |state| {
            let index = check_cell_index(index)?;
            if !state.base.contains(key) {
                return Err(Error::LandblockNotFound(key));
            }
            let current = state
                .landblock(key)
                .ok_or(Error::LandblockNotFound(key))?[usize::from(index)];
            let mut direct = ChangeSet::new();
            direct
                .entry(key)
                .or_default()
                .insert(index, replace_field(current, field, byte));
            Ok(direct)
        })
    }

    /// Apply direct writes plus their edge-sync writes atomically
    fn transact<F>(&self, field: Option<TerrainField>, build: F) -> Result<TerrainUpdate>
    where
        F: FnOnce(&TerrainState) -> Result<ChangeSet>,
    {
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
                let mut cells_after = state.landblock(key).ok_or(Error::LandblockNotFound(key))?;
                for (&index, &value) in cells {
                    cells_after[usize::from(index)] = value;
                }
                post.insert(key, cells_after);
            }

            let derived = derive_neighbor_changes(&direct, &post, |k, i| state.sync_value(k, i));
            let changes = merge_changes(direct, derived);
            state.apply(&changes);
            self.tracker.bump();
            TerrainUpdate { field, changes }
        };

        debug!(
            "Terrain {} updated {} cells across {} landblocks",
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

    /// Landblocks with an overlay entry, ascending
    pub fn overlay_keys(&self) -> Vec<LandblockKey> {
        let mut keys: Vec<_> = self.state.lock().overlay.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn is_overlaid(&self, key: LandblockKey) -> bool {
        self.state.lock().overlay.contains_key(&key)
    }

    /// Snapshot of the cells written since the last export
    pub fn dirty_cells(&self) -> BTreeMap<LandblockKey, BTreeSet<u8>> {
        self.state
            .lock()
            .dirty_cells
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Drain the per-landblock dirty cell sets
    pub fn take_dirty_cells(&self) -> BTreeMap<LandblockKey, BTreeSet<u8>> {
        std::mem::take(&mut self.state.lock().dirty_cells)
            .into_iter()
            .collect()
    }

    fn decode_payload(&self, bytes: &[u8]) -> Result<HashMap<LandblockKey, Box<LandblockCells>>> {
        let payload: TerrainPayload = decode(bytes)?;
        let mut overlay = HashMap::with_capacity(payload.overlay.len());
        for (raw, values) in payload.overlay {
            let cells: LandblockCells = values.try_into().map_err(|v: Vec<u32>| {
                Error::Deserialization(format!(
                    "terrain {} landblock {raw:04X} has {} cells",
                    self.id,
                    v.len()
                ))
            })?;
            overlay.insert(LandblockKey::from_raw(raw), Box::new(cells));
        }
        Ok(overlay)
    }
}

#[async_trait]
impl Document for TerrainDocument {
    fn id(&self) -> &DocumentId {
        &self.id
    }

    fn kind(&self) -> DocumentKind {
        DocumentKind::Terrain
    }

    fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    fn projection(&self) -> Result<Projection> {
        let state = self.state.lock();
        let mut overlay: Vec<(u16, Vec<u32>)> = state
            .overlay
            .iter()
            .map(|(key, cells)| (key.raw(), cells.to_vec()))
            .collect();
        overlay.sort_unstable_by_key(|(raw, _)| *raw);
        let bytes = encode(&TerrainPayload { overlay })?;
        Ok(Projection {
            bytes: Bytes::from(bytes),
            version: self.tracker.version(),
        })
    }

    fn load_projection(&self, bytes: &[u8]) {
        let overlay = match self.decode_payload(bytes) {
            Ok(overlay) => overlay,
            Err(e) => {
                warn!("Discarding corrupt terrain projection for {}: {e}", self.id);
                HashMap::new()
            }
        };
        let mut state = self.state.lock();
        state.overlay = overlay;
        state.dirty_cells.clear();
    }

    async fn initialize(&self, ctx: &DocumentContext) -> Result<()> {
        let base = ctx.base_cache.get_or_load(ctx.archive.as_ref()).await?;
        info!("Terrain {} initialized over {} base landblocks", self.id, base.len());
        self.set_base(base);
        Ok(())
    }

    async fn on_loaded(&self, ctx: &DocumentContext) -> Result<()> {
        let base = ctx.base_cache.get_or_load(ctx.archive.as_ref()).await?;
        let mut state = self.state.lock();
        let orphaned = state.overlay.keys().filter(|k| !base.contains(**k)).count();
        if orphaned > 0 {
            warn!(
                "Terrain {} has {orphaned} overlaid landblocks missing from the base cache",
                self.id
            );
        }
        state.base = base;
        Ok(())
    }

    async fn export(&self, archive: &dyn AssetArchive, iteration: u32) -> Result<ExportSummary> {
        let mut edited: Vec<(LandblockKey, LandblockCells)> = self
            .state
            .lock()
            .overlay
            .iter()
            .map(|(key, cells)| (*key, **cells))
            .collect();
        edited.sort_unstable_by_key(|(key, _)| *key);

        // read every target record before writing any
        let records = try_join_all(edited.iter().map(|(key, cells)| async move {
            let id = landblock_record_id(*key);
            let mut record = archive
                .try_get_landblock(id)
                .await?
                .ok_or(Error::RecordNotFound(id))?;
            record.apply_cells(cells);
            Ok::<_, Error>(record)
        }))
        .await?;

        let landblocks = records.len();
        archive.try_save_landblocks(records, iteration).await?;

        {
            let mut state = self.state.lock();
            for (key, _) in &edited {
                state.dirty_cells.remove(key);
            }
        }
        info!(
            "Exported {landblocks} landblocks of terrain {} at iteration {iteration}",
            self.id
        );
        Ok(ExportSummary { landblocks })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl DocumentType for TerrainDocument {
    const KIND: DocumentKind = DocumentKind::Terrain;

    fn create(id: DocumentId) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{LandblockRecord, MemoryArchive};
    use crate::base_cache::BaseCacheHandle;
    use worldforge_common::{CELL_SIDE, cell_index, pack};

    /// Terrain over an all-zero `extent`×`extent` base grid
    fn terrain(extent: u8) -> TerrainDocument {
        let doc = TerrainDocument::new(DocumentId::new("terrain").unwrap());
        let entries = (0..extent).flat_map(|x| (0..extent).map(move |y| (LandblockKey::new(x, y), [0; 81])));
        doc.set_base(Arc::new(BaseCache::from_entries(entries)));
        doc
    }

    #[test]
    fn test_read_falls_back_to_base() {
        let doc = terrain(2);
        assert_eq!(doc.get_landblock(LandblockKey::new(1, 1)).unwrap(), [0; 81]);
        assert!(matches!(
            doc.get_landblock(LandblockKey::new(9, 9)),
            Err(Error::LandblockNotFound(_))
        ));
        assert!(doc.overlay_keys().is_empty());
    }

    #[test]
    fn test_east_edge_vertices_sync() {
        let doc = terrain(4);
        let key = LandblockKey::from_raw(0x0101);
        let east = LandblockKey::from_raw(0x0201);

        for y in 0..CELL_SIDE {
            let value = pack(y as u8, 1, 2, 3);
            doc.update_cell(key, cell_index(8, y), value).unwrap();
            assert_eq!(doc.get_cell(east, cell_index(0, y)).unwrap(), value);
        }
    }

    #[test]
    fn test_interior_edit_touches_only_its_landblock() {
        let doc = terrain(4);
        let key = LandblockKey::from_raw(0x0101);
        let update = doc.update_cell(key, cell_index(4, 4), 0x0102_0304).unwrap();

        assert_eq!(update.landblocks().collect::<Vec<_>>(), vec![key]);
        assert_eq!(doc.overlay_keys(), vec![key]);
        assert_eq!(doc.dirty_cells()[&key], BTreeSet::from([40]));
    }

    #[test]
    fn test_origin_top_edge_scenario() {
        let doc = terrain(3);
        let origin = LandblockKey::from_raw(0x0000);
        let above = LandblockKey::from_raw(0x0001);

        let update = doc.update_cell(origin, 8, 0x0102_0304).unwrap();
        assert_eq!(doc.get_cell(origin, 8).unwrap(), 0x0102_0304);
        assert_eq!(doc.get_cell(above, 0).unwrap(), 0x0102_0304);
        assert_eq!(update.landblocks().collect::<Vec<_>>(), vec![origin, above]);
        assert_eq!(doc.overlay_keys(), vec![origin, above]);
        assert_eq!(update.len(), 2);
    }

    #[test]
    fn test_neighbor_missing_from_base_is_skipped() {
        // only 0x0000 exists
        let doc = terrain(1);
        let origin = LandblockKey::new(0, 0);
        let update = doc.update_cell(origin, cell_index(8, 8), 5).unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(doc.overlay_keys(), vec![origin]);
    }

    #[test]
    fn test_invalid_writes_apply_nothing() {
        let doc = terrain(2);
        let ok = LandblockKey::new(0, 0);
        let err = doc
            .update_cells(&[(ok, 3, 1), (LandblockKey::new(7, 7), 3, 1)])
            .unwrap_err();
        assert!(matches!(err, Error::LandblockNotFound(_)));
        assert!(matches!(doc.update_cell(ok, 81, 1), Err(Error::InvalidCellIndex(81))));
        assert!(doc.overlay_keys().is_empty());
        assert!(!doc.is_dirty());
    }

    #[test]
    fn test_field_update_keeps_other_fields() {
        let doc = terrain(2);
        let key = LandblockKey::new(0, 0);
        doc.update_cell(key, 40, pack(1, 2, 3, 4)).unwrap();
        let update = doc.update_field(key, 40, TerrainField::Height, 200).unwrap();
        assert_eq!(update.field, Some(TerrainField::Height));
        assert_eq!(doc.get_cell(key, 40).unwrap(), pack(1, 2, 3, 200));
    }

    #[test]
    fn test_one_event_per_transaction() {
        let doc = terrain(3);
        let mut rx = doc.subscribe_updates();
        let key = LandblockKey::new(1, 1);
        doc.update_cells(&[(key, cell_index(8, 0), 9), (key, cell_index(0, 8), 9)])
            .unwrap();

        let update = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        // direct + E, S, SE for (8,0) and W, N, NW for (0,8)
        assert_eq!(update.changes.len(), 7);
        assert_eq!(update.value(LandblockKey::new(2, 0), cell_index(0, 8)), Some(9));
        assert_eq!(update.value(LandblockKey::new(0, 2), cell_index(8, 0)), Some(9));
    }

    #[test]
    fn test_dirty_tracking_and_projection_version() {
        let doc = terrain(2);
        assert!(!doc.is_dirty());
        doc.update_cell(LandblockKey::new(0, 0), 0, 1).unwrap();
        assert!(doc.is_dirty());

        let projection = doc.projection().unwrap();
        assert_eq!(projection.version, doc.tracker().version());
        doc.tracker().mark_saved(projection.version);
        assert!(!doc.is_dirty());

        let drained = doc.take_dirty_cells();
        assert!(drained.contains_key(&LandblockKey::new(0, 0)));
        assert!(doc.dirty_cells().is_empty());
    }

    #[test]
    fn test_projection_roundtrip_and_corrupt_input() {
        let doc = terrain(2);
        doc.update_cell(LandblockKey::new(1, 0), 17, 0xABCD).unwrap();
        let projection = doc.projection().unwrap();

        let loaded = terrain(2);
        loaded.load_projection(&projection.bytes);
        assert_eq!(loaded.get_cell(LandblockKey::new(1, 0), 17).unwrap(), 0xABCD);
        assert_eq!(loaded.overlay_keys(), doc.overlay_keys());

        loaded.load_projection(b"\x01\x02\x03");
        assert!(loaded.overlay_keys().is_empty());
        assert_eq!(loaded.get_cell(LandblockKey::new(1, 0), 17).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_initialize_loads_base_from_archive() {
        let archive = Arc::new(MemoryArchive::flat(2, 12));
        let ctx = DocumentContext::new(
            archive.clone(),
            BaseCacheHandle::in_memory(&Default::default()),
        );
        let doc = TerrainDocument::new(DocumentId::new("terrain").unwrap());
        doc.initialize(&ctx).await.unwrap();
        assert_eq!(
            doc.get_cell(LandblockKey::new(1, 1), 0).unwrap(),
            pack(0, 0, 0, 12)
        );
    }

    #[tokio::test]
    async fn test_export_writes_overlay() {
        let archive = MemoryArchive::flat(2, 0);
        let mut with_objects = LandblockRecord::flat(LandblockKey::new(1, 1), 0);
        with_objects.has_objects = true;
        archive.insert(with_objects);

        let doc = terrain(2);
        doc.update_cell(LandblockKey::new(1, 1), 40, pack(1, 2, 3, 4)).unwrap();

        let summary = doc.export(&archive, 7).await.unwrap();
        assert_eq!(summary.landblocks, 1);
        assert_eq!(archive.iteration(), 7);
        let record = archive.record(LandblockKey::new(1, 1)).unwrap();
        assert!(record.has_objects);
        assert_eq!(record.to_cells().unwrap()[40], pack(1, 2, 3, 4));
        assert!(doc.dirty_cells().is_empty());
    }

    #[tokio::test]
    async fn test_export_is_all_or_nothing() {
        let doc = terrain(3);
        doc.update_cell(LandblockKey::new(0, 0), 40, 1).unwrap();
        doc.update_cell(LandblockKey::new(2, 2), 40, 2).unwrap();

        // one target record is missing: nothing is written
        let archive = MemoryArchive::flat(2, 0);
        let err = doc.export(&archive, 1).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(archive.write_count(), 0);
        assert_eq!(archive.record(LandblockKey::new(0, 0)).unwrap().to_cells().unwrap()[40], 0);

        // the batch write fails: nothing is written
        let archive = MemoryArchive::flat(3, 0);
        archive.set_fail_writes(true);
        assert!(doc.export(&archive, 1).await.is_err());
        assert_eq!(archive.write_count(), 0);
        assert_eq!(doc.dirty_cells().len(), 2);
    }
}
