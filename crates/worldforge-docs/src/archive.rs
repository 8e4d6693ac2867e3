//! Asset archive interface and landblock records
//!
//! The archive is a keyed store of typed binary records. Landblock terrain
//! records carry the per-vertex fields in their native layout: a
//! `TerrainInfo` (road, type, scenery) and a separate height byte.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use worldforge_common::{
    CELLS_PER_LANDBLOCK, Error, GRID_EXTENT, LandblockCells, LandblockKey, Result, TerrainEntry,
};

/// Subtype tag of landblock terrain records
pub const LANDBLOCK_SUBTYPE: u32 = 0xFFFF;

/// Archive record id of a landblock's terrain record
#[must_use]
pub const fn landblock_record_id(key: LandblockKey) -> u32 {
    ((key.raw() as u32) << 16) | LANDBLOCK_SUBTYPE
}

/// Landblock key encoded in a record id
#[must_use]
pub const fn record_landblock_key(record_id: u32) -> LandblockKey {
    LandblockKey::from_raw((record_id >> 16) as u16)
}

/// Native per-vertex terrain fields of an archive record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerrainInfo {
    pub road: u8,
    pub terrain_type: u8,
    pub scenery: u8,
}

/// Landblock terrain record as stored in the asset archive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandblockRecord {
    pub id: u32,
    pub has_objects: bool,
    pub terrain: Vec<TerrainInfo>,
    pub height: Vec<u8>,
}

impl LandblockRecord {
    /// A record with every vertex at `height` and all other fields zero
    #[must_use]
    pub fn flat(key: LandblockKey, height: u8) -> Self {
        Self {
            id: landblock_record_id(key),
            has_objects: false,
            terrain: vec![TerrainInfo::default(); CELLS_PER_LANDBLOCK],
            height: vec![height; CELLS_PER_LANDBLOCK],
        }
    }

    /// Build a record from packed cell values
    #[must_use]
    pub fn from_cells(key: LandblockKey, cells: &LandblockCells) -> Self {
        let mut record = Self::flat(key, 0);
        record.apply_cells(cells);
        record
    }

    pub const fn key(&self) -> LandblockKey {
        record_landblock_key(self.id)
    }

    /// Pack the native fields into cell values
    pub fn to_cells(&self) -> Result<LandblockCells> {
        if self.terrain.len() != CELLS_PER_LANDBLOCK || self.height.len() != CELLS_PER_LANDBLOCK {
            return Err(Error::archive(format!(
                "landblock record {:#010x} has {} terrain / {} height entries",
                self.id,
                self.terrain.len(),
                self.height.len()
            )));
        }
        let mut cells = [0u32; CELLS_PER_LANDBLOCK];
        for (i, cell) in cells.iter_mut().enumerate() {
            let info = self.terrain[i];
            *cell = TerrainEntry::new(info.road, info.scenery, info.terrain_type, self.height[i])
                .to_packed();
        }
        Ok(cells)
    }

    /// Overwrite the native fields from packed cell values, keeping other record data
    pub fn apply_cells(&mut self, cells: &LandblockCells) {
        self.terrain.resize(CELLS_PER_LANDBLOCK, TerrainInfo::default());
        self.height.resize(CELLS_PER_LANDBLOCK, 0);
        for (i, value) in cells.iter().enumerate() {
            let entry = TerrainEntry::from_packed(*value);
            self.terrain[i] = TerrainInfo {
                road: entry.road,
                terrain_type: entry.terrain_type,
                scenery: entry.scenery,
            };
            self.height[i] = entry.height;
        }
    }
}

/// Keyed store of typed records
#[async_trait]
pub trait AssetArchive: Send + Sync {
    /// Fetch a landblock record, `None` when absent
    async fn try_get_landblock(&self, record_id: u32) -> Result<Option<LandblockRecord>>;

    /// Write one landblock record at `iteration`
    async fn try_save_landblock(&self, record: LandblockRecord, iteration: u32) -> Result<()>;

    /// Write several records. Implementations that can commit atomically
    /// should override this; the default writes them one by one.
    async fn try_save_landblocks(&self, records: Vec<LandblockRecord>, iteration: u32) -> Result<()> {
        for record in records {
            self.try_save_landblock(record, iteration).await?;
        }
        Ok(())
    }
}

/// In-memory asset archive with counters and failure injection
#[derive(Default)]
pub struct MemoryArchive {
    records: RwLock<HashMap<u32, LandblockRecord>>,
    failing_reads: RwLock<HashSet<u32>>,
    fail_writes: AtomicBool,
    iteration: AtomicU32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An archive holding flat landblocks for every `x, y < extent`
    #[must_use]
    pub fn flat(extent: u8, height: u8) -> Self {
        let archive = Self::new();
        let extent = u16::from(extent).min(GRID_EXTENT);
        for key in LandblockKey::all().filter(|k| u16::from(k.x()) < extent && u16::from(k.y()) < extent) {
            archive.insert(LandblockRecord::flat(key, height));
        }
        archive
    }

    pub fn insert(&self, record: LandblockRecord) {
        self.records.write().insert(record.id, record);
    }

    pub fn record(&self, key: LandblockKey) -> Option<LandblockRecord> {
        self.records.read().get(&landblock_record_id(key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Make reads of one record fail
    pub fn fail_read(&self, key: LandblockKey) {
        self.failing_reads.write().insert(landblock_record_id(key));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Last iteration written
    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetArchive for MemoryArchive {
    async fn try_get_landblock(&self, record_id: u32) -> Result<Option<LandblockRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.failing_reads.read().contains(&record_id) {
            return Err(Error::archive(format!("injected read failure for {record_id:#010x}")));
        }
        Ok(self.records.read().get(&record_id).cloned())
    }

    async fn try_save_landblock(&self, record: LandblockRecord, iteration: u32) -> Result<()> {
        self.try_save_landblocks(vec![record], iteration).await
    }

    async fn try_save_landblocks(&self, records: Vec<LandblockRecord>, iteration: u32) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::archive("injected write failure"));
        }
        let mut stored = self.records.write();
        self.writes.fetch_add(records.len() as u64, Ordering::Relaxed);
        for record in records {
            stored.insert(record.id, record);
        }
        self.iteration.fetch_max(iteration, Ordering::SeqCst);
        Ok(())
    }
}
