//! Landblock record archive backed by redb.
//!
//! Records are stored bincode-encoded under their archive record id. A batch
//! save commits every record and the new iteration in one write transaction,
//! so an export either lands completely or not at all.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable};
use tracing::{debug, info};

use worldforge_common::{LandblockKey, Result};
use worldforge_docs::{AssetArchive, LandblockRecord, landblock_record_id};

use crate::error::{StoreError, StoreResult};
use crate::{run_blocking, tables};

fn read_landblock(db: &Database, record_id: u32) -> StoreResult<Option<LandblockRecord>> {
    let rtx = db.begin_read()?;
    let table = rtx.open_table(tables::LANDBLOCKS)?;
    match table.get(record_id)? {
        Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
        None => Ok(None),
    }
}

fn write_landblocks(db: &Database, records: &[LandblockRecord], iteration: u32) -> StoreResult<()> {
    let wtx = db.begin_write()?;
    {
        let mut table = wtx.open_table(tables::LANDBLOCKS)?;
        for record in records {
            let bytes = bincode::serialize(record)?;
            table.insert(record.id, bytes.as_slice())?;
        }

        let mut meta = wtx.open_table(tables::ARCHIVE_META)?;
        let current = meta
            .get(tables::META_ITERATION)?
            .map_or(0, |value| value.value());
        if iteration > current {
            meta.insert(tables::META_ITERATION, iteration)?;
        }
    }
    wtx.commit()?;
    Ok(())
}

/// Asset archive persisted in a redb file
pub struct RedbArchive {
    db: Arc<Database>,
}

impl RedbArchive {
    /// Open (or create) the archive at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let wtx = db.begin_write()?;
        wtx.open_table(tables::LANDBLOCKS)?;
        wtx.open_table(tables::ARCHIVE_META)?;
        wtx.commit()?;

        info!("Opened asset archive at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    /// Last iteration written
    pub fn iteration(&self) -> StoreResult<u32> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(tables::ARCHIVE_META)?;
        Ok(table
            .get(tables::META_ITERATION)?
            .map_or(0, |value| value.value()))
    }

    /// Number of stored landblock records
    pub fn len(&self) -> StoreResult<usize> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(tables::LANDBLOCKS)?;
        Ok(table.iter()?.count())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Fill every landblock with `x, y < extent` with a flat record, in one commit
    pub fn seed_flat(&self, extent: u8, height: u8) -> StoreResult<usize> {
        let records: Vec<_> = LandblockKey::all()
            .filter(|key| key.x() < extent && key.y() < extent)
            .map(|key| LandblockRecord::flat(key, height))
            .collect();
        write_landblocks(&self.db, &records, 0)?;
        info!("Seeded {} flat landblocks at height {height}", records.len());
        Ok(records.len())
    }

    /// Read one landblock's record directly
    pub fn record(&self, key: LandblockKey) -> StoreResult<Option<LandblockRecord>> {
        read_landblock(&self.db, landblock_record_id(key))
    }
}

#[async_trait]
impl AssetArchive for RedbArchive {
    async fn try_get_landblock(&self, record_id: u32) -> Result<Option<LandblockRecord>> {
        run_blocking(&self.db, move |db| read_landblock(db, record_id))
            .await
            .map_err(StoreError::into_archive_error)
    }

    async fn try_save_landblock(&self, record: LandblockRecord, iteration: u32) -> Result<()> {
        self.try_save_landblocks(vec![record], iteration).await
    }

    async fn try_save_landblocks(&self, records: Vec<LandblockRecord>, iteration: u32) -> Result<()> {
        let count = records.len();
        run_blocking(&self.db, move |db| write_landblocks(db, &records, iteration))
            .await
            .map_err(StoreError::into_archive_error)?;
        debug!("Saved {count} landblock records at iteration {iteration}");
        Ok(())
    }
}
