//! Immutable base terrain grid and its derived on-disk snapshot
//!
//! The base cache holds the archive's terrain for every landblock that
//! exists. Building it means reading up to 255×255 archive records, so the
//! assembled grid is also written to a local snapshot file and reused by
//! later runs.
//!
//! Snapshot layout: a fixed 24-byte header followed by a bincode body of
//! `(key, 81 values)` pairs.
//!
//! ```text
//! 0..8    magic "WFTBASE1"
//! 8..12   format version (LE)
//! 12..20  entry count (LE)
//! 20..24  CRC32C of the body (LE)
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use futures::stream;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use worldforge_common::config::TerrainConfig;
use worldforge_common::{CELLS_PER_LANDBLOCK, Error, LandblockCells, LandblockKey, Result};

use crate::archive::{AssetArchive, landblock_record_id};
use crate::document::{decode, encode};

const SLOTS: usize = 1 << 16;

/// Snapshot file header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SnapshotHeader {
    version: u32,
    entry_count: u64,
    checksum: u32,
}

impl SnapshotHeader {
    const MAGIC: [u8; 8] = *b"WFTBASE1";
    const VERSION: u32 = 1;
    const SIZE: usize = 24;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&Self::MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..20].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE || data[0..8] != Self::MAGIC {
            return None;
        }
        Some(Self {
            version: u32::from_le_bytes(data[8..12].try_into().ok()?),
            entry_count: u64::from_le_bytes(data[12..20].try_into().ok()?),
            checksum: u32::from_le_bytes(data[20..24].try_into().ok()?),
        })
    }
}

/// Immutable base grid indexed by landblock key
pub struct BaseCache {
    slots: Vec<Option<Box<LandblockCells>>>,
    len: usize,
}

impl BaseCache {
    /// A cache with no landblocks
    #[must_use]
    pub fn empty() -> Self {
        Self {
            slots: vec![None; SLOTS],
            len: 0,
        }
    }

    /// Build from `(key, cells)` pairs; later duplicates replace earlier ones
    pub fn from_entries(entries: impl IntoIterator<Item = (LandblockKey, LandblockCells)>) -> Self {
        let mut cache = Self::empty();
        for (key, cells) in entries {
            let slot = &mut cache.slots[usize::from(key.raw())];
            if slot.is_none() {
                cache.len += 1;
            }
            *slot = Some(Box::new(cells));
        }
        cache
    }

    pub fn get(&self, key: LandblockKey) -> Option<&LandblockCells> {
        self.slots[usize::from(key.raw())].as_deref()
    }

    pub fn contains(&self, key: LandblockKey) -> bool {
        self.slots[usize::from(key.raw())].is_some()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keys of every present landblock, ascending
    pub fn keys(&self) -> impl Iterator<Item = LandblockKey> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(raw, _)| LandblockKey::from_raw(raw as u16))
    }

    /// Read every landblock of the grid from the archive.
    ///
    /// Missing or unreadable landblocks are skipped.
    pub async fn build(archive: &dyn AssetArchive, concurrency: usize) -> BuildReport {
        let started = Instant::now();
        let mut reads = stream::iter(LandblockKey::all())
            .map(|key| async move { (key, archive.try_get_landblock(landblock_record_id(key)).await) })
            .buffer_unordered(concurrency.max(1));

        let mut entries = Vec::new();
        let mut missing = 0usize;
        let mut failed = 0usize;
        while let Some((key, result)) = reads.next().await {
            match result.and_then(|record| record.map(|r| r.to_cells()).transpose()) {
                Ok(Some(cells)) => entries.push((key, cells)),
                Ok(None) => missing += 1,
                Err(e) => {
                    debug!("Skipping landblock {key}: {e}");
                    failed += 1;
                }
            }
        }

        let cache = Self::from_entries(entries);
        info!(
            "Built terrain base cache: {} landblocks, {} missing, {} unreadable in {:?}",
            cache.len(),
            missing,
            failed,
            started.elapsed()
        );
        BuildReport {
            cache,
            missing,
            failed,
        }
    }

    /// Write the snapshot atomically (temp file, then rename)
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let entries: Vec<(u16, Vec<u32>)> = self
            .keys()
            .filter_map(|key| self.get(key).map(|cells| (key.raw(), cells.to_vec())))
            .collect();
        let data = encode(&entries)?;

        let header = SnapshotHeader {
            version: SnapshotHeader::VERSION,
            entry_count: entries.len() as u64,
            checksum: crc32c::crc32c(&data),
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Storage(format!("failed to create cache dir: {e}")))?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| Error::Storage(format!("failed to create snapshot file: {e}")))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(&header.to_bytes())
                .map_err(|e| Error::Storage(format!("failed to write snapshot header: {e}")))?;
            writer
                .write_all(&data)
                .map_err(|e| Error::Storage(format!("failed to write snapshot data: {e}")))?;
            writer
                .flush()
                .map_err(|e| Error::Storage(format!("failed to flush snapshot: {e}")))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::Storage(format!("failed to sync snapshot: {e}")))?;
        }

        std::fs::rename(&temp_path, path)
            .map_err(|e| Error::Storage(format!("failed to rename snapshot: {e}")))?;
        Ok(())
    }

    /// Read and validate a snapshot; `Ok(None)` when the file does not exist
    pub fn read_snapshot(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Storage(format!("failed to open snapshot: {e}"))),
        };
        let mut reader = BufReader::new(file);

        let mut header_buf = [0u8; SnapshotHeader::SIZE];
        reader
            .read_exact(&mut header_buf)
            .map_err(|e| Error::Storage(format!("failed to read snapshot header: {e}")))?;
        let header = SnapshotHeader::from_bytes(&header_buf)
            .ok_or_else(|| Error::Storage("invalid snapshot header".into()))?;
        if header.version != SnapshotHeader::VERSION {
            return Err(Error::Storage(format!(
                "unsupported snapshot version {}",
                header.version
            )));
        }

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::Storage(format!("failed to read snapshot data: {e}")))?;
        if crc32c::crc32c(&data) != header.checksum {
            return Err(Error::Storage("snapshot checksum mismatch".into()));
        }

        let entries: Vec<(u16, Vec<u32>)> = decode(&data)?;
        if entries.len() as u64 != header.entry_count {
            return Err(Error::Storage("snapshot entry count mismatch".into()));
        }

        let mut cells = Vec::with_capacity(entries.len());
        for (raw, values) in entries {
            let values: LandblockCells = values.try_into().map_err(|v: Vec<u32>| {
                Error::Storage(format!(
                    "snapshot landblock {raw:04X} has {} cells, expected {CELLS_PER_LANDBLOCK}",
                    v.len()
                ))
            })?;
            cells.push((LandblockKey::from_raw(raw), values));
        }
        Ok(Some(Self::from_entries(cells)))
    }
}

impl std::fmt::Debug for BaseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseCache").field("len", &self.len).finish()
    }
}

/// Outcome of building the base cache from the archive
#[derive(Debug)]
pub struct BuildReport {
    pub cache: BaseCache,
    /// Landblocks the archive has no record for
    pub missing: usize,
    /// Landblocks whose record could not be read or decoded
    pub failed: usize,
}

struct HandleInner {
    cell: OnceCell<Arc<BaseCache>>,
    snapshot_path: Option<PathBuf>,
    read_concurrency: usize,
}

/// Shared once-only slot for the base cache
///
/// Every clone refers to the same slot, so the grid is loaded at most once
/// no matter how many terrain documents ask for it.
#[derive(Clone)]
pub struct BaseCacheHandle {
    inner: Arc<HandleInner>,
}

impl BaseCacheHandle {
    /// A handle backed by a snapshot file inside `cache_dir`
    pub fn new(cache_dir: &Path, config: &TerrainConfig) -> Self {
        Self::with_path(Some(cache_dir.join(&config.base_cache_file)), config)
    }

    /// A handle that always builds from the archive and never touches disk
    pub fn in_memory(config: &TerrainConfig) -> Self {
        Self::with_path(None, config)
    }

    /// A handle whose cache is already loaded
    pub fn preloaded(cache: BaseCache) -> Self {
        let handle = Self::in_memory(&TerrainConfig::default());
        // a fresh cell cannot already be set
        let _ = handle.inner.cell.set(Arc::new(cache));
        handle
    }

    fn with_path(snapshot_path: Option<PathBuf>, config: &TerrainConfig) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cell: OnceCell::new(),
                snapshot_path,
                read_concurrency: config.archive_read_concurrency,
            }),
        }
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.inner.snapshot_path.as_deref()
    }

    /// The cache, if it has been loaded
    pub fn get(&self) -> Option<Arc<BaseCache>> {
        self.inner.cell.get().cloned()
    }

    /// Load the snapshot, or build from the archive and write the snapshot
    pub async fn get_or_load(&self, archive: &dyn AssetArchive) -> Result<Arc<BaseCache>> {
        let cache = self
            .inner
            .cell
            .get_or_try_init(|| self.load(archive))
            .await?;
        Ok(Arc::clone(cache))
    }

    async fn load(&self, archive: &dyn AssetArchive) -> Result<Arc<BaseCache>> {
        if let Some(path) = self.inner.snapshot_path.clone() {
            let read_path = path.clone();
            let snapshot = tokio::task::spawn_blocking(move || BaseCache::read_snapshot(&read_path))
                .await
                .map_err(|e| Error::internal(format!("snapshot reader panicked: {e}")))?;
            match snapshot {
                Ok(Some(cache)) if !cache.is_empty() => {
                    info!(
                        "Loaded terrain base cache from {}: {} landblocks",
                        path.display(),
                        cache.len()
                    );
                    return Ok(Arc::new(cache));
                }
                Ok(_) => debug!("No usable terrain base cache at {}", path.display()),
                Err(e) => warn!(
                    "Ignoring terrain base cache at {}: {e}; rebuilding",
                    path.display()
                ),
            }
        }

        let report = BaseCache::build(archive, self.inner.read_concurrency).await;
        let cache = Arc::new(report.cache);

        if let Some(path) = self.inner.snapshot_path.clone() {
            if cache.is_empty() {
                debug!("Not writing an empty terrain base cache");
            } else {
                let snapshot = Arc::clone(&cache);
                let write_path = path.clone();
                let written =
                    tokio::task::spawn_blocking(move || snapshot.write_snapshot(&write_path)).await;
                match written {
                    Ok(Ok(())) => info!("Wrote terrain base cache to {}", path.display()),
                    Ok(Err(e)) => warn!("Failed to write terrain base cache: {e}"),
                    Err(e) => warn!("Terrain base cache writer panicked: {e}"),
                }
            }
        }
        Ok(cache)
    }
}

impl std::fmt::Debug for BaseCacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseCacheHandle")
            .field("snapshot_path", &self.inner.snapshot_path)
            .field("loaded", &self.inner.cell.initialized())
            .finish()
    }
}
