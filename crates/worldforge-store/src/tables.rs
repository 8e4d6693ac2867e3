//! Redb table definitions

use redb::TableDefinition;

// Document store
// Key: document id, Value: bincode-encoded DocumentRecord
pub const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

// Asset archive
// Key: record id ((landblock << 16) | subtype), Value: bincode-encoded LandblockRecord
pub const LANDBLOCKS: TableDefinition<u32, &[u8]> = TableDefinition::new("landblocks");
pub const ARCHIVE_META: TableDefinition<&str, u32> = TableDefinition::new("meta");

pub const META_ITERATION: &str = "iteration";
