//! Worldforge Common - Shared types and utilities
//!
//! This crate provides the identity types, terrain cell codec, error
//! definitions and configuration used across all Worldforge components.

pub mod config;
pub mod error;
pub mod terrain;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use terrain::{
    CELL_SIDE, CELLS_PER_LANDBLOCK, Direction, FieldMask, LandblockCells, TerrainEntry,
    TerrainField, cell_coords, cell_index, check_cell_index, pack, packed_field, replace_field,
    unpack,
};
pub use types::{DocumentId, DocumentKind, GRID_EXTENT, LandblockKey};
