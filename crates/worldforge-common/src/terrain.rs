//! Terrain cell encoding and landblock vertex geometry
//!
//! A landblock is a 9×9 grid of vertices; vertex `(x, y)` lives at flat index
//! `x * 9 + y`. Each vertex stores four byte-sized fields packed into one
//! `u32` (field `i` occupies byte `i`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Vertices along one side of a landblock
pub const CELL_SIDE: usize = 9;

/// Vertices per landblock
pub const CELLS_PER_LANDBLOCK: usize = CELL_SIDE * CELL_SIDE;

/// Highest vertex coordinate on a landblock side
const EDGE: usize = CELL_SIDE - 1;

/// Full packed state of one landblock
pub type LandblockCells = [u32; CELLS_PER_LANDBLOCK];

/// Flat index of vertex `(x, y)`
#[must_use]
pub const fn cell_index(x: usize, y: usize) -> usize {
    x * CELL_SIDE + y
}

/// Vertex coordinates of a flat index
#[must_use]
pub const fn cell_coords(index: usize) -> (usize, usize) {
    (index / CELL_SIDE, index % CELL_SIDE)
}

/// Validate a flat cell index
pub fn check_cell_index(index: usize) -> Result<u8> {
    if index >= CELLS_PER_LANDBLOCK {
        return Err(Error::InvalidCellIndex(index));
    }
    Ok(index as u8)
}

/// Pack four field bytes into one cell value
#[must_use]
pub const fn pack(road: u8, scenery: u8, terrain_type: u8, height: u8) -> u32 {
    (road as u32) | ((scenery as u32) << 8) | ((terrain_type as u32) << 16) | ((height as u32) << 24)
}

/// Unpack a cell value into `(road, scenery, type, height)`
#[must_use]
pub const fn unpack(value: u32) -> (u8, u8, u8, u8) {
    (
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        ((value >> 16) & 0xFF) as u8,
        ((value >> 24) & 0xFF) as u8,
    )
}

/// One semantic field of a terrain cell
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerrainField {
    Road,
    Scenery,
    Type,
    Height,
}

impl TerrainField {
    /// All fields in byte order
    pub const ALL: [Self; 4] = [Self::Road, Self::Scenery, Self::Type, Self::Height];

    /// Byte position inside the packed value
    #[must_use]
    pub const fn byte(self) -> u32 {
        match self {
            Self::Road => 0,
            Self::Scenery => 1,
            Self::Type => 2,
            Self::Height => 3,
        }
    }

    /// Authorship bit for this field
    #[must_use]
    pub const fn mask(self) -> FieldMask {
        FieldMask(1 << self.byte())
    }

    /// Default (unset) value of this field
    #[must_use]
    pub const fn default_value(self) -> u8 {
        0
    }

    /// Name used in configuration and on the command line
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Road => "road",
            Self::Scenery => "scenery",
            Self::Type => "type",
            Self::Height => "height",
        }
    }
}

impl fmt::Display for TerrainField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TerrainField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "road" => Ok(Self::Road),
            "scenery" => Ok(Self::Scenery),
            "type" | "terrain" | "terrain_type" => Ok(Self::Type),
            "height" => Ok(Self::Height),
            _ => Err(Error::Configuration(format!("unknown terrain field: {s}"))),
        }
    }
}

/// Extract one field from a packed value
#[must_use]
pub const fn packed_field(value: u32, field: TerrainField) -> u8 {
    ((value >> (field.byte() * 8)) & 0xFF) as u8
}

/// Replace one field of a packed value
#[must_use]
pub const fn replace_field(value: u32, field: TerrainField, byte: u8) -> u32 {
    let shift = field.byte() * 8;
    (value & !(0xFF << shift)) | ((byte as u32) << shift)
}

/// Per-cell record of which fields a layer has authored
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask(u8);

impl FieldMask {
    /// No fields
    pub const NONE: Self = Self(0);
    /// All four fields
    pub const ALL: Self = Self(0x0F);

    /// Build from raw bits, dropping anything above the four field bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, field: TerrainField) -> bool {
        self.0 & field.mask().0 != 0
    }

    pub fn insert(&mut self, field: TerrainField) {
        self.0 |= field.mask().0;
    }

    pub fn remove(&mut self, field: TerrainField) {
        self.0 &= !field.mask().0;
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Fields present in this mask, in byte order
    pub fn fields(self) -> impl Iterator<Item = TerrainField> {
        TerrainField::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl From<TerrainField> for FieldMask {
    fn from(field: TerrainField) -> Self {
        field.mask()
    }
}

/// Unpacked terrain cell
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerrainEntry {
    pub road: u8,
    pub scenery: u8,
    pub terrain_type: u8,
    pub height: u8,
}

impl TerrainEntry {
    #[must_use]
    pub const fn new(road: u8, scenery: u8, terrain_type: u8, height: u8) -> Self {
        Self {
            road,
            scenery,
            terrain_type,
            height,
        }
    }

    #[must_use]
    pub const fn from_packed(value: u32) -> Self {
        let (road, scenery, terrain_type, height) = unpack(value);
        Self::new(road, scenery, terrain_type, height)
    }

    #[must_use]
    pub const fn to_packed(self) -> u32 {
        pack(self.road, self.scenery, self.terrain_type, self.height)
    }

    #[must_use]
    pub const fn field(self, field: TerrainField) -> u8 {
        match field {
            TerrainField::Road => self.road,
            TerrainField::Scenery => self.scenery,
            TerrainField::Type => self.terrain_type,
            TerrainField::Height => self.height,
        }
    }

    #[must_use]
    pub const fn with_field(mut self, field: TerrainField, value: u8) -> Self {
        match field {
            TerrainField::Road => self.road = value,
            TerrainField::Scenery => self.scenery = value,
            TerrainField::Type => self.terrain_type = value,
            TerrainField::Height => self.height = value,
        }
        self
    }
}

impl From<u32> for TerrainEntry {
    fn from(value: u32) -> Self {
        Self::from_packed(value)
    }
}

impl From<TerrainEntry> for u32 {
    fn from(entry: TerrainEntry) -> Self {
        entry.to_packed()
    }
}

/// Grid neighbour of a landblock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
}

impl Direction {
    pub const ALL: [Self; 8] = [
        Self::North,
        Self::South,
        Self::East,
        Self::West,
        Self::NorthEast,
        Self::NorthWest,
        Self::SouthEast,
        Self::SouthWest,
    ];

    /// Grid offset `(dx, dy)`: east is `+x`, north is `+y`
    #[must_use]
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Self::North => (0, 1),
            Self::South => (0, -1),
            Self::East => (1, 0),
            Self::West => (-1, 0),
            Self::NorthEast => (1, 1),
            Self::NorthWest => (-1, 1),
            Self::SouthEast => (1, -1),
            Self::SouthWest => (-1, -1),
        }
    }

    /// Shared vertices as `(source_index, neighbour_index)` pairs.
    ///
    /// Edge neighbours share nine vertices, diagonal neighbours one corner.
    #[must_use]
    pub fn shared_vertices(self) -> Vec<(usize, usize)> {
        match self {
            Self::East => (0..CELL_SIDE)
                .map(|y| (cell_index(EDGE, y), cell_index(0, y)))
                .collect(),
            Self::West => (0..CELL_SIDE)
                .map(|y| (cell_index(0, y), cell_index(EDGE, y)))
                .collect(),
            Self::North => (0..CELL_SIDE)
                .map(|x| (cell_index(x, EDGE), cell_index(x, 0)))
                .collect(),
            Self::South => (0..CELL_SIDE)
                .map(|x| (cell_index(x, 0), cell_index(x, EDGE)))
                .collect(),
            Self::NorthEast => vec![(cell_index(EDGE, EDGE), cell_index(0, 0))],
            Self::NorthWest => vec![(cell_index(0, EDGE), cell_index(EDGE, 0))],
            Self::SouthEast => vec![(cell_index(EDGE, 0), cell_index(0, EDGE))],
            Self::SouthWest => vec![(cell_index(0, 0), cell_index(EDGE, EDGE))],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_pack_layout() {
        assert_eq!(pack(0x04, 0x03, 0x02, 0x01), 0x0102_0304);
        assert_eq!(unpack(0x0102_0304), (0x04, 0x03, 0x02, 0x01));
        assert_eq!(pack(0xFF, 0, 0, 0), 0xFF);
        assert_eq!(pack(0, 0, 0, 0xFF), 0xFF00_0000);
    }

    #[test]
    fn test_codec_roundtrip_exhaustive_per_field() {
        // Each field independently across its full range, others held at
        // distinct sentinels so a bleed between bytes would show.
        for v in 0..=255u8 {
            assert_eq!(unpack(pack(v, 0xA5, 0x5A, 0x3C)), (v, 0xA5, 0x5A, 0x3C));
            assert_eq!(unpack(pack(0xA5, v, 0x5A, 0x3C)), (0xA5, v, 0x5A, 0x3C));
            assert_eq!(unpack(pack(0xA5, 0x5A, v, 0x3C)), (0xA5, 0x5A, v, 0x3C));
            assert_eq!(unpack(pack(0xA5, 0x5A, 0x3C, v)), (0xA5, 0x5A, 0x3C, v));
        }
    }

    #[test]
    fn test_codec_bijection_on_random_words() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let word: u32 = rng.r#gen();
            let (r, s, t, h) = unpack(word);
            assert_eq!(pack(r, s, t, h), word);
        }
    }

    #[test]
    fn test_field_access() {
        let value = pack(1, 2, 3, 4);
        assert_eq!(packed_field(value, TerrainField::Road), 1);
        assert_eq!(packed_field(value, TerrainField::Height), 4);
        let value = replace_field(value, TerrainField::Scenery, 0xEE);
        assert_eq!(unpack(value), (1, 0xEE, 3, 4));

        let entry = TerrainEntry::from_packed(value).with_field(TerrainField::Type, 9);
        assert_eq!(entry.field(TerrainField::Type), 9);
        assert_eq!(entry.to_packed(), pack(1, 0xEE, 9, 4));
    }

    #[test]
    fn test_field_mask_bits() {
        assert_eq!(TerrainField::Road.mask().bits(), 0x1);
        assert_eq!(TerrainField::Scenery.mask().bits(), 0x2);
        assert_eq!(TerrainField::Type.mask().bits(), 0x4);
        assert_eq!(TerrainField::Height.mask().bits(), 0x8);

        let mut mask = FieldMask::NONE;
        mask.insert(TerrainField::Height);
        mask.insert(TerrainField::Road);
        assert_eq!(mask.bits(), 0x9);
        assert!(mask.contains(TerrainField::Road));
        assert!(!mask.contains(TerrainField::Type));
        mask.remove(TerrainField::Road);
        mask.remove(TerrainField::Height);
        assert!(mask.is_empty());
        assert_eq!(FieldMask::from_bits(0xFF), FieldMask::ALL);
    }

    #[test]
    fn test_cell_index_layout() {
        assert_eq!(cell_index(0, 8), 8);
        assert_eq!(cell_index(8, 0), 72);
        assert_eq!(cell_index(8, 8), 80);
        assert_eq!(cell_coords(40), (4, 4));
        assert!(check_cell_index(80).is_ok());
        assert!(check_cell_index(81).is_err());
    }

    #[test]
    fn test_shared_vertices_mirror() {
        let east = Direction::East.shared_vertices();
        assert_eq!(east.len(), 9);
        assert!(east.contains(&(cell_index(8, 3), cell_index(0, 3))));

        let north = Direction::North.shared_vertices();
        assert!(north.contains(&(8, 0)));

        assert_eq!(Direction::NorthEast.shared_vertices(), vec![(80, 0)]);
        assert_eq!(Direction::SouthWest.shared_vertices(), vec![(0, 80)]);
        assert_eq!(Direction::NorthWest.shared_vertices(), vec![(8, 72)]);
        assert_eq!(Direction::SouthEast.shared_vertices(), vec![(72, 8)]);
    }

    #[test]
    fn test_shared_vertices_are_symmetric() {
        let opposite = |d: Direction| match d {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::NorthEast => Direction::SouthWest,
            Direction::SouthWest => Direction::NorthEast,
            Direction::NorthWest => Direction::SouthEast,
            Direction::SouthEast => Direction::NorthWest,
        };
        for dir in Direction::ALL {
            let forward = dir.shared_vertices();
            let back: Vec<_> = opposite(dir)
                .shared_vertices()
                .into_iter()
                .map(|(a, b)| (b, a))
                .collect();
            assert_eq!(forward, back, "{dir:?}");
        }
    }
}
