//! Core identity types for Worldforge
//!
//! Landblock addresses, document identities and document kind tags.

use crate::error::{Error, Result};
use crate::terrain::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of landblocks along each axis of the world grid.
pub const GRID_EXTENT: u16 = 255;

/// Address of a landblock: `(block_x << 8) | block_y`.
///
/// `x` grows towards the east and `y` towards the north.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandblockKey(u16);

impl LandblockKey {
    /// Create a key from grid coordinates
    #[must_use]
    pub const fn new(x: u8, y: u8) -> Self {
        Self(((x as u16) << 8) | y as u16)
    }

    /// Create a key from its raw 16-bit form
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw 16-bit form
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Grid column (east-west)
    #[must_use]
    pub const fn x(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Grid row (south-north)
    #[must_use]
    pub const fn y(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Whether both coordinates lie inside the world grid
    #[must_use]
    pub const fn in_grid(self) -> bool {
        (self.x() as u16) < GRID_EXTENT && (self.y() as u16) < GRID_EXTENT
    }

    /// The adjacent landblock in `direction`, or `None` past the grid edge.
    #[must_use]
    pub fn neighbor(self, direction: Direction) -> Option<Self> {
        let (dx, dy) = direction.offset();
        let x = i32::from(self.x()) + dx;
        let y = i32::from(self.y()) + dy;
        let extent = i32::from(GRID_EXTENT);
        if !(0..extent).contains(&x) || !(0..extent).contains(&y) {
            return None;
        }
        Some(Self::new(x as u8, y as u8))
    }

    /// Iterate every landblock address of the world grid
    pub fn all() -> impl Iterator<Item = Self> {
        (0..GRID_EXTENT).flat_map(|x| (0..GRID_EXTENT).map(move |y| Self::new(x as u8, y as u8)))
    }
}

impl fmt::Display for LandblockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for LandblockKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u16::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| Error::InvalidLandblockKey(s.to_string()))
    }
}

impl From<u16> for LandblockKey {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

/// Globally unique, immutable document identity within a project
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a document id, rejecting empty strings
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidDocumentId(id));
        }
        Ok(Self(id))
    }

    /// Borrow the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Concrete document type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Authoritative outdoor terrain
    Terrain,
    /// Stackable sparse terrain layer
    Layer,
}

impl DocumentKind {
    /// Get the stable tag stored alongside persisted documents
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Terrain => "terrain",
            Self::Layer => "layer",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for DocumentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "terrain" => Ok(Self::Terrain),
            "layer" => Ok(Self::Layer),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_landblock_key_coords() {
        let key = LandblockKey::new(0x12, 0x34);
        assert_eq!(key.raw(), 0x1234);
        assert_eq!(key.x(), 0x12);
        assert_eq!(key.y(), 0x34);
        assert_eq!(key.to_string(), "1234");
    }

    #[test]
    fn test_landblock_key_parse() {
        assert_eq!("0x0201".parse::<LandblockKey>().unwrap(), LandblockKey::new(2, 1));
        assert_eq!("A9B4".parse::<LandblockKey>().unwrap(), LandblockKey::new(0xA9, 0xB4));
        assert!("zz".parse::<LandblockKey>().is_err());
    }

    #[test]
    fn test_neighbor_directions() {
        let key = LandblockKey::new(1, 1);
        assert_eq!(key.neighbor(Direction::East), Some(LandblockKey::new(2, 1)));
        assert_eq!(key.neighbor(Direction::West), Some(LandblockKey::new(0, 1)));
        assert_eq!(key.neighbor(Direction::North), Some(LandblockKey::new(1, 2)));
        assert_eq!(key.neighbor(Direction::South), Some(LandblockKey::new(1, 0)));
        assert_eq!(key.neighbor(Direction::NorthEast), Some(LandblockKey::new(2, 2)));
        assert_eq!(key.neighbor(Direction::SouthWest), Some(LandblockKey::new(0, 0)));
    }

    #[test]
    fn test_neighbor_grid_edges() {
        let origin = LandblockKey::new(0, 0);
        assert_eq!(origin.neighbor(Direction::West), None);
        assert_eq!(origin.neighbor(Direction::South), None);
        assert_eq!(origin.neighbor(Direction::NorthWest), None);
        assert!(origin.neighbor(Direction::NorthEast).is_some());

        let far = LandblockKey::new(254, 254);
        assert_eq!(far.neighbor(Direction::East), None);
        assert_eq!(far.neighbor(Direction::North), None);
        assert!(far.neighbor(Direction::SouthWest).is_some());

        // 0xFF is outside the grid
        assert_eq!(LandblockKey::new(254, 3).neighbor(Direction::East), None);
        assert!(!LandblockKey::new(255, 3).in_grid());
    }

    #[test]
    fn test_all_keys_count() {
        assert_eq!(LandblockKey::all().count(), 255 * 255);
        assert!(LandblockKey::all().all(LandblockKey::in_grid));
    }

    #[test]
    fn test_document_id_rejects_empty() {
        assert!(DocumentId::new("").is_err());
        assert!(DocumentId::new("   ").is_err());
        assert_eq!(DocumentId::new("terrain").unwrap().as_str(), "terrain");
    }

    #[test]
    fn test_document_kind_tags() {
        assert_eq!(DocumentKind::Terrain.tag(), "terrain");
        assert_eq!("LAYER".parse::<DocumentKind>().unwrap(), DocumentKind::Layer);
        assert!("dungeon".parse::<DocumentKind>().is_err());
    }
}
