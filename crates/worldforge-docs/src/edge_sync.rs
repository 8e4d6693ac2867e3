//! Shared-vertex synchronization across adjacent landblocks
//!
//! Adjacent landblocks share their boundary vertices: the east edge of one
//! is the west edge of the next, and diagonal neighbours share one corner.
//! When a boundary vertex is written, the mirrored vertex on each neighbour
//! must receive the same value in the same transaction.

use std::collections::BTreeMap;

use worldforge_common::{Direction, LandblockCells, LandblockKey, TerrainField};

/// Per-landblock cell writes: landblock → cell index → packed value
pub type ChangeSet = BTreeMap<LandblockKey, BTreeMap<u8, u32>>;

/// The change-set applied by one transaction
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TerrainUpdate {
    /// Field written, `None` for whole-cell writes
    pub field: Option<TerrainField>,
    pub changes: ChangeSet,
}

impl TerrainUpdate {
    /// Landblocks touched by this update
    pub fn landblocks(&self) -> impl Iterator<Item = LandblockKey> + '_ {
        self.changes.keys().copied()
    }

    /// Value written to one cell, if any
    pub fn value(&self, key: LandblockKey, index: usize) -> Option<u32> {
        let index = u8::try_from(index).ok()?;
        self.changes.get(&key)?.get(&index).copied()
    }

    /// Number of cell writes
    pub fn len(&self) -> usize {
        self.changes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Derive the neighbour writes implied by a set of direct writes.
///
/// `post` holds the full post-write state of every directly written
/// landblock. `current` returns a neighbour's present value at an index, or
/// `None` when that neighbour must not be synchronized. A vertex is only
/// propagated when it was directly written, and only when the neighbour's
/// value differs. A direct write to the same neighbour vertex takes
/// precedence over a derived one.
pub fn derive_neighbor_changes<F>(
    direct: &ChangeSet,
    post: &BTreeMap<LandblockKey, LandblockCells>,
    mut current: F,
) -> ChangeSet
where
    F: FnMut(LandblockKey, usize) -> Option<u32>,
{
    let mut derived = ChangeSet::new();

    for (&key, written) in direct {
        let Some(state) = post.get(&key) else {
            continue;
        };

        for direction in Direction::ALL {
            let Some(neighbor) = key.neighbor(direction) else {
                continue;
            };
            let neighbor_direct = direct.get(&neighbor);

            for (src, dst) in direction.shared_vertices() {
                if !written.contains_key(&(src as u8)) {
                    continue;
                }
                if neighbor_direct.is_some_and(|cells| cells.contains_key(&(dst as u8))) {
                    continue;
                }

                let value = state[src];
                let existing = match post.get(&neighbor) {
                    Some(neighbor_state) => Some(neighbor_state[dst]),
                    None => current(neighbor, dst),
                };
                match existing {
                    Some(existing) if existing != value => {
                        derived
                            .entry(neighbor)
                            .or_default()
                            .entry(dst as u8)
                            .or_insert(value);
                    }
                    _ => {}
                }
            }
        }
    }

    derived
}

/// Merge derived writes into the direct ones; direct writes win
pub fn merge_changes(mut direct: ChangeSet, derived: ChangeSet) -> ChangeSet {
    for (key, cells) in derived {
        let target = direct.entry(key).or_default();
        for (index, value) in cells {
            target.entry(index).or_insert(value);
        }
    }
    direct
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashMap;
    use worldforge_common::{CELL_SIDE, cell_index};

    /// Fully populated zero grid where every landblock participates
    fn zero_lookup(_key: LandblockKey, _index: usize) -> Option<u32> {
        Some(0)
    }

    fn single(key: LandblockKey, index: usize, value: u32) -> (ChangeSet, BTreeMap<LandblockKey, LandblockCells>) {
        let mut direct = ChangeSet::new();
        direct.entry(key).or_default().insert(index as u8, value);
        let mut state = [0u32; 81];
        state[index] = value;
        (direct, BTreeMap::from([(key, state)]))
    }

    #[test]
    fn test_east_edge_syncs_to_neighbor() {
        let key = LandblockKey::from_raw(0x0101);
        let east = LandblockKey::from_raw(0x0201);
        for y in 0..CELL_SIDE {
            let (direct, post) = single(key, cell_index(8, y), 0xDEAD_0000 + y as u32);
            let derived = derive_neighbor_changes(&direct, &post, zero_lookup);
            assert_eq!(
                derived.get(&east).and_then(|c| c.get(&(cell_index(0, y) as u8))),
                Some(&(0xDEAD_0000 + y as u32))
            );
        }
    }

    #[test]
    fn test_interior_vertex_touches_nothing() {
        let (direct, post) = single(LandblockKey::from_raw(0x0101), cell_index(4, 4), 7);
        assert!(derive_neighbor_changes(&direct, &post, zero_lookup).is_empty());
    }

    #[test]
    fn test_corner_reaches_three_neighbors() {
        let key = LandblockKey::new(5, 5);
        let (direct, post) = single(key, cell_index(8, 8), 3);
        let derived = derive_neighbor_changes(&direct, &post, zero_lookup);

        assert_eq!(derived.len(), 3);
        assert_eq!(derived[&LandblockKey::new(6, 5)][&(cell_index(0, 8) as u8)], 3);
        assert_eq!(derived[&LandblockKey::new(5, 6)][&(cell_index(8, 0) as u8)], 3);
        assert_eq!(derived[&LandblockKey::new(6, 6)][&(cell_index(0, 0) as u8)], 3);
    }

    #[test]
    fn test_equal_values_and_ineligible_neighbors_skipped() {
        let key = LandblockKey::new(5, 5);
        let (direct, post) = single(key, cell_index(8, 4), 9);

        // neighbour already holds the value
        assert!(derive_neighbor_changes(&direct, &post, |_, _| Some(9)).is_empty());
        // neighbour does not participate
        assert!(derive_neighbor_changes(&direct, &post, |_, _| None).is_empty());
    }

    #[test]
    fn test_grid_edge_has_no_outside_neighbors() {
        let origin = LandblockKey::new(0, 0);
        let (direct, post) = single(origin, cell_index(0, 0), 1);
        let mut asked = Vec::new();
        let derived = derive_neighbor_changes(&direct, &post, |k, _| {
            asked.push(k);
            Some(0)
        });
        assert!(derived.is_empty());
        assert!(asked.is_empty());
    }

    #[test]
    fn test_direct_write_wins_over_derived() {
        let west = LandblockKey::new(1, 1);
        let east = LandblockKey::new(2, 1);
        let mut direct = ChangeSet::new();
        direct.entry(west).or_default().insert(cell_index(8, 2) as u8, 10);
        direct.entry(east).or_default().insert(cell_index(0, 2) as u8, 20);

        let mut west_state = [0u32; 81];
        west_state[cell_index(8, 2)] = 10;
        let mut east_state = [0u32; 81];
        east_state[cell_index(0, 2)] = 20;
        let post = BTreeMap::from([(west, west_state), (east, east_state)]);

        let derived = derive_neighbor_changes(&direct, &post, zero_lookup);
        assert!(!derived.get(&east).is_some_and(|c| c.contains_key(&(cell_index(0, 2) as u8))));
        assert!(!derived.get(&west).is_some_and(|c| c.contains_key(&(cell_index(8, 2) as u8))));

        let merged = merge_changes(direct, derived);
        assert_eq!(merged[&east][&(cell_index(0, 2) as u8)], 20);
        assert_eq!(merged[&west][&(cell_index(8, 2) as u8)], 10);
    }

    #[test]
    fn test_random_edits_leave_shared_edges_consistent() {
        let mut rng = rand::thread_rng();
        let mut grid: HashMap<LandblockKey, LandblockCells> = HashMap::new();
        for x in 0..4u8 {
            for y in 0..4u8 {
                grid.insert(LandblockKey::new(x, y), [0; 81]);
            }
        }

        for _ in 0..200 {
            let key = LandblockKey::new(rng.gen_range(0..4), rng.gen_range(0..4));
            let index = rng.gen_range(0..81usize);
            let value: u32 = rng.r#gen();

            let mut direct = ChangeSet::new();
            direct.entry(key).or_default().insert(index as u8, value);
            let mut state = grid[&key];
            state[index] = value;
            let post = BTreeMap::from([(key, state)]);

            let derived =
                derive_neighbor_changes(&direct, &post, |k, i| grid.get(&k).map(|c| c[i]));
            for (k, cells) in merge_changes(direct, derived) {
                let target = grid.get_mut(&k).unwrap();
                for (i, v) in cells {
                    target[usize::from(i)] = v;
                }
            }
        }

        for (&key, cells) in &grid {
            for direction in Direction::ALL {
                let Some(neighbor) = key.neighbor(direction) else {
                    continue;
                };
                let Some(other) = grid.get(&neighbor) else {
                    continue;
                };
                for (src, dst) in direction.shared_vertices() {
                    assert_eq!(cells[src], other[dst], "{key} {direction:?} {src}->{dst}");
                }
            }
        }
    }
}
