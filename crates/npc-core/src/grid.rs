//! Uniform spatial grid over NPC records.
//!
//! Cells are keyed by `floor(coord / cell_size)` on the horizontal plane;
//! height never affects the cell key, but radius queries filter on true 3-D
//! Euclidean distance. Query cost is proportional to the cells a radius
//! covers, not to the total record count.

use npc_events::Vec3;
use std::collections::BTreeMap;

use crate::record::RecordId;

/// A grid cell key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub x: i32,
    pub z: i32,
}

/// Uniform grid mapping cell -> records whose stored position lies in it.
#[derive(Debug)]
pub struct GridIndex {
    cell_size: f32,
    // BTreeMaps keep iteration deterministic for a given population.
    cells: BTreeMap<CellKey, BTreeMap<RecordId, Vec3>>,
    count: usize,
}

impl GridIndex {
    /// Creates a grid with the given cell edge length.
    pub fn new(cell_size: f32) -> Self {
        assert!(cell_size > 0.0, "cell size must be positive");
        Self {
            cell_size,
            cells: BTreeMap::new(),
            count: 0,
        }
    }

    /// The cell key covering a world position.
    pub fn cell_of(&self, pos: Vec3) -> CellKey {
        CellKey {
            x: (pos.x / self.cell_size).floor() as i32,
            z: (pos.z / self.cell_size).floor() as i32,
        }
    }

    /// Number of records currently indexed.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Inserts a record at the given position.
    pub fn add(&mut self, id: RecordId, pos: Vec3) {
        let key = self.cell_of(pos);
        let cell = self.cells.entry(key).or_default();
        if cell.insert(id, pos).is_none() {
            self.count += 1;
        }
    }

    /// Removes a record, using `pos` to locate its cell.
    ///
    /// Returns false if the record was not present in that cell.
    pub fn remove(&mut self, id: &RecordId, pos: Vec3) -> bool {
        let key = self.cell_of(pos);
        let Some(cell) = self.cells.get_mut(&key) else {
            return false;
        };
        let removed = cell.remove(id).is_some();
        if removed {
            self.count -= 1;
            if cell.is_empty() {
                self.cells.remove(&key);
            }
        }
        removed
    }

    /// Moves a record from `old_pos` to `new_pos`, relocating between cells
    /// only when the cell key actually changes.
    pub fn move_record(&mut self, id: &RecordId, old_pos: Vec3, new_pos: Vec3) {
        let old_key = self.cell_of(old_pos);
        let new_key = self.cell_of(new_pos);
        if old_key == new_key {
            if let Some(cell) = self.cells.get_mut(&old_key) {
                if let Some(stored) = cell.get_mut(id) {
                    *stored = new_pos;
                }
            }
            return;
        }
        if self.remove(id, old_pos) {
            self.add(id.clone(), new_pos);
        }
    }

    /// Whether the record is indexed in the cell covering `pos`.
    pub fn contains_at(&self, id: &RecordId, pos: Vec3) -> bool {
        let key = self.cell_of(pos);
        self.cells
            .get(&key)
            .map(|cell| cell.contains_key(id))
            .unwrap_or(false)
    }

    /// All records within `radius` of `center`, by true Euclidean distance.
    ///
    /// Enumerates the cells the radius covers and filters on stored
    /// positions; a record whose true distance is within the radius is never
    /// missed. Results come back in id order.
    pub fn query_radius(&self, center: Vec3, radius: f32) -> Vec<RecordId> {
        let mut hits = Vec::new();
        if radius < 0.0 {
            return hits;
        }
        let min = self.cell_of(Vec3::new(center.x - radius, 0.0, center.z - radius));
        let max = self.cell_of(Vec3::new(center.x + radius, 0.0, center.z + radius));
        let radius_sq = radius * radius;
        for cx in min.x..=max.x {
            for cz in min.z..=max.z {
                let Some(cell) = self.cells.get(&CellKey { x: cx, z: cz }) else {
                    continue;
                };
                for (id, pos) in cell {
                    if pos.distance_sq(center) <= radius_sq {
                        hits.push(id.clone());
                    }
                }
            }
        }
        hits.sort();
        hits
    }
}
