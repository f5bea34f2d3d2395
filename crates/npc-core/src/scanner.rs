//! Proximity scanning with hysteresis.
//!
//! At a fixed interval the scanner compares every observer position against
//! the population: inactive records inside the near radius become
//! activation candidates, active records beyond the far radius of every
//! observer become deactivation candidates. The gap between the two radii
//! is the hysteresis band; a record sitting in it keeps whatever tier it
//! already has, so nobody flickers at a radius boundary.
//!
//! The scan produces a decision snapshot rather than acting directly; the
//! world applies both lists in one place so ordering stays explicit.

use npc_events::Vec3;

use crate::grid::GridIndex;
use crate::record::{RecordId, RecordTable};

/// One scan's worth of tier changes, activations nearest-first.
#[derive(Debug, Default)]
pub struct ScanDecisions {
    pub activate: Vec<RecordId>,
    pub deactivate: Vec<RecordId>,
}

impl ScanDecisions {
    pub fn is_empty(&self) -> bool {
        self.activate.is_empty() && self.deactivate.is_empty()
    }
}

#[derive(Debug)]
pub struct ProximityScanner {
    interval: f32,
    elapsed: f32,
    near: f32,
    far: f32,
}

impl ProximityScanner {
    pub fn new(interval: f32, near_radius: f32, far_radius: f32) -> Self {
        Self {
            interval,
            elapsed: 0.0,
            near: near_radius,
            far: far_radius,
        }
    }

    /// Advances the scan timer; returns decisions when a scan fires, `None`
    /// between scans. Passing no observers deactivates everyone, which is
    /// what an empty area should do.
    pub fn tick(
        &mut self,
        dt: f32,
        observers: &[Vec3],
        records: &RecordTable,
        grid: &GridIndex,
    ) -> Option<ScanDecisions> {
        self.elapsed += dt;
        if self.elapsed < self.interval {
            return None;
        }
        self.elapsed = 0.0;
        Some(self.scan(observers, records, grid))
    }

    /// Runs one scan immediately.
    pub fn scan(
        &self,
        observers: &[Vec3],
        records: &RecordTable,
        grid: &GridIndex,
    ) -> ScanDecisions {
        let mut decisions = ScanDecisions::default();

        // Activation: inactive records are in the grid, so each observer is
        // one radius query. Near-first ordering decides who gets instances
        // when the pool runs short.
        let mut candidates: Vec<(f32, RecordId)> = Vec::new();
        for &observer in observers {
            for id in grid.query_radius(observer, self.near) {
                let Some(record) = records.get(&id) else {
                    continue;
                };
                if record.active {
                    continue;
                }
                let dist = record.position.distance_sq(observer);
                if let Some(idx) = candidates.iter().position(|(_, c)| *c == id) {
                    candidates[idx].0 = candidates[idx].0.min(dist);
                } else {
                    candidates.push((dist, id));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        decisions.activate = candidates.into_iter().map(|(_, id)| id).collect();

        // Deactivation: active records left the grid at activation, so walk
        // the table. A record stays active while any observer is within the
        // far radius.
        let far_sq = self.far * self.far;
        for record in records.iter() {
            if !record.active {
                continue;
            }
            let near_someone = observers
                .iter()
                .any(|o| record.position.distance_sq(*o) <= far_sq);
            if !near_someone {
                decisions.deactivate.push(record.id.clone());
            }
        }
        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NpcRecord;

    fn table_with(records: Vec<NpcRecord>) -> (RecordTable, GridIndex) {
        let mut table = RecordTable::new();
        let mut grid = GridIndex::new(16.0);
        for record in records {
            if !record.active {
                grid.add(record.id.clone(), record.position);
            }
            table.insert(record).unwrap();
        }
        (table, grid)
    }

    fn npc(id: &str, pos: Vec3) -> NpcRecord {
        NpcRecord::new(RecordId::from(id), "villager", pos, 0.0)
    }

    #[test]
    fn activates_inside_near_radius_only() {
        let (table, grid) = table_with(vec![
            npc("close", Vec3::new(10.0, 0.0, 0.0)),
            npc("band", Vec3::new(45.0, 0.0, 0.0)),
            npc("far", Vec3::new(90.0, 0.0, 0.0)),
        ]);
        let scanner = ProximityScanner::new(0.5, 40.0, 55.0);
        let d = scanner.scan(&[Vec3::ZERO], &table, &grid);
        assert_eq!(d.activate, vec![RecordId::from("close")]);
        assert!(d.deactivate.is_empty());
    }

    #[test]
    fn hysteresis_band_leaves_active_records_alone() {
        let mut band = npc("band", Vec3::new(45.0, 0.0, 0.0));
        band.active = true;
        let (table, grid) = table_with(vec![band]);
        let scanner = ProximityScanner::new(0.5, 40.0, 55.0);
        // 45 is outside near but inside far: no decision either way.
        let d = scanner.scan(&[Vec3::ZERO], &table, &grid);
        assert!(d.is_empty());
    }

    #[test]
    fn deactivates_beyond_far_radius_of_all_observers() {
        let mut roamer = npc("roamer", Vec3::new(60.0, 0.0, 0.0));
        roamer.active = true;
        let (table, grid) = table_with(vec![roamer]);
        let scanner = ProximityScanner::new(0.5, 40.0, 55.0);

        // A second observer nearby keeps the record active.
        let d = scanner.scan(&[Vec3::ZERO, Vec3::new(70.0, 0.0, 0.0)], &table, &grid);
        assert!(d.deactivate.is_empty());

        let d = scanner.scan(&[Vec3::ZERO], &table, &grid);
        assert_eq!(d.deactivate, vec![RecordId::from("roamer")]);
    }

    #[test]
    fn activation_order_is_nearest_first_across_observers() {
        let (table, grid) = table_with(vec![
            npc("b_mid", Vec3::new(20.0, 0.0, 0.0)),
            npc("a_near", Vec3::new(5.0, 0.0, 0.0)),
            npc("c_other", Vec3::new(100.0, 0.0, 3.0)),
        ]);
        let scanner = ProximityScanner::new(0.5, 40.0, 55.0);
        let d = scanner.scan(&[Vec3::ZERO, Vec3::new(100.0, 0.0, 0.0)], &table, &grid);
        assert_eq!(
            d.activate,
            vec![
                RecordId::from("c_other"),
                RecordId::from("a_near"),
                RecordId::from("b_mid"),
            ]
        );
    }

    #[test]
    fn no_observers_deactivates_everyone() {
        let mut a = npc("a", Vec3::new(1.0, 0.0, 0.0));
        a.active = true;
        let (table, grid) = table_with(vec![a]);
        let scanner = ProximityScanner::new(0.5, 40.0, 55.0);
        let d = scanner.scan(&[], &table, &grid);
        assert_eq!(d.deactivate, vec![RecordId::from("a")]);
    }

    #[test]
    fn timer_gates_scans_to_the_interval() {
        let (table, grid) = table_with(vec![npc("close", Vec3::new(10.0, 0.0, 0.0))]);
        let mut scanner = ProximityScanner::new(0.5, 40.0, 55.0);
        assert!(scanner.tick(0.2, &[Vec3::ZERO], &table, &grid).is_none());
        assert!(scanner.tick(0.2, &[Vec3::ZERO], &table, &grid).is_none());
        let d = scanner.tick(0.2, &[Vec3::ZERO], &table, &grid);
        assert_eq!(d.unwrap().activate.len(), 1);
    }
}
