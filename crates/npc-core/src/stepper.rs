//! Batched low-frequency stepping for the reduced tier.
//!
//! Inactive records inside the simulation radius still need to move along
//! their coarse state machines, but never all at once. The stepper keeps a
//! round-robin cursor over the eligible set and each firing steps at most
//! `max_per_tick` records, handing each the wall time accrued since its own
//! last step so coarse kinematics stay rate-correct regardless of batch
//! position.

use npc_events::Vec3;
use std::collections::{BTreeMap, VecDeque};

use crate::grid::GridIndex;
use crate::record::{RecordId, RecordTable};
use crate::reduced::{self, ReducedEnv};

#[derive(Debug)]
pub struct SimulationStepper {
    interval: f32,
    elapsed: f32,
    sim_radius: f32,
    max_per_tick: usize,
    cursor: VecDeque<RecordId>,
    /// Running clock value when each queued record was last stepped.
    last_stepped: BTreeMap<RecordId, f32>,
    now: f32,
}

impl SimulationStepper {
    pub fn new(interval: f32, sim_radius: f32, max_per_tick: usize) -> Self {
        Self {
            interval,
            elapsed: 0.0,
            sim_radius,
            max_per_tick: max_per_tick.max(1),
            cursor: VecDeque::new(),
            last_stepped: BTreeMap::new(),
            now: 0.0,
        }
    }

    /// Records currently enqueued for coarse stepping.
    pub fn queue_len(&self) -> usize {
        self.cursor.len()
    }

    /// Advances the timer; on each firing, refreshes the eligible set and
    /// steps the next batch. Returns how many records were stepped.
    pub fn tick(
        &mut self,
        dt: f32,
        observers: &[Vec3],
        records: &mut RecordTable,
        grid: &mut GridIndex,
        env: &mut ReducedEnv<'_>,
    ) -> usize {
        self.now += dt;
        self.elapsed += dt;
        if self.elapsed < self.interval {
            return 0;
        }
        self.elapsed = 0.0;

        self.refresh_eligible(observers, records, grid);

        let batch = self.cursor.len().min(self.max_per_tick);
        let mut stepped = 0;
        for _ in 0..batch {
            let Some(id) = self.cursor.pop_front() else {
                break;
            };
            let since = self.now - self.last_stepped.get(&id).copied().unwrap_or(self.now);
            if let Some(record) = records.get_mut(&id) {
                let before = record.position;
                reduced::tick(record, since, env);
                // Coarse motion must keep the spatial index honest.
                if record.position != before {
                    grid.move_record(&id, before, record.position);
                }
            }
            self.last_stepped.insert(id.clone(), self.now);
            self.cursor.push_back(id);
            stepped += 1;
        }
        stepped
    }

    /// Rebuilds the eligible set: inactive records within the simulation
    /// radius of any observer. Still-eligible records keep their cursor
    /// position; newcomers join at the back.
    fn refresh_eligible(&mut self, observers: &[Vec3], records: &RecordTable, grid: &GridIndex) {
        let mut eligible: Vec<RecordId> = Vec::new();
        for &observer in observers {
            for id in grid.query_radius(observer, self.sim_radius) {
                let is_inactive = records.get(&id).map(|r| !r.active).unwrap_or(false);
                if is_inactive && !eligible.contains(&id) {
                    eligible.push(id);
                }
            }
        }

        self.cursor.retain(|id| eligible.contains(id));
        let now = self.now;
        for id in eligible {
            if !self.cursor.contains(&id) {
                self.last_stepped.entry(id.clone()).or_insert(now);
                self.cursor.push_back(id);
            }
        }
        let queued: Vec<RecordId> = self.cursor.iter().cloned().collect();
        self.last_stepped.retain(|id, _| queued.contains(id));
    }

    /// Drops a record from the rotation (it was promoted to full).
    pub fn remove(&mut self, id: &RecordId) {
        self.cursor.retain(|c| c != id);
        self.last_stepped.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PathRegistry};
    use crate::record::NpcRecord;
    use npc_events::DayTime;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    struct Fixture {
        config: Config,
        paths: PathRegistry,
        records: RecordTable,
        grid: GridIndex,
        rng: SmallRng,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config::demo();
            let paths = PathRegistry::from_config(&config);
            Self {
                config,
                paths,
                records: RecordTable::new(),
                grid: GridIndex::new(16.0),
                rng: SmallRng::seed_from_u64(3),
            }
        }

        fn add_inactive(&mut self, id: &str, pos: Vec3) {
            let rec = NpcRecord::new(RecordId::from(id), "villager", pos, 0.0);
            self.grid.add(rec.id.clone(), rec.position);
            self.records.insert(rec).unwrap();
        }
    }

    macro_rules! mk_env {
        ($f:expr, $clock:expr) => {
            ReducedEnv {
                paths: &$f.paths,
                tuning: &$f.config.tuning,
                clock: $clock,
                rng: &mut $f.rng,
            }
        };
    }

    #[test]
    fn batches_are_capped_and_round_robin() {
        let mut f = Fixture::new();
        for i in 0..5 {
            f.add_inactive(&format!("npc_{i}"), Vec3::new(i as f32 * 2.0, 0.0, 0.0));
        }
        let mut stepper = SimulationStepper::new(1.0, 120.0, 2);
        let observers = [Vec3::ZERO];

        let mut env = mk_env!(f, DayTime::new(12, 0));
        let n = stepper.tick(1.0, &observers, &mut f.records, &mut f.grid, &mut env);
        assert_eq!(n, 2);
        assert_eq!(stepper.queue_len(), 5);

        // Three more firings cycle through everyone and wrap around.
        let mut first_batch = stepper.cursor.iter().take(3).cloned().collect::<Vec<_>>();
        let mut env = mk_env!(f, DayTime::new(12, 0));
        stepper.tick(1.0, &observers, &mut f.records, &mut f.grid, &mut env);
        let head: Vec<RecordId> = stepper.cursor.iter().take(1).cloned().collect();
        first_batch.truncate(1);
        assert_ne!(head, first_batch, "cursor should have advanced");
    }

    #[test]
    fn nothing_happens_between_firings() {
        let mut f = Fixture::new();
        f.add_inactive("npc_0", Vec3::new(1.0, 0.0, 0.0));
        let mut stepper = SimulationStepper::new(1.0, 120.0, 8);
        let mut env = mk_env!(f, DayTime::new(12, 0));
        let n = stepper.tick(0.4, &[Vec3::ZERO], &mut f.records, &mut f.grid, &mut env);
        assert_eq!(n, 0);
        assert_eq!(stepper.queue_len(), 0);
    }

    #[test]
    fn out_of_radius_records_leave_the_rotation() {
        let mut f = Fixture::new();
        f.add_inactive("near", Vec3::new(5.0, 0.0, 0.0));
        f.add_inactive("far", Vec3::new(500.0, 0.0, 0.0));
        let mut stepper = SimulationStepper::new(1.0, 120.0, 8);
        let mut env = mk_env!(f, DayTime::new(12, 0));
        stepper.tick(1.0, &[Vec3::ZERO], &mut f.records, &mut f.grid, &mut env);
        assert_eq!(stepper.queue_len(), 1);
    }

    #[test]
    fn stepped_motion_updates_the_grid() {
        let mut f = Fixture::new();
        // Walking a path moves the record; the index must follow.
        let start = Vec3::new(10.0, 0.0, 0.0);
        f.add_inactive("walker", start);
        {
            let rec = f.records.get_mut(&RecordId::from("walker")).unwrap();
            rec.day_start_path = Some("market_walk".to_string());
            rec.state = npc_events::StateTag::Reduced(npc_events::ReducedTag::FollowingPath);
            rec.path.start("market_walk");
            rec.path.waypoint = 1;
            rec.target_position = Some(Vec3::new(20.0, 0.0, 10.0));
        }
        let mut stepper = SimulationStepper::new(1.0, 120.0, 8);
        for _ in 0..30 {
            let mut env = mk_env!(f, DayTime::new(12, 0));
            stepper.tick(1.0, &[Vec3::ZERO], &mut f.records, &mut f.grid, &mut env);
        }
        let rec = f.records.get(&RecordId::from("walker")).unwrap();
        assert_ne!(rec.position, start);
        assert!(f.grid.contains_at(&rec.id, rec.position));
    }

    #[test]
    fn promoted_records_can_be_removed() {
        let mut f = Fixture::new();
        f.add_inactive("npc_0", Vec3::new(1.0, 0.0, 0.0));
        let mut stepper = SimulationStepper::new(1.0, 120.0, 8);
        let mut env = mk_env!(f, DayTime::new(12, 0));
        stepper.tick(1.0, &[Vec3::ZERO], &mut f.records, &mut f.grid, &mut env);
        assert_eq!(stepper.queue_len(), 1);
        stepper.remove(&RecordId::from("npc_0"));
        assert_eq!(stepper.queue_len(), 0);
    }
}
