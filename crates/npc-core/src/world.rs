//! The assembled population manager.
//!
//! `NpcWorld` owns every subsystem and fixes the per-cycle ordering:
//! completed pool returns first, then inconsistency resyncs, then the
//! proximity scan with its decisions applied in full, then the reduced
//! batch, then navigation and the full-tier machines, and finally event
//! routing. Hosts drive it with `tick` and a slice of observer positions.

use npc_events::{DayTime, NpcEvent, Vec3, MINUTES_PER_DAY};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError, PathRegistry};
use crate::coordinator::{ActivationCoordinator, ActivationError, TierStats};
use crate::grid::GridIndex;
use crate::mapper::StateMapper;
use crate::record::{NpcRecord, RecordId, RecordTable};
use crate::reduced::{self, ReducedEnv};
use crate::runner::{BehaviorRegistry, RunnerDeps, StateMachineRunner};
use crate::scanner::ProximityScanner;
use crate::services::{
    EventBus, FixedPool, InstancePool, Navigator, ServiceRegistry, StraightLineNav,
};
use crate::stepper::SimulationStepper;

/// In-world time of day, advanced at a configurable rate.
#[derive(Debug)]
pub struct WorldClock {
    start: DayTime,
    minutes_per_second: f32,
    elapsed: f32,
}

impl WorldClock {
    pub fn new(start: DayTime, minutes_per_second: f32) -> Self {
        Self {
            start,
            minutes_per_second,
            elapsed: 0.0,
        }
    }

    pub fn advance(&mut self, dt: f32) {
        self.elapsed += dt;
    }

    pub fn now(&self) -> DayTime {
        let minutes = self.start.minutes() as f32 + self.elapsed * self.minutes_per_second;
        DayTime::from_minutes(minutes as u32 % MINUTES_PER_DAY)
    }
}

pub struct NpcWorld {
    config: Config,
    records: RecordTable,
    grid: GridIndex,
    pool: Box<dyn InstancePool>,
    nav: Box<dyn Navigator>,
    services: ServiceRegistry,
    bus: EventBus,
    paths: PathRegistry,
    mapper: StateMapper,
    rng: SmallRng,
    runner: StateMachineRunner,
    coordinator: ActivationCoordinator,
    scanner: ProximityScanner,
    stepper: SimulationStepper,
    clock: WorldClock,
}

impl NpcWorld {
    /// Builds a world with in-crate pool and navigation implementations.
    pub fn from_config(config: Config, seed: u64) -> Result<Self, ConfigError> {
        let pool = Box::new(FixedPool::from_config(&config));
        let nav = Box::new(StraightLineNav::from_tuning(&config.tuning));
        Self::with_backends(config, seed, pool, nav)
    }

    /// Builds a world against host-supplied pool and navigation backends.
    pub fn with_backends(
        config: Config,
        seed: u64,
        pool: Box<dyn InstancePool>,
        nav: Box<dyn Navigator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mapper = StateMapper::standard();
        mapper.validate()?;

        let paths = PathRegistry::from_config(&config);
        let services = ServiceRegistry::from_config(&config);
        let runner = StateMachineRunner::new(BehaviorRegistry::standard(&config));
        let scanner = ProximityScanner::new(
            config.tuning.scan_interval,
            config.tuning.near_radius,
            config.tuning.far_radius,
        );
        let stepper = SimulationStepper::new(
            config.tuning.step_interval,
            config.tuning.sim_radius,
            config.tuning.max_per_tick,
        );
        let clock = WorldClock::new(config.tuning.start_time, config.tuning.minutes_per_second);

        let mut world = Self {
            records: RecordTable::new(),
            grid: GridIndex::new(config.tuning.cell_size),
            pool,
            nav,
            services,
            bus: EventBus::new(),
            paths,
            mapper,
            rng: SmallRng::seed_from_u64(seed),
            runner,
            coordinator: ActivationCoordinator::new(),
            scanner,
            stepper,
            clock,
            config,
        };
        world.spawn_records()?;
        info!(
            npcs = world.records.len(),
            start = %world.clock.now(),
            "population manager initialized"
        );
        Ok(world)
    }

    /// Creates a record per configured NPC, placed by the reduced tier.
    fn spawn_records(&mut self) -> Result<(), ConfigError> {
        let clock = self.clock.now();
        for npc in &self.config.npcs {
            let home = Vec3::new(npc.home[0], npc.home[1], npc.home[2]);
            let mut record =
                NpcRecord::new(RecordId::new(npc.id.clone()), npc.template.clone(), home, npc.rotation);
            record.schedule_start = npc.schedule_start;
            record.schedule_end = npc.schedule_end;
            record.can_start_day = npc.can_start_day;
            record.day_start_path = npc.day_start_path.clone();
            record.service = npc.service.clone();
            record.overrides = npc.overrides.clone();
            record.assignment = npc.assignment.clone();

            let mut env = ReducedEnv {
                paths: &self.paths,
                tuning: &self.config.tuning,
                clock,
                rng: &mut self.rng,
            };
            reduced::place_initial(&mut record, &mut env);

            self.grid.add(record.id.clone(), record.position);
            let id = record.id.clone();
            self.records
                .insert(record)
                .map_err(|_| ConfigError::DuplicateId {
                    kind: "npc",
                    id: id.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn clock(&self) -> DayTime {
        self.clock.now()
    }

    pub fn records(&self) -> &RecordTable {
        &self.records
    }

    pub fn stats(&self) -> TierStats {
        self.coordinator.stats()
    }

    pub fn active_count(&self) -> usize {
        self.coordinator.bound_count()
    }

    /// Queues an event for a record (or everyone, with `to` unset). Active
    /// recipients get it through their state machine this cycle; inactive
    /// ones find it in their pending queue at next activation.
    pub fn post_event(&mut self, to: Option<RecordId>, event: NpcEvent) {
        match to {
            Some(id) => self.bus.publish_to(id, event),
            None => self.bus.broadcast(event),
        }
    }

    /// Advances the whole world by `dt` seconds of real time.
    pub fn tick(&mut self, dt: f32, observers: &[Vec3]) {
        self.clock.advance(dt);
        let clock = self.clock.now();

        self.coordinator
            .finalize_returns(&mut *self.pool, &self.records, &mut self.grid);

        self.apply_scan(dt, observers, clock);

        {
            let mut env = ReducedEnv {
                paths: &self.paths,
                tuning: &self.config.tuning,
                clock,
                rng: &mut self.rng,
            };
            self.stepper
                .tick(dt, observers, &mut self.records, &mut self.grid, &mut env);
        }

        self.nav.step(dt);

        let inconsistent = {
            let mut deps = RunnerDeps {
                nav: &mut *self.nav,
                services: &mut self.services,
                bus: &mut self.bus,
                paths: &self.paths,
                mapper: &self.mapper,
                tuning: &self.config.tuning,
                clock,
                rng: &mut self.rng,
            };
            self.runner.update_all(dt, &mut self.records, &mut deps)
        };
        for instance in inconsistent {
            let mut deps = RunnerDeps {
                nav: &mut *self.nav,
                services: &mut self.services,
                bus: &mut self.bus,
                paths: &self.paths,
                mapper: &self.mapper,
                tuning: &self.config.tuning,
                clock,
                rng: &mut self.rng,
            };
            self.coordinator.resync(
                instance,
                &mut self.records,
                &mut *self.pool,
                &mut self.runner,
                &mut deps,
            );
        }

        self.route_events(clock);
    }

    /// Runs the proximity scan and applies every decision it produced,
    /// demotions first so freed instances can serve nearby promotions.
    fn apply_scan(&mut self, dt: f32, observers: &[Vec3], clock: DayTime) {
        let Some(decisions) = self
            .scanner
            .tick(dt, observers, &self.records, &self.grid)
        else {
            return;
        };

        for id in &decisions.deactivate {
            let mut deps = RunnerDeps {
                nav: &mut *self.nav,
                services: &mut self.services,
                bus: &mut self.bus,
                paths: &self.paths,
                mapper: &self.mapper,
                tuning: &self.config.tuning,
                clock,
                rng: &mut self.rng,
            };
            self.coordinator.deactivate(
                id,
                &mut self.records,
                &mut *self.pool,
                &mut self.runner,
                &mut deps,
            );
        }

        for id in &decisions.activate {
            let result = {
                let mut deps = RunnerDeps {
                    nav: &mut *self.nav,
                    services: &mut self.services,
                    bus: &mut self.bus,
                    paths: &self.paths,
                    mapper: &self.mapper,
                    tuning: &self.config.tuning,
                    clock,
                    rng: &mut self.rng,
                };
                self.coordinator.activate(
                    id,
                    &mut self.records,
                    &mut self.grid,
                    &mut *self.pool,
                    &mut self.runner,
                    &mut deps,
                )
            };
            match result {
                Ok(_) => self.stepper.remove(id),
                Err(ActivationError::PoolExhausted { template }) => {
                    // Nearer candidates already took the instances; records
                    // further out stay reduced until one frees up.
                    debug!(record = %id, template, "activation skipped, pool exhausted");
                }
                Err(err) => warn!(record = %id, %err, "activation failed"),
            }
        }
    }

    /// Delivers queued events: live machines get them now, reduced records
    /// keep them pending for their next activation.
    fn route_events(&mut self, clock: DayTime) {
        for addressed in self.bus.drain() {
            let targets: Vec<RecordId> = match &addressed.to {
                Some(id) => vec![id.clone()],
                None => self.records.ids(),
            };
            for id in targets {
                let instance = self.records.get(&id).and_then(|r| {
                    if r.active {
                        r.bound_instance
                    } else {
                        None
                    }
                });
                match instance {
                    Some(instance) => {
                        let mut deps = RunnerDeps {
                            nav: &mut *self.nav,
                            services: &mut self.services,
                            bus: &mut self.bus,
                            paths: &self.paths,
                            mapper: &self.mapper,
                            tuning: &self.config.tuning,
                            clock,
                            rng: &mut self.rng,
                        };
                        self.runner
                            .handle_event(instance, &addressed.event, &mut self.records, &mut deps);
                    }
                    None => {
                        if let Some(record) = self.records.get_mut(&id) {
                            record.push_pending(addressed.event.clone());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_and_wraps() {
        let mut clock = WorldClock::new(DayTime::new(23, 30), 1.0);
        clock.advance(45.0);
        assert_eq!(clock.now(), DayTime::new(0, 15));
    }

    #[test]
    fn world_builds_from_demo_config() {
        let world = NpcWorld::from_config(Config::demo(), 42).unwrap();
        assert_eq!(world.records().len(), 3);
        assert_eq!(world.active_count(), 0);
    }

    #[test]
    fn tick_activates_near_observer() {
        let mut world = NpcWorld::from_config(Config::demo(), 42).unwrap();
        let observer = [Vec3::new(0.0, 0.0, 0.0)];
        for _ in 0..10 {
            world.tick(0.1, &observer);
        }
        assert!(world.active_count() > 0);
    }

    #[test]
    fn broadcast_to_reduced_records_lands_in_pending_queues() {
        let mut world = NpcWorld::from_config(Config::demo(), 42).unwrap();
        world.post_event(
            None,
            NpcEvent::AssignmentReady {
                order_id: "order_7".to_string(),
            },
        );
        world.tick(0.1, &[]);
        let queued = world
            .records()
            .iter()
            .filter(|r| !r.pending_events.is_empty())
            .count();
        assert_eq!(queued, world.records().len());
    }
}
