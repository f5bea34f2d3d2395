//! Full-fidelity per-instance state machines.
//!
//! Every bound instance runs one finite state machine whose states come from
//! the behavior registry. States implement enter/update/exit plus an
//! arrival callback; whether a state may be interrupted is recorded in a
//! static capability table populated at registration, so the runner never
//! probes a behavior object at transition time.
//!
//! Transition lookup is defensive: a requested state that is not loaded for
//! the instance's template falls back to the configured returning state,
//! then the configured idle state; if both are unavailable the instance is
//! disabled with a fatal diagnostic rather than crashing the scheduler.

use npc_events::{DayTime, FullKey, FullTag, NpcEvent, Vec3};
use rand::rngs::SmallRng;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{error, warn};

use crate::config::{Config, Fallbacks, PathRegistry, Tuning};
use crate::mapper::{tag_from_key, StateMapper};
use crate::record::{NpcRecord, RecordId, RecordTable};
use crate::services::{EventBus, InstanceId, Navigator, ServiceRegistry};

/// Shared collaborators for runner calls, borrowed from the world per cycle.
/// The record table travels separately so behaviors can hold a mutable
/// record borrow alongside these.
pub struct RunnerDeps<'a> {
    pub nav: &'a mut dyn Navigator,
    pub services: &'a mut ServiceRegistry,
    pub bus: &'a mut EventBus,
    pub paths: &'a PathRegistry,
    pub mapper: &'a StateMapper,
    pub tuning: &'a Tuning,
    pub clock: DayTime,
    pub rng: &'a mut SmallRng,
}

/// Everything a full behavior may touch during one callback.
pub struct StepCx<'a> {
    pub record: &'a mut NpcRecord,
    pub instance: InstanceId,
    pub current: FullTag,
    pub nav: &'a mut dyn Navigator,
    pub services: &'a mut ServiceRegistry,
    pub bus: &'a mut EventBus,
    pub paths: &'a PathRegistry,
    pub mapper: &'a StateMapper,
    pub tuning: &'a Tuning,
    pub clock: DayTime,
    pub rng: &'a mut SmallRng,
    pub dt: f32,
    move_issued: bool,
}

impl<'a> StepCx<'a> {
    /// Assigns a new movement target; the arrival callback will fire once
    /// when it is reached.
    pub fn move_to(&mut self, target: Vec3) {
        self.nav.move_to(self.instance, target);
        self.move_issued = true;
    }

    /// Whether the navigation provider reports the instance at its target.
    pub fn at_destination(&self) -> bool {
        self.nav.is_at_destination(self.instance)
    }
}

fn make_cx<'a>(
    record: &'a mut NpcRecord,
    instance: InstanceId,
    current: FullTag,
    deps: &'a mut RunnerDeps<'_>,
    dt: f32,
) -> StepCx<'a> {
    StepCx {
        record,
        instance,
        current,
        nav: &mut *deps.nav,
        services: &mut *deps.services,
        bus: &mut *deps.bus,
        paths: deps.paths,
        mapper: deps.mapper,
        tuning: deps.tuning,
        clock: deps.clock,
        rng: &mut *deps.rng,
        dt,
        move_issued: false,
    }
}

/// Behavior of one full-simulation state.
///
/// `on_enter` may redirect to a different state (e.g. a path walk that
/// discovers the record has no path); the runner follows redirects with a
/// bounded depth before falling back.
pub trait FullBehavior {
    /// Whether deactivation may interrupt this state.
    fn interruptible(&self) -> bool {
        true
    }

    fn on_enter(&self, _cx: &mut StepCx<'_>) -> Option<FullTag> {
        None
    }

    fn on_update(&self, _cx: &mut StepCx<'_>) -> Option<FullTag> {
        None
    }

    fn on_exit(&self, _cx: &mut StepCx<'_>) {}

    /// Fires exactly once per destination assignment.
    fn on_reached_destination(&self, _cx: &mut StepCx<'_>) -> Option<FullTag> {
        None
    }

    fn on_event(&self, _cx: &mut StepCx<'_>, _event: &NpcEvent) -> Option<FullTag> {
        None
    }
}

/// Static per-state capabilities, captured at registration time.
#[derive(Debug, Clone, Copy)]
pub struct StateCaps {
    pub interruptible: bool,
}

/// Registry of state behaviors and per-template loaded sets.
pub struct BehaviorRegistry {
    behaviors: HashMap<FullKey, Box<dyn FullBehavior>>,
    caps: HashMap<FullKey, StateCaps>,
    loaded: HashMap<String, BTreeSet<FullKey>>,
    fallbacks: Fallbacks,
}

impl BehaviorRegistry {
    pub fn new(fallbacks: Fallbacks) -> Self {
        Self {
            behaviors: HashMap::new(),
            caps: HashMap::new(),
            loaded: HashMap::new(),
            fallbacks,
        }
    }

    /// Registers a behavior and captures its capabilities.
    pub fn register(&mut self, key: FullKey, behavior: Box<dyn FullBehavior>) {
        self.caps.insert(
            key,
            StateCaps {
                interruptible: behavior.interruptible(),
            },
        );
        self.behaviors.insert(key, behavior);
    }

    /// Registers the built-in behavior set and the per-template loaded
    /// state sets from config.
    pub fn standard(config: &Config) -> Self {
        let mut registry = Self::new(config.fallbacks.clone());
        registry.register(FullKey::Idle, Box::new(IdleState));
        registry.register(FullKey::Returning, Box::new(ReturningState));
        registry.register(FullKey::FollowPath, Box::new(FollowPathState));
        registry.register(FullKey::Patrol, Box::new(PatrolState));
        registry.register(FullKey::MovingToService, Box::new(MovingToServiceState));
        registry.register(FullKey::QueuedAtService, Box::new(QueuedState));
        registry.register(FullKey::BeingServed, Box::new(BeingServedState));
        registry.register(FullKey::GivingUp, Box::new(GivingUpState));
        registry.register(FullKey::Leaving, Box::new(LeavingState));

        for tpl in &config.templates {
            let set: BTreeSet<FullKey> = match &tpl.states {
                Some(keys) => keys.iter().copied().collect(),
                None => registry.behaviors.keys().copied().collect(),
            };
            registry.loaded.insert(tpl.id.clone(), set);
        }
        registry
    }

    /// Whether a state is loaded for a template. Templates without an
    /// explicit entry get every registered state.
    pub fn is_loaded(&self, template: &str, key: FullKey) -> bool {
        let registered = self.behaviors.contains_key(&key);
        match self.loaded.get(template) {
            Some(set) => registered && set.contains(&key),
            None => registered,
        }
    }

    pub fn caps(&self, key: FullKey) -> Option<StateCaps> {
        self.caps.get(&key).copied()
    }

    fn behavior(&self, key: FullKey) -> Option<&dyn FullBehavior> {
        self.behaviors.get(&key).map(Box::as_ref)
    }
}

impl std::fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("states", &self.caps.keys().collect::<Vec<_>>())
            .field("templates", &self.loaded.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug)]
struct RunnerState {
    record: RecordId,
    current: FullTag,
    /// True once the arrival callback has fired for the current assignment.
    arrival_notified: bool,
    disabled: bool,
}

/// How many on_enter redirects to follow before giving up on a transition.
const MAX_REDIRECTS: usize = 4;

/// Runs the state machine of every bound instance.
#[derive(Debug)]
pub struct StateMachineRunner {
    registry: BehaviorRegistry,
    states: BTreeMap<InstanceId, RunnerState>,
}

impl StateMachineRunner {
    pub fn new(registry: BehaviorRegistry) -> Self {
        Self {
            registry,
            states: BTreeMap::new(),
        }
    }

    /// Current state of an instance, if its machine is running.
    pub fn current(&self, instance: InstanceId) -> Option<FullTag> {
        self.states.get(&instance).map(|s| s.current)
    }

    /// Whether the instance's current state allows interruption. Unknown
    /// and disabled instances count as interruptible so cleanup can always
    /// proceed.
    pub fn is_interruptible(&self, instance: InstanceId) -> bool {
        let Some(state) = self.states.get(&instance) else {
            return true;
        };
        if state.disabled {
            return true;
        }
        self.registry
            .caps(state.current.key())
            .map(|c| c.interruptible)
            .unwrap_or(true)
    }

    pub fn is_disabled(&self, instance: InstanceId) -> bool {
        self.states
            .get(&instance)
            .map(|s| s.disabled)
            .unwrap_or(false)
    }

    /// Starts an instance's machine in the given state.
    pub fn start(
        &mut self,
        instance: InstanceId,
        record: RecordId,
        tag: FullTag,
        records: &mut RecordTable,
        deps: &mut RunnerDeps<'_>,
    ) {
        self.states.insert(
            instance,
            RunnerState {
                record,
                current: tag,
                arrival_notified: true,
                disabled: false,
            },
        );
        self.enter_chain(instance, tag, records, deps, false);
    }

    /// Stops an instance's machine, running the exit hook. Returns the
    /// state it was in.
    pub fn stop(
        &mut self,
        instance: InstanceId,
        records: &mut RecordTable,
        deps: &mut RunnerDeps<'_>,
    ) -> Option<FullTag> {
        let state = self.states.get(&instance)?;
        let (record_id, current, disabled) = (state.record.clone(), state.current, state.disabled);
        if !disabled {
            if let Some(record) = records.get_mut(&record_id) {
                if let Some(behavior) = self.registry.behavior(current.key()) {
                    let mut cx = make_cx(record, instance, current, deps, 0.0);
                    behavior.on_exit(&mut cx);
                }
            }
        }
        self.states.remove(&instance);
        Some(current)
    }

    /// Drops an instance's machine without hooks (defensive resync path).
    pub fn forget(&mut self, instance: InstanceId) {
        self.states.remove(&instance);
    }

    /// Routes a domain event to a live machine.
    pub fn handle_event(
        &mut self,
        instance: InstanceId,
        event: &NpcEvent,
        records: &mut RecordTable,
        deps: &mut RunnerDeps<'_>,
    ) {
        let Some(state) = self.states.get(&instance) else {
            return;
        };
        if state.disabled {
            return;
        }
        let (record_id, current) = (state.record.clone(), state.current);
        let next = {
            let Some(record) = records.get_mut(&record_id) else {
                return;
            };
            let Some(behavior) = self.registry.behavior(current.key()) else {
                return;
            };
            let mut cx = make_cx(record, instance, current, deps, 0.0);
            let next = behavior.on_event(&mut cx, event);
            let moved = cx.move_issued;
            if moved {
                self.clear_arrival(instance);
            }
            next
        };
        if let Some(tag) = next {
            self.transition(instance, tag, records, deps);
        }
    }

    /// Advances every machine by `dt` seconds. Returns the instances whose
    /// record linkage turned out inconsistent; the coordinator resyncs them.
    pub fn update_all(
        &mut self,
        dt: f32,
        records: &mut RecordTable,
        deps: &mut RunnerDeps<'_>,
    ) -> Vec<InstanceId> {
        let mut inconsistent = Vec::new();
        let instances: Vec<InstanceId> = self.states.keys().copied().collect();

        for instance in instances {
            let Some(state) = self.states.get(&instance) else {
                continue;
            };
            if state.disabled {
                continue;
            }
            let (record_id, current) = (state.record.clone(), state.current);

            // Defensive: the record must still claim this instance.
            let linked = records
                .get(&record_id)
                .map(|r| r.active && r.bound_instance == Some(instance))
                .unwrap_or(false);
            if !linked {
                inconsistent.push(instance);
                continue;
            }

            // Keep the record transform mirroring the live instance.
            if let Some((pos, rot)) = deps.nav.transform(instance) {
                if let Some(record) = records.get_mut(&record_id) {
                    record.position = pos;
                    record.rotation = rot;
                }
            }

            let next = {
                let Some(record) = records.get_mut(&record_id) else {
                    inconsistent.push(instance);
                    continue;
                };
                let Some(behavior) = self.registry.behavior(current.key()) else {
                    inconsistent.push(instance);
                    continue;
                };
                let mut cx = make_cx(record, instance, current, deps, dt);
                let next = behavior.on_update(&mut cx);
                let moved = cx.move_issued;
                if moved {
                    self.clear_arrival(instance);
                }
                next
            };
            if let Some(tag) = next {
                self.transition(instance, tag, records, deps);
                continue;
            }

            // Arrival edge detection: the provider's level signal is gated
            // by the per-assignment notified flag so the callback fires
            // exactly once.
            let should_notify = self
                .states
                .get(&instance)
                .map(|s| !s.arrival_notified && deps.nav.is_at_destination(instance))
                .unwrap_or(false);
            if should_notify {
                if let Some(s) = self.states.get_mut(&instance) {
                    s.arrival_notified = true;
                }
                let current = match self.states.get(&instance) {
                    Some(s) => s.current,
                    None => continue,
                };
                let next = {
                    let Some(record) = records.get_mut(&record_id) else {
                        continue;
                    };
                    let Some(behavior) = self.registry.behavior(current.key()) else {
                        continue;
                    };
                    let mut cx = make_cx(record, instance, current, deps, 0.0);
                    let next = behavior.on_reached_destination(&mut cx);
                    let moved = cx.move_issued;
                    if moved {
                        self.clear_arrival(instance);
                    }
                    next
                };
                if let Some(tag) = next {
                    self.transition(instance, tag, records, deps);
                }
            }
        }
        inconsistent
    }

    /// Switches an instance to a new state, exit hook first.
    pub fn transition(
        &mut self,
        instance: InstanceId,
        to: FullTag,
        records: &mut RecordTable,
        deps: &mut RunnerDeps<'_>,
    ) {
        let Some(state) = self.states.get(&instance) else {
            return;
        };
        if state.disabled {
            return;
        }
        let (record_id, current) = (state.record.clone(), state.current);
        if let Some(record) = records.get_mut(&record_id) {
            if let Some(behavior) = self.registry.behavior(current.key()) {
                let mut cx = make_cx(record, instance, current, deps, 0.0);
                behavior.on_exit(&mut cx);
            }
        }
        self.enter_chain(instance, to, records, deps, true);
    }

    /// Resolves and enters a state, following the fallback chain when the
    /// requested state is missing, with bounded on_enter redirects.
    fn enter_chain(
        &mut self,
        instance: InstanceId,
        requested: FullTag,
        records: &mut RecordTable,
        deps: &mut RunnerDeps<'_>,
        warn_on_fallback: bool,
    ) {
        let Some(state) = self.states.get(&instance) else {
            return;
        };
        let record_id = state.record.clone();
        let template = match records.get(&record_id) {
            Some(r) => r.template.clone(),
            None => {
                self.disable(instance, "record vanished during transition");
                return;
            }
        };

        let mut target = requested;
        for _ in 0..=MAX_REDIRECTS {
            let Some(resolved) = self.resolve(&template, target, warn_on_fallback) else {
                self.disable(instance, "no loaded state and no usable fallback");
                return;
            };

            if let Some(s) = self.states.get_mut(&instance) {
                s.current = resolved;
                // New state, new life for the full-domain record tag.
                if let Some(record) = records.get_mut(&record_id) {
                    record.state = npc_events::StateTag::Full(resolved);
                }
            }
            let redirect = {
                let Some(record) = records.get_mut(&record_id) else {
                    self.disable(instance, "record vanished during transition");
                    return;
                };
                let Some(behavior) = self.registry.behavior(resolved.key()) else {
                    self.disable(instance, "resolved state lost its behavior");
                    return;
                };
                let mut cx = make_cx(record, instance, resolved, deps, 0.0);
                let redirect = behavior.on_enter(&mut cx);
                let moved = cx.move_issued;
                if moved {
                    self.clear_arrival(instance);
                }
                redirect
            };
            match redirect {
                Some(next) => target = next,
                None => return,
            }
        }
        self.disable(instance, "transition redirect loop");
    }

    /// Applies the fallback chain: requested, then returning, then idle.
    fn resolve(&self, template: &str, requested: FullTag, warn_missing: bool) -> Option<FullTag> {
        if self.registry.is_loaded(template, requested.key()) {
            return Some(requested);
        }
        if warn_missing {
            warn!(template, requested = %requested, "state not loaded; using fallback");
        }
        for key in [self.registry.fallbacks.returning, self.registry.fallbacks.idle] {
            if self.registry.is_loaded(template, key) {
                if let Some(tag) = tag_from_key(key) {
                    return Some(tag);
                }
            }
        }
        None
    }

    fn clear_arrival(&mut self, instance: InstanceId) {
        if let Some(s) = self.states.get_mut(&instance) {
            s.arrival_notified = false;
        }
    }

    fn disable(&mut self, instance: InstanceId, reason: &str) {
        if let Some(state) = self.states.get_mut(&instance) {
            state.disabled = true;
            error!(instance = %instance, record = %state.record, reason,
                "state machine disabled");
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in behaviors
// ---------------------------------------------------------------------------

/// Standing at the current spot until the day's schedule says otherwise.
struct IdleState;

impl FullBehavior for IdleState {
    fn on_update(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        if cx.record.can_start_day
            && cx.record.day_start_path.is_some()
            && cx.record.schedule_start.started_at(cx.clock)
            && !cx.record.path.following
        {
            let path = cx.record.day_start_path.clone()?;
            cx.record.path.start(path);
            return Some(FullTag::FollowPath);
        }
        None
    }
}

/// Walking back to the home transform.
struct ReturningState;

impl FullBehavior for ReturningState {
    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        let home = cx.record.home_position;
        cx.move_to(home);
        None
    }

    fn on_reached_destination(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        cx.record.rotation = cx.record.home_rotation;
        Some(FullTag::Idle)
    }
}

/// Walking the record's configured waypoint path.
struct FollowPathState;

impl FullBehavior for FollowPathState {
    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        if !cx.record.path.following {
            match cx.record.day_start_path.clone() {
                Some(path) => cx.record.path.start(path),
                None => return Some(FullTag::Patrol),
            }
        }
        let wp = cx.record.path.path_id.as_deref().and_then(|p| {
            cx.paths
                .waypoint(p, cx.record.path.waypoint, cx.record.path.reverse)
        });
        match wp {
            Some(target) => {
                cx.move_to(target);
                None
            }
            None => Some(FullTag::Patrol),
        }
    }

    fn on_reached_destination(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        let Some(path_id) = cx.record.path.path_id.clone() else {
            return Some(FullTag::Patrol);
        };
        let next = cx.record.path.waypoint + 1;
        if next < cx.paths.len_of(&path_id) {
            cx.record.path.waypoint = next;
            if let Some(target) = cx.paths.waypoint(&path_id, next, cx.record.path.reverse) {
                cx.move_to(target);
            }
            return None;
        }
        cx.record.path.stop();
        if cx.record.service.is_some() {
            // The walk was an errand: negotiate with the live counter.
            return Some(cx.mapper.negotiate_service(cx.record, cx.services));
        }
        let home_dist = cx.record.position.distance(cx.record.home_position);
        if home_dist <= cx.tuning.patrol_radius {
            Some(FullTag::Idle)
        } else {
            Some(FullTag::Patrol)
        }
    }
}

/// Wandering near the current position; the generic fallback behavior.
struct PatrolState;

impl FullBehavior for PatrolState {
    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        cx.record.state_timer = cx.rng.gen_range(2.0..6.0);
        let target = drift_near(cx);
        cx.move_to(target);
        None
    }

    fn on_update(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        if cx.record.schedule_end.started_at(cx.clock) {
            return Some(FullTag::Returning);
        }
        cx.record.state_timer -= cx.dt;
        if cx.record.state_timer <= 0.0 && cx.at_destination() {
            cx.record.state_timer = cx.rng.gen_range(2.0..6.0);
            let target = drift_near(cx);
            cx.move_to(target);
        }
        None
    }
}

fn drift_near(cx: &mut StepCx<'_>) -> Vec3 {
    let r = cx.tuning.patrol_radius;
    let base = cx.record.position;
    let dx = cx.rng.gen_range(-r..r);
    let dz = cx.rng.gen_range(-r..r);
    Vec3::new(base.x + dx, base.y, base.z + dz)
}

/// Walking to a counter this record has already claimed.
struct MovingToServiceState;

impl FullBehavior for MovingToServiceState {
    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        let target = cx
            .record
            .service
            .as_deref()
            .and_then(|s| cx.services.get(s))
            .map(|s| s.position);
        match target {
            Some(pos) => {
                cx.move_to(pos);
                None
            }
            None => {
                warn!(record = %cx.record.id, "service point missing on approach");
                Some(FullTag::Patrol)
            }
        }
    }

    fn on_reached_destination(&self, _cx: &mut StepCx<'_>) -> Option<FullTag> {
        Some(FullTag::BeingServed)
    }
}

/// Standing in the waiting line.
struct QueuedState;

impl FullBehavior for QueuedState {
    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        let FullTag::QueuedAtService { slot } = cx.current else {
            return Some(FullTag::GivingUp);
        };
        cx.record.state_timer = cx.tuning.patience;
        let pos = cx
            .record
            .service
            .as_deref()
            .and_then(|s| cx.services.get(s))
            .map(|s| s.slot_position(slot));
        if let Some(pos) = pos {
            cx.move_to(pos);
        }
        None
    }

    fn on_update(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        cx.record.state_timer -= cx.dt;
        if cx.record.state_timer <= 0.0 {
            cx.bus
                .publish_to(cx.record.id.clone(), NpcEvent::BecameImpatient);
            if let Some(svc) = cx
                .record
                .service
                .as_deref()
                .and_then(|s| cx.services.get_mut(s))
            {
                svc.leave_queue(&cx.record.id);
            }
            return Some(FullTag::GivingUp);
        }
        None
    }

    fn on_event(&self, cx: &mut StepCx<'_>, event: &NpcEvent) -> Option<FullTag> {
        let NpcEvent::ResourceFreed { service } = event else {
            return None;
        };
        if cx.record.service.as_deref() != Some(service.as_str()) {
            return None;
        }
        let svc = cx.services.get_mut(service)?;
        // Only the head of the line moves up.
        if svc.head_of_queue() != Some(&cx.record.id) {
            return None;
        }
        if svc.try_claim(&cx.record.id) {
            svc.leave_queue(&cx.record.id);
            return Some(FullTag::MovingToService);
        }
        None
    }
}

/// At the counter. The one state that must run to completion.
struct BeingServedState;

impl FullBehavior for BeingServedState {
    fn interruptible(&self) -> bool {
        false
    }

    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        cx.record.state_timer = cx.tuning.service_time;
        None
    }

    fn on_update(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        cx.record.state_timer -= cx.dt;
        if cx.record.state_timer > 0.0 {
            return None;
        }
        // Transaction done: free the counter and tell the head of the line.
        cx.record.assignment = None;
        if let Some(service_id) = cx.record.service.clone() {
            if let Some(svc) = cx.services.get_mut(&service_id) {
                svc.release();
                if let Some(next) = svc.head_of_queue().cloned() {
                    cx.bus.publish_to(
                        next,
                        NpcEvent::ResourceFreed {
                            service: service_id,
                        },
                    );
                }
            }
        }
        Some(FullTag::Returning)
    }
}

/// The line was full; head for the nearest exit.
struct GivingUpState;

impl FullBehavior for GivingUpState {
    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        match cx.tuning.nearest_exit(cx.record.position) {
            Some(exit) => {
                cx.move_to(exit);
                None
            }
            None => Some(FullTag::Returning),
        }
    }

    fn on_reached_destination(&self, _cx: &mut StepCx<'_>) -> Option<FullTag> {
        Some(FullTag::Leaving)
    }
}

/// Walking off the map.
struct LeavingState;

impl FullBehavior for LeavingState {
    fn on_enter(&self, cx: &mut StepCx<'_>) -> Option<FullTag> {
        match cx.tuning.nearest_exit(cx.record.position) {
            Some(exit) => {
                if cx.record.position.distance(exit) <= cx.tuning.arrive_epsilon {
                    return Some(FullTag::Idle);
                }
                cx.move_to(exit);
                None
            }
            None => Some(FullTag::Idle),
        }
    }

    fn on_reached_destination(&self, _cx: &mut StepCx<'_>) -> Option<FullTag> {
        Some(FullTag::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::record::NpcRecord;
    use crate::services::StraightLineNav;
    use npc_events::StateTag;
    use rand::SeedableRng;

    struct Harness {
        config: Config,
        records: RecordTable,
        nav: StraightLineNav,
        services: ServiceRegistry,
        bus: EventBus,
        paths: PathRegistry,
        mapper: StateMapper,
        rng: SmallRng,
        runner: StateMachineRunner,
    }

    // Builds RunnerDeps from harness fields without borrowing the whole
    // harness, so `runner` and `records` stay free.
    macro_rules! deps {
        ($h:expr, $clock:expr) => {
            RunnerDeps {
                nav: &mut $h.nav,
                services: &mut $h.services,
                bus: &mut $h.bus,
                paths: &$h.paths,
                mapper: &$h.mapper,
                tuning: &$h.config.tuning,
                clock: $clock,
                rng: &mut $h.rng,
            }
        };
    }

    impl Harness {
        fn new() -> Self {
            let config = Config::demo();
            let paths = PathRegistry::from_config(&config);
            let services = ServiceRegistry::from_config(&config);
            let nav = StraightLineNav::from_tuning(&config.tuning);
            let runner = StateMachineRunner::new(BehaviorRegistry::standard(&config));
            Self {
                config,
                records: RecordTable::new(),
                nav,
                services,
                bus: EventBus::new(),
                paths,
                mapper: StateMapper::standard(),
                rng: SmallRng::seed_from_u64(7),
                runner,
            }
        }

        fn add_bound_record(&mut self, id: &str, instance: InstanceId, pos: Vec3) -> RecordId {
            let mut rec = NpcRecord::new(RecordId::from(id), "villager", pos, 0.0);
            rec.active = true;
            rec.bound_instance = Some(instance);
            rec.state = StateTag::Full(FullTag::Idle);
            assert!(self.nav.warp(instance, pos));
            let rid = rec.id.clone();
            self.records.insert(rec).unwrap();
            rid
        }

        fn run(&mut self, seconds: f32, clock: DayTime) -> Vec<InstanceId> {
            let mut bad = Vec::new();
            let steps = (seconds / 0.1) as usize;
            for _ in 0..steps {
                self.nav.step(0.1);
                let mut d = deps!(self, clock);
                bad = self.runner.update_all(0.1, &mut self.records, &mut d);
            }
            bad
        }
    }

    #[test]
    fn returning_reaches_home_and_idles() {
        let mut h = Harness::new();
        let inst = InstanceId(1);
        let rid = h.add_bound_record("aiko", inst, Vec3::new(10.0, 0.0, 0.0));
        h.records.get_mut(&rid).unwrap().home_position = Vec3::new(2.0, 0.0, 0.0);
        h.records.get_mut(&rid).unwrap().day_start_path = None;

        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner
            .start(inst, rid.clone(), FullTag::Returning, &mut h.records, &mut d);
        assert_eq!(h.runner.current(inst), Some(FullTag::Returning));

        h.run(10.0, DayTime::new(12, 0));
        assert_eq!(h.runner.current(inst), Some(FullTag::Idle));
        // The record's full-domain tag follows the machine.
        assert_eq!(
            h.records.get(&rid).unwrap().state,
            StateTag::Full(FullTag::Idle)
        );
    }

    #[test]
    fn idle_machine_stays_idle_once_arrived() {
        let mut h = Harness::new();
        let inst = InstanceId(1);
        let rid = h.add_bound_record("aiko", inst, Vec3::new(4.0, 0.0, 0.0));
        h.records.get_mut(&rid).unwrap().home_position = Vec3::new(2.0, 0.0, 0.0);
        h.records.get_mut(&rid).unwrap().day_start_path = None;

        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner
            .start(inst, rid, FullTag::Returning, &mut h.records, &mut d);
        h.run(5.0, DayTime::new(12, 0));
        assert_eq!(h.runner.current(inst), Some(FullTag::Idle));
        // If arrival re-fired, Returning's callback would keep re-entering
        // Idle; state must simply hold.
        h.run(5.0, DayTime::new(12, 0));
        assert_eq!(h.runner.current(inst), Some(FullTag::Idle));
    }

    #[test]
    fn missing_state_falls_back_to_returning_then_idle() {
        let mut h = Harness::new();
        // Restrict the villager template to a minimal state set.
        h.config.templates[0].states = Some(vec![FullKey::Idle, FullKey::Returning]);
        h.runner = StateMachineRunner::new(BehaviorRegistry::standard(&h.config));

        let inst = InstanceId(1);
        let rid = h.add_bound_record("aiko", inst, Vec3::new(5.0, 0.0, 5.0));
        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner
            .start(inst, rid, FullTag::MovingToService, &mut h.records, &mut d);
        // MovingToService is not loaded; Returning is.
        assert_eq!(h.runner.current(inst), Some(FullTag::Returning));
        assert!(!h.runner.is_disabled(inst));
    }

    #[test]
    fn exhausted_fallback_disables_the_instance() {
        let mut h = Harness::new();
        h.config.templates[0].states = Some(vec![FullKey::Patrol]);
        h.runner = StateMachineRunner::new(BehaviorRegistry::standard(&h.config));

        let inst = InstanceId(1);
        let rid = h.add_bound_record("aiko", inst, Vec3::new(5.0, 0.0, 5.0));
        let mut d = deps!(h, DayTime::new(12, 0));
        // Neither MovingToService nor either fallback is loaded.
        h.runner
            .start(inst, rid, FullTag::MovingToService, &mut h.records, &mut d);
        assert!(h.runner.is_disabled(inst));
        // A disabled machine still reports interruptible so cleanup works.
        assert!(h.runner.is_interruptible(inst));
    }

    #[test]
    fn being_served_is_not_interruptible() {
        let mut h = Harness::new();
        let inst = InstanceId(1);
        let rid = h.add_bound_record("bruno", inst, Vec3::new(40.0, 0.0, 0.0));
        h.records.get_mut(&rid).unwrap().service = Some("bakery_counter".to_string());

        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner
            .start(inst, rid, FullTag::BeingServed, &mut h.records, &mut d);
        assert!(!h.runner.is_interruptible(inst));
    }

    #[test]
    fn service_flow_claims_serves_and_frees() {
        let mut h = Harness::new();
        let inst = InstanceId(1);
        let rid = h.add_bound_record("bruno", inst, Vec3::new(30.0, 0.0, 0.0));
        {
            let rec = h.records.get_mut(&rid).unwrap();
            rec.service = Some("bakery_counter".to_string());
            rec.assignment = Some("order_0042".to_string());
            rec.day_start_path = None;
        }
        assert!(h
            .services
            .get_mut("bakery_counter")
            .unwrap()
            .try_claim(&rid));

        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner.start(
            inst,
            rid.clone(),
            FullTag::MovingToService,
            &mut h.records,
            &mut d,
        );
        // Walk to the counter, get served, head home.
        h.run(60.0, DayTime::new(12, 0));
        assert!(!h.services.get("bakery_counter").unwrap().is_occupied());
        assert!(h.records.get(&rid).unwrap().assignment.is_none());
        let current = h.runner.current(inst).unwrap();
        assert!(
            matches!(current, FullTag::Returning | FullTag::Idle),
            "expected homeward state, got {current}"
        );
    }

    #[test]
    fn queued_instance_moves_up_on_resource_freed() {
        let mut h = Harness::new();
        let inst = InstanceId(1);
        let rid = h.add_bound_record("bruno", inst, Vec3::new(40.0, 0.0, 2.0));
        h.records.get_mut(&rid).unwrap().service = Some("bakery_counter".to_string());
        {
            let svc = h.services.get_mut("bakery_counter").unwrap();
            assert!(svc.try_claim(&RecordId::from("other")));
            assert_eq!(svc.try_enqueue(&rid), Some(0));
        }

        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner.start(
            inst,
            rid.clone(),
            FullTag::QueuedAtService { slot: 0 },
            &mut h.records,
            &mut d,
        );

        // The other customer walks away; the counter frees up.
        h.services.get_mut("bakery_counter").unwrap().release();
        let event = NpcEvent::ResourceFreed {
            service: "bakery_counter".to_string(),
        };
        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner.handle_event(inst, &event, &mut h.records, &mut d);

        assert_eq!(h.runner.current(inst), Some(FullTag::MovingToService));
        let svc = h.services.get("bakery_counter").unwrap();
        assert!(svc.is_occupied());
        assert_eq!(svc.queue_len(), 0);
    }

    #[test]
    fn update_reports_inconsistent_linkage() {
        let mut h = Harness::new();
        let inst = InstanceId(1);
        let rid = h.add_bound_record("aiko", inst, Vec3::new(5.0, 0.0, 5.0));
        let mut d = deps!(h, DayTime::new(12, 0));
        h.runner
            .start(inst, rid.clone(), FullTag::Idle, &mut h.records, &mut d);

        // Someone unlinked the record behind the runner's back.
        h.records.get_mut(&rid).unwrap().active = false;
        h.records.get_mut(&rid).unwrap().bound_instance = None;

        let bad = h.run(0.1, DayTime::new(12, 0));
        assert_eq!(bad, vec![inst]);
    }
}
