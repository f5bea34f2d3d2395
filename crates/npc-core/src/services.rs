//! External collaborator seams.
//!
//! The core talks to its host engine through the traits here: an instance
//! pool, a navigation provider, shared service points, and the event bus.
//! Simple in-crate implementations (`FixedPool`, `StraightLineNav`) back the
//! demo binary and the tests; the core never assumes them.

use npc_events::{NpcEvent, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::config::{Config, Tuning};
use crate::record::RecordId;

/// Handle to a live pooled instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst_{}", self.0)
    }
}

/// The object-instance pool, one free list per template.
///
/// `release` is asynchronous: the instance is only reported back through
/// `drain_returned`, which the scheduler polls once per cycle. The deferred
/// report is what lets the coordinator commit the record's final grid
/// position after the engine has truly let go of the instance.
pub trait InstancePool {
    /// Claims a free instance of the given template, if any.
    fn acquire(&mut self, template: &str) -> Option<InstanceId>;
    /// Hands an instance back. Takes effect at the next `drain_returned`.
    fn release(&mut self, id: InstanceId);
    /// Instances whose release has completed since the last drain.
    fn drain_returned(&mut self) -> Vec<InstanceId>;
}

/// Fixed-capacity pool with per-template free lists.
#[derive(Debug, Default)]
pub struct FixedPool {
    free: BTreeMap<String, Vec<InstanceId>>,
    template_of: BTreeMap<InstanceId, String>,
    returned: VecDeque<InstanceId>,
    next_id: u64,
}

impl FixedPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool sized from the config's template table.
    pub fn from_config(config: &Config) -> Self {
        let mut pool = Self::new();
        for tpl in &config.templates {
            pool.add_template(&tpl.id, tpl.pool_size);
        }
        pool
    }

    /// Registers a template with the given capacity.
    pub fn add_template(&mut self, template: &str, capacity: usize) {
        let free = self.free.entry(template.to_string()).or_default();
        for _ in 0..capacity {
            let id = InstanceId(self.next_id);
            self.next_id += 1;
            self.template_of.insert(id, template.to_string());
            free.push(id);
        }
    }

    /// Free instances remaining for a template.
    pub fn free_count(&self, template: &str) -> usize {
        self.free.get(template).map(Vec::len).unwrap_or(0)
    }
}

impl InstancePool for FixedPool {
    fn acquire(&mut self, template: &str) -> Option<InstanceId> {
        self.free.get_mut(template)?.pop()
    }

    fn release(&mut self, id: InstanceId) {
        self.returned.push_back(id);
    }

    fn drain_returned(&mut self) -> Vec<InstanceId> {
        let drained: Vec<InstanceId> = self.returned.drain(..).collect();
        for id in &drained {
            if let Some(template) = self.template_of.get(id) {
                self.free.entry(template.clone()).or_default().push(*id);
            }
        }
        drained
    }
}

/// Navigation provider for bound instances.
pub trait Navigator {
    /// Teleports the instance; false if the position is off the navigable
    /// surface, in which case the instance has not moved.
    fn warp(&mut self, id: InstanceId, pos: Vec3) -> bool;
    /// Starts walking toward a target.
    fn move_to(&mut self, id: InstanceId, target: Vec3);
    /// Whether the instance has reached its last assigned target.
    fn is_at_destination(&self, id: InstanceId) -> bool;
    /// Current world transform of the instance, if known.
    fn transform(&self, id: InstanceId) -> Option<(Vec3, f32)>;
    /// Advances all agents by `dt` seconds.
    fn step(&mut self, dt: f32);
}

#[derive(Debug)]
struct NavAgent {
    pos: Vec3,
    rotation: f32,
    target: Option<Vec3>,
    arrived: bool,
}

/// Straight-line navigation over a bounded plane.
///
/// Good enough for headless runs: no obstacle avoidance, just constant-speed
/// motion toward the target. Warps outside the navigable bounds fail the way
/// a navmesh lookup would.
#[derive(Debug)]
pub struct StraightLineNav {
    agents: BTreeMap<InstanceId, NavAgent>,
    min: Vec3,
    max: Vec3,
    speed: f32,
    arrive_epsilon: f32,
}

impl StraightLineNav {
    pub fn new(min: Vec3, max: Vec3, speed: f32, arrive_epsilon: f32) -> Self {
        Self {
            agents: BTreeMap::new(),
            min,
            max,
            speed,
            arrive_epsilon,
        }
    }

    pub fn from_tuning(tuning: &Tuning) -> Self {
        let m = tuning.navigable_min;
        let x = tuning.navigable_max;
        Self::new(
            Vec3::new(m[0], m[1], m[2]),
            Vec3::new(x[0], x[1], x[2]),
            tuning.walk_speed,
            tuning.arrive_epsilon,
        )
    }

    fn in_bounds(&self, pos: Vec3) -> bool {
        pos.x >= self.min.x
            && pos.x <= self.max.x
            && pos.y >= self.min.y
            && pos.y <= self.max.y
            && pos.z >= self.min.z
            && pos.z <= self.max.z
    }
}

impl Navigator for StraightLineNav {
    fn warp(&mut self, id: InstanceId, pos: Vec3) -> bool {
        if !self.in_bounds(pos) {
            return false;
        }
        let agent = self.agents.entry(id).or_insert(NavAgent {
            pos,
            rotation: 0.0,
            target: None,
            arrived: true,
        });
        agent.pos = pos;
        agent.target = None;
        agent.arrived = true;
        true
    }

    fn move_to(&mut self, id: InstanceId, target: Vec3) {
        if let Some(agent) = self.agents.get_mut(&id) {
            agent.target = Some(target);
            agent.arrived = false;
        }
    }

    fn is_at_destination(&self, id: InstanceId) -> bool {
        self.agents.get(&id).map(|a| a.arrived).unwrap_or(false)
    }

    fn transform(&self, id: InstanceId) -> Option<(Vec3, f32)> {
        self.agents.get(&id).map(|a| (a.pos, a.rotation))
    }

    fn step(&mut self, dt: f32) {
        for agent in self.agents.values_mut() {
            let Some(target) = agent.target else {
                continue;
            };
            let to_target = target - agent.pos;
            let dist = to_target.length();
            let step = self.speed * dt;
            if dist <= step.max(self.arrive_epsilon) {
                agent.pos = target;
                agent.target = None;
                agent.arrived = true;
            } else {
                let dir = to_target.normalized();
                agent.pos = agent.pos + dir * step;
                agent.rotation = dir.x.atan2(dir.z);
            }
        }
    }
}

/// A shared, contended resource: one counter plus a bounded waiting line.
#[derive(Debug, Clone)]
pub struct ServicePoint {
    pub id: String,
    pub position: Vec3,
    occupant: Option<RecordId>,
    slots: Vec<Option<RecordId>>,
}

/// Spacing between waiting-line slots, world units.
const QUEUE_SLOT_SPACING: f32 = 1.5;

impl ServicePoint {
    pub fn new(id: impl Into<String>, position: Vec3, queue_slots: usize) -> Self {
        Self {
            id: id.into(),
            position,
            occupant: None,
            slots: vec![None; queue_slots],
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }

    /// Claims the counter for a record; false if already occupied.
    pub fn try_claim(&mut self, record: &RecordId) -> bool {
        if self.occupant.is_some() {
            return false;
        }
        self.occupant = Some(record.clone());
        true
    }

    /// Releases the counter. Returns the record that held it, if any.
    pub fn release(&mut self) -> Option<RecordId> {
        self.occupant.take()
    }

    /// Joins the back of the waiting line. The line is kept compact, so
    /// the first free slot is always behind every earlier arrival.
    pub fn try_enqueue(&mut self, record: &RecordId) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(record.clone());
        Some(slot)
    }

    /// Removes a record from the waiting line and closes the gap, moving
    /// everyone behind it one slot forward. Slot order is arrival order.
    pub fn leave_queue(&mut self, record: &RecordId) {
        if let Some(pos) = self.slots.iter().position(|s| s.as_ref() == Some(record)) {
            self.slots.remove(pos);
            self.slots.push(None);
        }
    }

    /// Record at the head of the waiting line, if any.
    pub fn head_of_queue(&self) -> Option<&RecordId> {
        self.slots.iter().flatten().next()
    }

    /// Occupied waiting slots.
    pub fn queue_len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// World position of a waiting slot.
    pub fn slot_position(&self, slot: usize) -> Vec3 {
        self.position + Vec3::new(0.0, 0.0, QUEUE_SLOT_SPACING * (slot as f32 + 1.0))
    }
}

/// Registry of service points, keyed by id.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServicePoint>,
}

impl ServiceRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::default();
        for svc in &config.services {
            registry.insert(ServicePoint::new(
                &svc.id,
                Vec3::new(svc.position[0], svc.position[1], svc.position[2]),
                svc.queue_slots,
            ));
        }
        registry
    }

    pub fn insert(&mut self, service: ServicePoint) {
        self.services.insert(service.id.clone(), service);
    }

    pub fn get(&self, id: &str) -> Option<&ServicePoint> {
        self.services.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ServicePoint> {
        self.services.get_mut(id)
    }
}

/// An event addressed to one record, or broadcast to all.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressedEvent {
    pub to: Option<RecordId>,
    pub event: NpcEvent,
}

/// Single-threaded publish/subscribe queue of domain events.
///
/// Publishing never dispatches re-entrantly; the scheduler drains the queue
/// once per cycle and routes each event to the live state machine or the
/// record's pending queue.
#[derive(Debug, Default)]
pub struct EventBus {
    queue: VecDeque<AddressedEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event to a single record.
    pub fn publish_to(&mut self, to: RecordId, event: NpcEvent) {
        self.queue.push_back(AddressedEvent {
            to: Some(to),
            event,
        });
    }

    /// Publishes an event to every record.
    pub fn broadcast(&mut self, event: NpcEvent) {
        self.queue.push_back(AddressedEvent { to: None, event });
    }

    /// Takes everything published since the last drain.
    pub fn drain(&mut self) -> Vec<AddressedEvent> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
