//! Persistent per-NPC records.
//!
//! A record is the authoritative identity of an NPC, independent of any live
//! instance. Records are created at load time (or spawned dynamically) and
//! live for the process lifetime, cycling between active (bound to a pooled
//! instance under full simulation) and inactive (reduced simulation only).

use npc_events::{NpcEvent, ReducedTag, StateTag, TimeRange, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::services::InstanceId;

/// Unique record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh id for a dynamically spawned record.
    pub fn generate() -> Self {
        Self(format!("npc_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Path-following working set for reduced simulation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathFollow {
    /// Configured path being walked, if any.
    pub path_id: Option<String>,
    /// Index of the waypoint currently targeted.
    pub waypoint: usize,
    /// Whether the path is being walked back-to-front.
    pub reverse: bool,
    /// Whether path following is currently driving movement.
    pub following: bool,
}

impl PathFollow {
    /// Points the working set at waypoint 0 of the given path.
    pub fn start(&mut self, path_id: impl Into<String>) {
        self.path_id = Some(path_id.into());
        self.waypoint = 0;
        self.reverse = false;
        self.following = true;
    }

    /// Clears path following without forgetting the last path.
    pub fn stop(&mut self) {
        self.following = false;
    }
}

/// Persistent per-NPC data, independent of any live instance.
#[derive(Debug, Clone)]
pub struct NpcRecord {
    pub id: RecordId,
    /// Opaque key naming the instance template to request from the pool.
    pub template: String,

    pub home_position: Vec3,
    pub home_rotation: f32,
    /// Authoritative world transform.
    pub position: Vec3,
    pub rotation: f32,

    /// True iff a live instance is bound. Invariant:
    /// `active == bound_instance.is_some()` at all times.
    pub active: bool,
    pub bound_instance: Option<InstanceId>,

    /// Current behavior state; full-domain while active, reduced otherwise.
    pub state: StateTag,

    /// Daily window in which the NPC may start its day.
    pub schedule_start: TimeRange,
    /// Daily window in which the NPC wraps up and heads home.
    pub schedule_end: TimeRange,
    pub can_start_day: bool,
    /// Path walked at day start, if configured.
    pub day_start_path: Option<String>,
    /// Service point this NPC visits, if configured.
    pub service: Option<String>,

    // Reduced-simulation working set.
    pub target_position: Option<Vec3>,
    pub state_timer: f32,
    pub path: PathFollow,

    /// Events received while inactive, replayed on next activation.
    pub pending_events: VecDeque<NpcEvent>,
    /// Per-record decision overrides, keyed by decision point id.
    pub overrides: HashMap<String, String>,
    /// Domain-specific assignment payload (e.g. an order id), opaque here.
    pub assignment: Option<String>,
}

impl NpcRecord {
    /// Creates an inactive record pinned at its home transform.
    pub fn new(id: RecordId, template: impl Into<String>, home: Vec3, rotation: f32) -> Self {
        Self {
            id,
            template: template.into(),
            home_position: home,
            home_rotation: rotation,
            position: home,
            rotation,
            active: false,
            bound_instance: None,
            state: StateTag::Reduced(ReducedTag::IdleAtHome),
            schedule_start: TimeRange::new(
                npc_events::DayTime::new(8, 0),
                npc_events::DayTime::new(10, 0),
            ),
            schedule_end: TimeRange::new(
                npc_events::DayTime::new(20, 0),
                npc_events::DayTime::new(22, 0),
            ),
            can_start_day: true,
            day_start_path: None,
            service: None,
            target_position: None,
            state_timer: 0.0,
            path: PathFollow::default(),
            pending_events: VecDeque::new(),
            overrides: HashMap::new(),
            assignment: None,
        }
    }

    /// Whether the active flag agrees with the binding.
    pub fn link_consistent(&self) -> bool {
        self.active == self.bound_instance.is_some()
    }

    /// The decision override for a decision point, if one is configured.
    pub fn override_for(&self, decision_point: &str) -> Option<&str> {
        self.overrides.get(decision_point).map(String::as_str)
    }

    /// Queues an event for replay, dropping exact duplicates.
    pub fn push_pending(&mut self, event: NpcEvent) {
        if !self.pending_events.contains(&event) {
            self.pending_events.push_back(event);
        }
    }
}

/// The table of all NPC records, keyed by id.
///
/// Iteration order is the id order, which keeps every batch drawn from the
/// table deterministic for a given population.
#[derive(Debug, Default)]
pub struct RecordTable {
    records: BTreeMap<RecordId, NpcRecord>,
}

/// Error inserting a record whose id is already taken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate record id: {0}")]
pub struct DuplicateRecord(pub RecordId);

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record; ids must be unique across the table.
    pub fn insert(&mut self, record: NpcRecord) -> Result<(), DuplicateRecord> {
        if self.records.contains_key(&record.id) {
            return Err(DuplicateRecord(record.id.clone()));
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, id: &RecordId) -> Option<&NpcRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &RecordId) -> Option<&mut NpcRecord> {
        self.records.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NpcRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NpcRecord> {
        self.records.values_mut()
    }

    /// Snapshot of all ids, in table order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.keys().cloned().collect()
    }

    /// Ids of all currently active records, in table order.
    pub fn active_ids(&self) -> Vec<RecordId> {
        self.records
            .values()
            .filter(|r| r.active)
            .map(|r| r.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut table = RecordTable::new();
        let rec = NpcRecord::new(RecordId::from("aiko"), "villager", Vec3::ZERO, 0.0);
        table.insert(rec.clone()).unwrap();
        assert_eq!(
            table.insert(rec),
            Err(DuplicateRecord(RecordId::from("aiko")))
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn new_record_is_inactive_and_consistent() {
        let rec = NpcRecord::new(RecordId::from("aiko"), "villager", Vec3::new(1.0, 0.0, 2.0), 0.5);
        assert!(!rec.active);
        assert!(rec.bound_instance.is_none());
        assert!(rec.link_consistent());
        assert_eq!(rec.position, rec.home_position);
    }

    #[test]
    fn pending_events_deduplicate() {
        let mut rec = NpcRecord::new(RecordId::from("aiko"), "villager", Vec3::ZERO, 0.0);
        rec.push_pending(NpcEvent::BecameImpatient);
        rec.push_pending(NpcEvent::BecameImpatient);
        assert_eq!(rec.pending_events.len(), 1);
        rec.push_pending(NpcEvent::DayEnded);
        assert_eq!(rec.pending_events.len(), 2);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("npc_"));
    }
}
