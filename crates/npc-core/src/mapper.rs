//! Bidirectional state mapping between simulation tiers.
//!
//! Two typed tables keyed by the fieldless state keys: `full -> reduced` is
//! many-to-one and falls back to the generic patrol tag (with a diagnostic)
//! for unmapped keys; `reduced -> full` must be total, and a missing entry is
//! a configuration error caught at startup, never a silent fallback.
//!
//! On top of the tables sit the two resume hooks. Activation of a record
//! waiting on a shared resource is not a table lookup: the mapper negotiates
//! with the live service point (claim, then enqueue, then give up) so the
//! chosen full state reflects the world as it is now, not as it was at
//! demotion.

use npc_events::{FullKey, FullTag, ReducedTag};
use std::collections::HashMap;
use tracing::warn;

use crate::config::ConfigError;
use crate::record::NpcRecord;
use crate::reduced::{self, ReducedEnv};
use crate::services::ServiceRegistry;

/// Decision point consulted when the waiting line is full.
pub const DECISION_QUEUE_FULL: &str = "queue_full";

/// Bidirectional lookup between full and reduced state tags.
#[derive(Debug)]
pub struct StateMapper {
    full_to_reduced: HashMap<FullKey, ReducedTag>,
    reduced_to_full: HashMap<ReducedTag, FullKey>,
}

impl StateMapper {
    /// The canonical mapping used by this subsystem.
    pub fn standard() -> Self {
        let mut full_to_reduced = HashMap::new();
        full_to_reduced.insert(FullKey::Idle, ReducedTag::IdleAtHome);
        full_to_reduced.insert(FullKey::Returning, ReducedTag::IdleAtHome);
        full_to_reduced.insert(FullKey::FollowPath, ReducedTag::FollowingPath);
        full_to_reduced.insert(FullKey::Patrol, ReducedTag::Patrol);
        full_to_reduced.insert(FullKey::MovingToService, ReducedTag::WaitingForService);
        full_to_reduced.insert(FullKey::QueuedAtService, ReducedTag::WaitingForService);
        full_to_reduced.insert(FullKey::BeingServed, ReducedTag::WaitingForService);
        full_to_reduced.insert(FullKey::GivingUp, ReducedTag::Leaving);
        full_to_reduced.insert(FullKey::Leaving, ReducedTag::Leaving);

        let mut reduced_to_full = HashMap::new();
        reduced_to_full.insert(ReducedTag::IdleAtHome, FullKey::Idle);
        reduced_to_full.insert(ReducedTag::FollowingPath, FullKey::FollowPath);
        reduced_to_full.insert(ReducedTag::Patrol, FullKey::Patrol);
        reduced_to_full.insert(ReducedTag::WaitingForService, FullKey::MovingToService);
        reduced_to_full.insert(ReducedTag::Leaving, FullKey::Leaving);

        Self {
            full_to_reduced,
            reduced_to_full,
        }
    }

    /// Checks that the reduced table is total and every mapped full key can
    /// stand alone as a starting state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tag in ReducedTag::all() {
            let key = self
                .reduced_to_full
                .get(tag)
                .ok_or_else(|| ConfigError::MissingReducedMapping(tag.to_string()))?;
            if tag_from_key(*key).is_none() {
                return Err(ConfigError::MissingReducedMapping(tag.to_string()));
            }
        }
        Ok(())
    }

    /// Full -> reduced table lookup, falling back to the generic patrol tag.
    pub fn to_reduced(&self, key: FullKey) -> ReducedTag {
        match self.full_to_reduced.get(&key) {
            Some(tag) => *tag,
            None => {
                warn!(full_state = %key, "no reduced mapping; falling back to patrol");
                ReducedTag::Patrol
            }
        }
    }

    /// Reduced -> full table lookup. Missing entries are a configuration
    /// error surfaced by `validate`, so this never invents a fallback.
    pub fn to_full(&self, tag: ReducedTag) -> Result<FullKey, ConfigError> {
        self.reduced_to_full
            .get(&tag)
            .copied()
            .ok_or_else(|| ConfigError::MissingReducedMapping(tag.to_string()))
    }

    /// Chooses the full state an activating record starts in.
    ///
    /// Table lookup by default. A record waiting on a shared resource
    /// negotiates with the live service point instead: claim the counter if
    /// free, otherwise take a waiting slot, otherwise give up (subject to
    /// the record's `queue_full` decision override).
    pub fn determine_activation_state(
        &self,
        record: &NpcRecord,
        services: &mut ServiceRegistry,
    ) -> FullTag {
        let reduced = match record.state.as_reduced() {
            Some(tag) => tag,
            None => {
                warn!(record = %record.id, state = %record.state,
                    "activation of a record already in the full domain");
                return record.state.as_full().unwrap_or(FullTag::Patrol);
            }
        };

        if reduced == ReducedTag::WaitingForService {
            return self.negotiate_service(record, services);
        }

        match self.to_full(reduced).ok().and_then(tag_from_key) {
            Some(tag) => tag,
            None => {
                warn!(record = %record.id, reduced_state = %reduced,
                    "unusable activation mapping; starting in patrol");
                FullTag::Patrol
            }
        }
    }

    /// Live negotiation against the record's bound service point.
    pub fn negotiate_service(&self, record: &NpcRecord, services: &mut ServiceRegistry) -> FullTag {
        let Some(service_id) = record.service.as_deref() else {
            warn!(record = %record.id, "waiting for service without a bound service point");
            return FullTag::Patrol;
        };
        let Some(svc) = services.get_mut(service_id) else {
            warn!(record = %record.id, service = service_id, "unknown service point");
            return FullTag::Patrol;
        };
        if svc.try_claim(&record.id) {
            return FullTag::MovingToService;
        }
        if let Some(slot) = svc.try_enqueue(&record.id) {
            return FullTag::QueuedAtService { slot };
        }
        if record.override_for(DECISION_QUEUE_FULL) == Some("keep_waiting") {
            return FullTag::Patrol;
        }
        FullTag::GivingUp
    }

    /// Chooses the reduced state a deactivating record lands in, releasing
    /// any shared-resource stake and running the reduced entry hook so the
    /// stepper resumes with a fresh timer and target.
    pub fn determine_deactivation_state(
        &self,
        record: &mut NpcRecord,
        current: FullTag,
        services: &mut ServiceRegistry,
        env: &mut ReducedEnv<'_>,
    ) -> ReducedTag {
        match current.key() {
            FullKey::MovingToService | FullKey::BeingServed => {
                if let Some(svc) = record.service.as_deref().and_then(|s| services.get_mut(s)) {
                    svc.release();
                }
            }
            FullKey::QueuedAtService => {
                if let Some(svc) = record.service.as_deref().and_then(|s| services.get_mut(s)) {
                    svc.leave_queue(&record.id);
                }
            }
            _ => {}
        }
        let tag = self.to_reduced(current.key());
        reduced::enter(tag, record, env);
        tag
    }
}

/// Builds a payload-free full tag from a key, where one exists.
///
/// `QueuedAtService` carries a slot index and only ever arises from live
/// negotiation, so it has no table-constructible form.
pub fn tag_from_key(key: FullKey) -> Option<FullTag> {
    match key {
        FullKey::Idle => Some(FullTag::Idle),
        FullKey::Returning => Some(FullTag::Returning),
        FullKey::FollowPath => Some(FullTag::FollowPath),
        FullKey::Patrol => Some(FullTag::Patrol),
        FullKey::MovingToService => Some(FullTag::MovingToService),
        FullKey::QueuedAtService => None,
        FullKey::BeingServed => Some(FullTag::BeingServed),
        FullKey::GivingUp => Some(FullTag::GivingUp),
        FullKey::Leaving => Some(FullTag::Leaving),
    }
}
