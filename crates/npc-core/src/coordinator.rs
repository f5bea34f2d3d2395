//! Tier promotion and demotion.
//!
//! The coordinator owns the binding between persistent records and pooled
//! live instances. Activation is atomic: pool acquisition, navmesh warp,
//! pending-event replay, state mapping, and machine start either all happen
//! or the record is left untouched in the reduced tier. Deactivation is the
//! reverse, except that the record's grid re-insertion waits for the pool's
//! deferred return report so the spatial index never holds a record whose
//! instance is still winding down.

use npc_events::{FullTag, NpcEvent, ReducedTag, Vec3};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::grid::GridIndex;
use crate::record::{NpcRecord, RecordId, RecordTable};
use crate::reduced::{self, ReducedEnv};
use crate::runner::{RunnerDeps, StateMachineRunner};
use crate::services::{InstanceId, InstancePool};

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),
    #[error("record {0} is already active")]
    AlreadyActive(RecordId),
    #[error("no free instance for template {template}")]
    PoolExhausted { template: String },
    #[error("position {position} is off the navigable surface")]
    OffNavmesh { position: Vec3 },
}

/// Running totals, reported by the demo binary at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct TierStats {
    pub activated: u64,
    pub deactivated: u64,
    pub deferred_non_interruptible: u64,
    pub resynced: u64,
}

#[derive(Debug, Default)]
pub struct ActivationCoordinator {
    bound: BTreeMap<InstanceId, RecordId>,
    /// Instances released but not yet reported back by the pool. The value
    /// is the record awaiting grid re-insertion.
    pending_release: BTreeMap<InstanceId, RecordId>,
    stats: TierStats,
}

impl ActivationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> TierStats {
        self.stats
    }

    pub fn record_of(&self, instance: InstanceId) -> Option<&RecordId> {
        self.bound.get(&instance)
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }

    /// Promotes a record to the full tier.
    pub fn activate(
        &mut self,
        id: &RecordId,
        records: &mut RecordTable,
        grid: &mut GridIndex,
        pool: &mut dyn InstancePool,
        runner: &mut StateMachineRunner,
        deps: &mut RunnerDeps<'_>,
    ) -> Result<InstanceId, ActivationError> {
        let (template, position) = {
            let record = records
                .get(id)
                .ok_or_else(|| ActivationError::UnknownRecord(id.clone()))?;
            if record.active {
                return Err(ActivationError::AlreadyActive(id.clone()));
            }
            (record.template.clone(), record.position)
        };

        let instance = pool
            .acquire(&template)
            .ok_or(ActivationError::PoolExhausted { template })?;

        if !deps.nav.warp(instance, position) {
            // Abort without side effects; the instance goes straight back
            // through the deferred-return path.
            pool.release(instance);
            return Err(ActivationError::OffNavmesh { position });
        }

        grid.remove(id, position);

        let start_tag = {
            let record = records
                .get_mut(id)
                .ok_or_else(|| ActivationError::UnknownRecord(id.clone()))?;
            record.active = true;
            record.bound_instance = Some(instance);
            let override_tag = replay_pending(record);
            match override_tag {
                Some(tag) => tag,
                None => deps.mapper.determine_activation_state(record, deps.services),
            }
        };

        self.bound.insert(instance, id.clone());
        runner.start(instance, id.clone(), start_tag, records, deps);
        self.stats.activated += 1;
        debug!(record = %id, instance = %instance, state = %start_tag, "record activated");
        Ok(instance)
    }

    /// Demotes a record to the reduced tier. Returns false when the current
    /// full state refuses interruption; the next scan will try again.
    pub fn deactivate(
        &mut self,
        id: &RecordId,
        records: &mut RecordTable,
        pool: &mut dyn InstancePool,
        runner: &mut StateMachineRunner,
        deps: &mut RunnerDeps<'_>,
    ) -> bool {
        let Some(instance) = records.get(id).and_then(|r| r.bound_instance) else {
            return false;
        };
        if !runner.is_interruptible(instance) {
            self.stats.deferred_non_interruptible += 1;
            return false;
        }

        // Commit the live transform before the instance disappears.
        let transform = deps.nav.transform(instance);
        let final_tag = runner
            .stop(instance, records, deps)
            .unwrap_or(FullTag::Idle);

        if let Some(record) = records.get_mut(id) {
            if let Some((pos, rot)) = transform {
                record.position = pos;
                record.rotation = rot;
            }
            record.active = false;
            record.bound_instance = None;
        }
        {
            let mut env = ReducedEnv {
                paths: deps.paths,
                tuning: deps.tuning,
                clock: deps.clock,
                rng: &mut *deps.rng,
            };
            if let Some(record) = records.get_mut(id) {
                let reduced_tag = deps.mapper.determine_deactivation_state(
                    record,
                    final_tag,
                    deps.services,
                    &mut env,
                );
                debug!(record = %id, instance = %instance, state = %reduced_tag,
                    "record deactivated");
            }
        }

        // A released counter claim must wake the head of the waiting line.
        if matches!(
            final_tag.key(),
            npc_events::FullKey::MovingToService | npc_events::FullKey::BeingServed
        ) {
            if let Some(service_id) = records.get(id).and_then(|r| r.service.clone()) {
                let next = deps
                    .services
                    .get(&service_id)
                    .and_then(|s| s.head_of_queue().cloned());
                if let Some(next) = next {
                    deps.bus
                        .publish_to(next, NpcEvent::ResourceFreed { service: service_id });
                }
            }
        }

        self.bound.remove(&instance);
        self.pending_release.insert(instance, id.clone());
        pool.release(instance);
        self.stats.deactivated += 1;
        true
    }

    /// Completes deactivations whose instances the pool has now reported
    /// back, re-inserting each record into the spatial index.
    pub fn finalize_returns(
        &mut self,
        pool: &mut dyn InstancePool,
        records: &RecordTable,
        grid: &mut GridIndex,
    ) {
        for instance in pool.drain_returned() {
            let Some(id) = self.pending_release.remove(&instance) else {
                continue;
            };
            let Some(record) = records.get(&id) else {
                continue;
            };
            if record.active {
                // Re-promoted while the return was in flight; the grid
                // entry belongs to the eventual next deactivation.
                continue;
            }
            grid.add(id, record.position);
        }
    }

    /// Force-unbinds an instance whose record linkage went inconsistent.
    /// The record drops back to idling at home in the reduced tier.
    pub fn resync(
        &mut self,
        instance: InstanceId,
        records: &mut RecordTable,
        pool: &mut dyn InstancePool,
        runner: &mut StateMachineRunner,
        deps: &mut RunnerDeps<'_>,
    ) {
        warn!(instance = %instance, "inconsistent record linkage; force unbinding");
        runner.forget(instance);

        let id = self
            .bound
            .remove(&instance)
            .or_else(|| {
                records
                    .iter()
                    .find(|r| r.bound_instance == Some(instance))
                    .map(|r| r.id.clone())
            });
        if let Some(id) = id {
            let mut env = ReducedEnv {
                paths: deps.paths,
                tuning: deps.tuning,
                clock: deps.clock,
                rng: &mut *deps.rng,
            };
            if let Some(record) = records.get_mut(&id) {
                record.active = false;
                record.bound_instance = None;
                reduced::enter(ReducedTag::IdleAtHome, record, &mut env);
            }
            self.pending_release.insert(instance, id);
        }
        pool.release(instance);
        self.stats.resynced += 1;
    }
}

/// Replays events queued while the record was in the reduced tier, turning
/// the most recent state-affecting one into an activation override.
fn replay_pending(record: &mut NpcRecord) -> Option<FullTag> {
    let mut override_tag = None;
    while let Some(event) = record.pending_events.pop_front() {
        match event {
            NpcEvent::DayStarted => {
                if let Some(path) = record.day_start_path.clone() {
                    record.path.start(path);
                    override_tag = Some(FullTag::FollowPath);
                }
            }
            NpcEvent::DayEnded => override_tag = Some(FullTag::Returning),
            NpcEvent::BecameImpatient => {
                if record.state.as_reduced() == Some(ReducedTag::WaitingForService) {
                    override_tag = Some(FullTag::GivingUp);
                }
            }
            NpcEvent::AssignmentReady { order_id } => {
                record.assignment = Some(order_id);
            }
            NpcEvent::ResourceFreed { .. } => {}
        }
    }
    override_tag
}
