//! Reduced-state behaviors.
//!
//! Cheap approximate simulation for records without a live instance: each
//! reduced tag has an entry hook that freshens the working set (timer,
//! target) and a tick function that advances straight-line kinematics on the
//! record itself. Transition conditions that are locally decidable switch
//! the tag in place; anything that depends on state the reduced tier cannot
//! see (the global schedule, a contended counter) pushes a pending event
//! instead, to be replayed at the next activation.

use npc_events::{DayTime, NpcEvent, ReducedTag, StateTag, Vec3};
use rand::rngs::SmallRng;
use rand::Rng;
use tracing::debug;

use crate::config::{PathRegistry, Tuning};
use crate::record::NpcRecord;

/// Everything a reduced behavior may consult.
pub struct ReducedEnv<'a> {
    pub paths: &'a PathRegistry,
    pub tuning: &'a Tuning,
    pub clock: DayTime,
    pub rng: &'a mut SmallRng,
}

/// How long an idle record waits between schedule re-checks, seconds.
const IDLE_RECHECK: f32 = 30.0;

/// Chooses and applies the initial reduced state for a freshly loaded
/// record.
///
/// Before the schedule window opens the record idles pinned at home; once
/// the window has opened and the record may start its day, it is placed at
/// waypoint 0 of its day-start path.
pub fn place_initial(record: &mut NpcRecord, env: &mut ReducedEnv<'_>) {
    let day_started = record.schedule_start.started_at(env.clock)
        || record.schedule_start.passed_today(env.clock);
    if day_started && record.can_start_day {
        if let Some(path_id) = record.day_start_path.clone() {
            if let Some(first) = env.paths.waypoint(&path_id, 0, false) {
                record.path.start(path_id);
                record.position = first;
                record.rotation = record.home_rotation;
                enter(ReducedTag::FollowingPath, record, env);
                return;
            }
        }
    }
    record.position = record.home_position;
    record.rotation = record.home_rotation;
    enter(ReducedTag::IdleAtHome, record, env);
}

/// Entry hook: sets the tag and (re)populates the working set so the
/// stepper can resume this record correctly.
pub fn enter(tag: ReducedTag, record: &mut NpcRecord, env: &mut ReducedEnv<'_>) {
    record.state = StateTag::Reduced(tag);
    match tag {
        ReducedTag::IdleAtHome => {
            record.path.stop();
            record.state_timer = IDLE_RECHECK;
            let home = record.home_position;
            if record.position.distance(home) > env.tuning.arrive_epsilon {
                record.target_position = Some(home);
            } else {
                record.target_position = None;
            }
        }
        ReducedTag::FollowingPath => {
            if !record.path.following {
                if let Some(path_id) = record.day_start_path.clone() {
                    record.path.start(path_id);
                }
            }
            record.state_timer = 0.0;
            record.target_position = current_waypoint(record, env);
            if record.target_position.is_none() {
                // No usable path; fall through to the generic fallback.
                enter(ReducedTag::Patrol, record, env);
            }
        }
        ReducedTag::Patrol => {
            record.path.stop();
            record.state_timer = env.rng.gen_range(10.0..30.0);
            record.target_position = Some(drift_target(record.position, env));
        }
        ReducedTag::WaitingForService => {
            record.path.stop();
            record.state_timer = env.tuning.patience;
            record.target_position = None;
        }
        ReducedTag::Leaving => {
            record.path.stop();
            record.state_timer = 0.0;
            record.target_position = env.tuning.nearest_exit(record.position);
        }
    }
}

/// Exit hook: drops the movement target; path progress is kept so a later
/// resume can pick the walk back up.
pub fn exit(tag: ReducedTag, record: &mut NpcRecord) {
    let _ = tag;
    record.target_position = None;
}

/// Switches reduced tags in place, running both hooks.
pub fn transition(to: ReducedTag, record: &mut NpcRecord, env: &mut ReducedEnv<'_>) {
    if let Some(from) = record.state.as_reduced() {
        exit(from, record);
    }
    enter(to, record, env);
}

/// Advances one inactive record by `dt` seconds of reduced simulation.
pub fn tick(record: &mut NpcRecord, dt: f32, env: &mut ReducedEnv<'_>) {
    let Some(tag) = record.state.as_reduced() else {
        debug!(record = %record.id, state = %record.state, "reduced tick on full-domain record");
        return;
    };

    let arrived = advance_kinematics(record, dt, env.tuning);
    record.state_timer = (record.state_timer - dt).max(0.0);

    match tag {
        ReducedTag::IdleAtHome => {
            if record.state_timer <= 0.0 {
                record.state_timer = IDLE_RECHECK;
                // Starting the day depends on the global schedule, which the
                // reduced tier does not own; queue it for activation replay.
                if record.can_start_day
                    && record.day_start_path.is_some()
                    && record.schedule_start.started_at(env.clock)
                {
                    record.push_pending(NpcEvent::DayStarted);
                }
            }
        }
        ReducedTag::FollowingPath => {
            if arrived {
                advance_waypoint(record, env);
            }
        }
        ReducedTag::Patrol => {
            if record.schedule_end.started_at(env.clock) {
                record.push_pending(NpcEvent::DayEnded);
            }
            if arrived || record.state_timer <= 0.0 {
                record.state_timer = env.rng.gen_range(10.0..30.0);
                record.target_position = Some(drift_target(record.position, env));
            }
        }
        ReducedTag::WaitingForService => {
            if record.state_timer <= 0.0 {
                // Whether to give up depends on the live queue; the stepper
                // cannot see it, so the decision is deferred.
                record.push_pending(NpcEvent::BecameImpatient);
                record.state_timer = env.tuning.patience;
            }
        }
        ReducedTag::Leaving => {
            if arrived || record.target_position.is_none() {
                // Off the map and unobserved: resume the next morning at home.
                record.position = record.home_position;
                record.rotation = record.home_rotation;
                transition(ReducedTag::IdleAtHome, record, env);
            }
        }
    }
}

/// Straight-line motion toward the working-set target. Returns true when
/// the target was reached this tick.
fn advance_kinematics(record: &mut NpcRecord, dt: f32, tuning: &Tuning) -> bool {
    let Some(target) = record.target_position else {
        return false;
    };
    let to_target = target - record.position;
    let dist = to_target.length();
    let step = tuning.reduced_speed * dt;
    if dist <= step.max(tuning.arrive_epsilon) {
        record.position = target;
        record.target_position = None;
        true
    } else {
        record.position = record.position + to_target.normalized() * step;
        false
    }
}

fn current_waypoint(record: &NpcRecord, env: &ReducedEnv<'_>) -> Option<Vec3> {
    let path_id = record.path.path_id.as_deref()?;
    env.paths
        .waypoint(path_id, record.path.waypoint, record.path.reverse)
}

/// Steps to the next waypoint, or resolves the end of the path.
fn advance_waypoint(record: &mut NpcRecord, env: &mut ReducedEnv<'_>) {
    let Some(path_id) = record.path.path_id.clone() else {
        transition(ReducedTag::Patrol, record, env);
        return;
    };
    let len = env.paths.len_of(&path_id);
    let next = record.path.waypoint + 1;
    if next < len {
        record.path.waypoint = next;
        record.target_position = env.paths.waypoint(&path_id, next, record.path.reverse);
        return;
    }
    // End of path: a bound service means the walk was an errand.
    record.path.stop();
    if record.service.is_some() {
        transition(ReducedTag::WaitingForService, record, env);
    } else if record.position.distance(record.home_position) <= env.tuning.patrol_radius {
        transition(ReducedTag::IdleAtHome, record, env);
    } else {
        transition(ReducedTag::Patrol, record, env);
    }
}

fn drift_target(around: Vec3, env: &mut ReducedEnv<'_>) -> Vec3 {
    let r = env.tuning.patrol_radius;
    let dx = env.rng.gen_range(-r..r);
    let dz = env.rng.gen_range(-r..r);
    Vec3::new(around.x + dx, around.y, around.z + dz)
}
