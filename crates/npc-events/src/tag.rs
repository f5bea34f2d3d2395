//! Behavior state tags.
//!
//! Every NPC is in exactly one behavior state at a time, named by a
//! `(domain, key)` pair: the domain says whether the NPC is running under
//! full simulation (live instance) or reduced simulation (record only), and
//! the key names the state within that domain. Each domain is its own sum
//! type; cross-domain mapping is a typed table keyed by these enums, never a
//! runtime type comparison.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which simulation tier a state tag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateDomain {
    Full,
    Reduced,
}

/// A full-simulation behavior state.
///
/// Tags may carry per-state payload (e.g. the claimed queue slot); table
/// lookups use the fieldless [`FullKey`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "key")]
pub enum FullTag {
    /// Standing at or around the home position.
    Idle,
    /// Walking back to the home position.
    Returning,
    /// Walking a configured waypoint path.
    FollowPath,
    /// Wandering near the current position; the generic fallback behavior.
    Patrol,
    /// Walking toward a claimed service point.
    MovingToService,
    /// Standing in a service point's waiting line.
    QueuedAtService { slot: usize },
    /// At the counter; an in-progress transaction that must complete.
    BeingServed,
    /// The waiting line was full; heading for an exit.
    GivingUp,
    /// Walking off the map.
    Leaving,
}

impl FullTag {
    /// The fieldless lookup key for this tag.
    pub fn key(self) -> FullKey {
        match self {
            FullTag::Idle => FullKey::Idle,
            FullTag::Returning => FullKey::Returning,
            FullTag::FollowPath => FullKey::FollowPath,
            FullTag::Patrol => FullKey::Patrol,
            FullTag::MovingToService => FullKey::MovingToService,
            FullTag::QueuedAtService { .. } => FullKey::QueuedAtService,
            FullTag::BeingServed => FullKey::BeingServed,
            FullTag::GivingUp => FullKey::GivingUp,
            FullTag::Leaving => FullKey::Leaving,
        }
    }
}

impl fmt::Display for FullTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FullTag::QueuedAtService { slot } => write!(f, "queued_at_service[{}]", slot),
            other => write!(f, "{}", other.key()),
        }
    }
}

/// Fieldless key identifying a full-simulation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullKey {
    Idle,
    Returning,
    FollowPath,
    Patrol,
    MovingToService,
    QueuedAtService,
    BeingServed,
    GivingUp,
    Leaving,
}

impl FullKey {
    /// Returns all full-state keys.
    pub fn all() -> &'static [FullKey] {
        &[
            FullKey::Idle,
            FullKey::Returning,
            FullKey::FollowPath,
            FullKey::Patrol,
            FullKey::MovingToService,
            FullKey::QueuedAtService,
            FullKey::BeingServed,
            FullKey::GivingUp,
            FullKey::Leaving,
        ]
    }
}

impl fmt::Display for FullKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FullKey::Idle => "idle",
            FullKey::Returning => "returning",
            FullKey::FollowPath => "follow_path",
            FullKey::Patrol => "patrol",
            FullKey::MovingToService => "moving_to_service",
            FullKey::QueuedAtService => "queued_at_service",
            FullKey::BeingServed => "being_served",
            FullKey::GivingUp => "giving_up",
            FullKey::Leaving => "leaving",
        };
        write!(f, "{}", name)
    }
}

/// A reduced-simulation behavior state.
///
/// Reduced tags carry no payload (the working set lives on the record), so
/// the tag is its own table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducedTag {
    /// Pinned at the home position until the schedule window opens.
    IdleAtHome,
    /// Advancing along a waypoint path at walking speed.
    FollowingPath,
    /// Drifting near the current position; the generic fallback tag.
    Patrol,
    /// At or near a service point, waiting for a turn.
    WaitingForService,
    /// Heading off the map.
    Leaving,
}

impl ReducedTag {
    /// Returns all reduced-state tags.
    pub fn all() -> &'static [ReducedTag] {
        &[
            ReducedTag::IdleAtHome,
            ReducedTag::FollowingPath,
            ReducedTag::Patrol,
            ReducedTag::WaitingForService,
            ReducedTag::Leaving,
        ]
    }
}

impl fmt::Display for ReducedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReducedTag::IdleAtHome => "idle_at_home",
            ReducedTag::FollowingPath => "following_path",
            ReducedTag::Patrol => "patrol",
            ReducedTag::WaitingForService => "waiting_for_service",
            ReducedTag::Leaving => "leaving",
        };
        write!(f, "{}", name)
    }
}

/// A `(domain, key)` state tag, valid in either simulation tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "domain", content = "state")]
pub enum StateTag {
    Full(FullTag),
    Reduced(ReducedTag),
}

impl StateTag {
    /// The domain half of the pair.
    pub fn domain(self) -> StateDomain {
        match self {
            StateTag::Full(_) => StateDomain::Full,
            StateTag::Reduced(_) => StateDomain::Reduced,
        }
    }

    /// The full tag, if this is a full-domain state.
    pub fn as_full(self) -> Option<FullTag> {
        match self {
            StateTag::Full(tag) => Some(tag),
            StateTag::Reduced(_) => None,
        }
    }

    /// The reduced tag, if this is a reduced-domain state.
    pub fn as_reduced(self) -> Option<ReducedTag> {
        match self {
            StateTag::Reduced(tag) => Some(tag),
            StateTag::Full(_) => None,
        }
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTag::Full(tag) => write!(f, "full/{}", tag),
            StateTag::Reduced(tag) => write!(f, "reduced/{}", tag),
        }
    }
}
