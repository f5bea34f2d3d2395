//! Shared data types for the NPC population simulation.
//!
//! This crate contains pure data structures with no simulation logic.
//! It is a dependency for all other crates in the workspace.

pub mod clock;
pub mod event;
pub mod tag;
pub mod vec;

// Re-export clock types
pub use clock::{DayTime, ParseTimeError, TimeRange, MINUTES_PER_DAY};

// Re-export event types
pub use event::NpcEvent;

// Re-export state tag types
pub use tag::{FullKey, FullTag, ReducedTag, StateDomain, StateTag};

// Re-export math types
pub use vec::Vec3;
