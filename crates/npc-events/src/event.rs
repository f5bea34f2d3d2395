//! Domain events.
//!
//! Events flow over the world's event bus. An event addressed to an active
//! record is handled by its live state machine; one addressed to an inactive
//! record is queued on the record and replayed at its next activation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A domain event an NPC can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NpcEvent {
    /// The record's daily schedule window has opened.
    DayStarted,
    /// The record's daily schedule window has closed.
    DayEnded,
    /// A service point's counter became free.
    ResourceFreed { service: String },
    /// The NPC ran out of patience while waiting.
    BecameImpatient,
    /// A previously placed order is ready for pickup.
    AssignmentReady { order_id: String },
}

impl fmt::Display for NpcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NpcEvent::DayStarted => write!(f, "day_started"),
            NpcEvent::DayEnded => write!(f, "day_ended"),
            NpcEvent::ResourceFreed { service } => write!(f, "resource_freed({})", service),
            NpcEvent::BecameImpatient => write!(f, "became_impatient"),
            NpcEvent::AssignmentReady { order_id } => write!(f, "assignment_ready({})", order_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip() {
        let evt = NpcEvent::ResourceFreed {
            service: "bakery_counter".to_string(),
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains("resource_freed"));
        let back: NpcEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, evt);
    }
}
