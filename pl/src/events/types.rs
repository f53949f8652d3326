//! Observer event types

use serde::{Deserialize, Serialize};

use crate::coordinator::ConnectionState;

/// Everything a coordinator reports to its observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockEvent {
    /// The hub announced that the protocol list changed; callers refetch it
    ListChanged,

    /// The hub refused a lock request from this device
    LockDenied { protocol_id: String, holder: String },

    /// Connection state moved
    StateChanged { state: ConnectionState },

    /// The lock snapshot changed; `count` is the number of held locks
    LocksChanged { count: usize },
}

impl LockEvent {
    /// Short name used in logs
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ListChanged => "list_changed",
            Self::LockDenied { .. } => "lock_denied",
            Self::StateChanged { .. } => "state_changed",
            Self::LocksChanged { .. } => "locks_changed",
        }
    }
}
