//! Lock state and the hub messages that drive it
//!
//! The hub is the only authority on who holds which lock. The client keeps a
//! [`LockSnapshot`] that is derived purely from the [`InboundEvent`] stream:
//! a full `ActiveLocks` snapshot replaces everything, `ProtocolLocked` and
//! `ProtocolUnlocked` patch single entries.

mod messages;
mod snapshot;

pub use messages::{InboundEvent, MessageError, OutboundRequest};
pub use snapshot::LockSnapshot;
