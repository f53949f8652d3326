//! Observer events
//!
//! A coordinator publishes what its callers may want to react to on a
//! `tokio::sync::broadcast` bus: protocol list changes, lock denials, state
//! transitions and snapshot changes. Subscribing is the stable replacement
//! for registering a callback that must be kept current by hand.
//!
//! ```rust,ignore
//! let bus = create_event_bus();
//! spawn_list_changed_listener(bus.subscribe(), || refetch_protocols());
//! ```

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, create_event_bus, spawn_list_changed_listener};
pub use types::LockEvent;
