//! ProtoLock - real-time edit-lock coordination for pump-test protocols
//!
//! Operator tablets and the supervisor dashboard share a hub that arbitrates
//! advisory edit locks on protocol records. This crate is the client side of
//! that arrangement: one coordinator per front end keeps a live hub
//! connection, mirrors the hub's lock table locally and lets lock-capable
//! callers request and release locks.
//!
//! # Core Concepts
//!
//! - **Server Is Truth**: lock state only changes when the hub broadcasts it,
//!   never optimistically on request
//! - **Supersede On Reconnect**: lifecycle events from a connection that is no
//!   longer current are ignored
//! - **Stop After Start**: teardown waits for an in-flight start to settle
//!   before stopping the transport
//!
//! # Modules
//!
//! - [`coordinator`] - Lock coordinator actor and its handle
//! - [`hub`] - Hub transport trait, JSON hub protocol, WebSocket client
//! - [`locks`] - Lock snapshot and inbound/outbound hub messages
//! - [`identity`] - Persisted device identity ("Tablet N")
//! - [`events`] - Observer bus for list changes, denials and state changes
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod hub;
pub mod identity;
pub mod locks;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{
    Capability, ConnectionState, CoordRequest, CoordinatorConfig, CoordinatorError, LockCoordinator, LockHandle,
    LockView,
};
pub use events::{EventBus, LockEvent, create_event_bus, spawn_list_changed_listener};
pub use hub::{
    ConnectionId, EventSink, HubConnection, HubConnectionFactory, HubEvent, HubMessage, HubOptions, RetryPolicy,
    TransportError, TransportEvent, WsHubConnection, WsHubFactory,
};
pub use identity::{DeviceIdentity, FileStore, IdentityError, KeyValueStore, MemoryStore};
pub use locks::{InboundEvent, LockSnapshot, OutboundRequest};
