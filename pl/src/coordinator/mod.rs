//! Lock coordinator
//!
//! One coordinator per front end owns a single hub connection at a time,
//! mirrors the hub's lock table and forwards lock/unlock requests. It runs as
//! a task; callers talk to it through a cloneable [`LockHandle`].
//!
//! Two rules keep its state honest:
//!
//! - **Supersede on reconnect**: each connection gets a fresh
//!   [`ConnectionId`](crate::hub::ConnectionId). Events from any connection
//!   other than the active one are ignored, so a late `Closed` from a
//!   torn-down connection cannot mark a newer live one as disconnected.
//! - **Stop after start**: teardown chains `stop()` behind the connection's
//!   pending `start()`, so the transport is never stopped mid-negotiation.
//!
//! ```rust,ignore
//! let coordinator = LockCoordinator::new(config, Capability::LockCapable, identity, factory);
//! let handle = coordinator.handle();
//! tokio::spawn(coordinator.run());
//!
//! handle.connect().await?;
//! handle.lock("42").await?;
//! ```

mod config;
mod core;
mod handle;
mod messages;

pub use config::CoordinatorConfig;
pub use self::core::LockCoordinator;
pub use handle::LockHandle;
pub use messages::{Capability, ConnectionState, CoordRequest, CoordinatorError, LockView};
