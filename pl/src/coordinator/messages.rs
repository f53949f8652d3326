//! Coordinator message and view types

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::hub::{ConnectionId, TransportError};
use crate::locks::LockSnapshot;

/// Whether a coordinator may request locks
///
/// Supervisor dashboards watch; operator tablets edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ReadOnly,
    LockCapable,
}

impl Capability {
    pub fn can_lock(self) -> bool {
        matches!(self, Self::LockCapable)
    }
}

/// Health of the coordinator's hub connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Read-only view of a coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockView {
    pub state: ConnectionState,
    pub locks: LockSnapshot,
}

impl LockView {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Errors returned to coordinator callers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("coordinator is read-only and cannot lock or unlock protocols")]
    ReadOnly,

    #[error("coordinator channel closed")]
    ChannelClosed,
}

/// Requests from handles to the coordinator task
#[derive(Debug)]
pub enum CoordRequest {
    /// Mount: replace any current connection with a fresh one and start it
    Connect,

    /// Unmount: tear down the current connection
    Disconnect,

    Lock { protocol_id: String },

    Unlock { protocol_id: String },

    GetView { reply_tx: oneshot::Sender<LockView> },

    /// Tear down and stop the coordinator task
    Shutdown { reply_tx: oneshot::Sender<()> },
}

/// Outcome of a background `start`, reported back to the coordinator task
#[derive(Debug)]
pub(crate) struct StartSettled {
    pub connection: ConnectionId,
    pub result: Result<(), TransportError>,
}
