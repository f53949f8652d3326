//! Hub transport
//!
//! The coordinator talks to the shared protocol hub through the
//! [`HubConnection`] trait. Each connection object is created by a
//! [`HubConnectionFactory`] and tagged with a [`ConnectionId`]; everything
//! the connection reports (inbound invocations and lifecycle changes) flows
//! back through an [`EventSink`] carrying that id, so the receiver can tell a
//! current connection from a superseded one.
//!
//! # Implementations
//!
//! - [`WsHubConnection`] - direct WebSocket client for the JSON hub protocol
//!   with automatic reconnection
//! - [`mock::MockHub`] - in-process transport for tests

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub mod mock;
mod protocol;
mod retry;
mod websocket;

pub use protocol::{HandshakeRequest, HandshakeResponse, HubMessage, RECORD_SEPARATOR, split_frames};
pub use retry::{DEFAULT_RECONNECT_DELAYS_MS, RetryPolicy};
pub use websocket::{HubOptions, WsHubConnection, WsHubFactory, websocket_url};

/// Errors from hub transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed{}", .0.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    Closed(Option<String>),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Cannot stop a connection while it is still starting")]
    StopDuringStart,

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Connection was already started")]
    AlreadyStarted,

    #[error("Invocation failed: {0}")]
    Invocation(String),

    #[error("Invalid hub URL: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Generation number of a connection object
///
/// Assigned by whoever creates connections; strictly increasing, so a larger
/// id is always a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Things a connection reports after it has been created
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The hub invoked a client method
    Invocation { target: String, arguments: Vec<Value> },

    /// The transport dropped and automatic reconnection is in progress
    Reconnecting { error: Option<String> },

    /// Automatic reconnection succeeded
    Reconnected,

    /// The connection is closed for good (stopped, or retries exhausted)
    Closed { error: Option<String> },
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invocation { .. } => "Invocation",
            Self::Reconnecting { .. } => "Reconnecting",
            Self::Reconnected => "Reconnected",
            Self::Closed { .. } => "Closed",
        }
    }
}

/// A transport event tagged with the connection that raised it
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    pub connection: ConnectionId,
    pub event: TransportEvent,
}

/// Delivery handle a connection uses to report events
///
/// Cheap to clone. Emitting never blocks; if nobody is listening any more
/// the event is dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<HubEvent>,
}

impl EventSink {
    pub fn new(connection: ConnectionId, tx: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self { connection, tx }
    }

    /// Connection this sink tags events with
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn emit(&self, event: TransportEvent) {
        debug!(connection = %self.connection, kind = event.kind(), "EventSink::emit");
        let _ = self.tx.send(HubEvent {
            connection: self.connection,
            event,
        });
    }
}

/// One bidirectional hub connection
///
/// A connection is started once. `stop` must only be called after `start`
/// has settled; stopping while start is in flight fails with
/// [`TransportError::StopDuringStart`].
#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Identity of this connection object
    fn id(&self) -> ConnectionId;

    /// Open the connection and complete the hub handshake
    async fn start(&self) -> Result<(), TransportError>;

    /// Close the connection; emits [`TransportEvent::Closed`] when it was running
    async fn stop(&self) -> Result<(), TransportError>;

    /// Invoke a hub method and wait for its completion
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, TransportError>;
}

/// Creates connection objects bound to an event sink
pub trait HubConnectionFactory: Send + Sync {
    fn create(&self, id: ConnectionId, sink: EventSink) -> Arc<dyn HubConnection>;
}
