//! LockHandle - caller interface to a running coordinator

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use super::messages::{Capability, ConnectionState, CoordRequest, CoordinatorError, LockView};
use crate::events::{EventBus, LockEvent};
use crate::locks::LockSnapshot;

/// Cloneable handle to a [`LockCoordinator`](super::LockCoordinator)
///
/// Requests are queued to the coordinator task and processed in order.
/// `lock` and `unlock` are fire-and-forget: the snapshot only changes once the
/// hub broadcasts the result.
#[derive(Clone)]
pub struct LockHandle {
    tx: mpsc::Sender<CoordRequest>,
    capability: Capability,
    view_rx: watch::Receiver<LockView>,
    bus: Arc<EventBus>,
}

impl LockHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<CoordRequest>,
        capability: Capability,
        view_rx: watch::Receiver<LockView>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tx,
            capability,
            view_rx,
            bus,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    async fn send(&self, request: CoordRequest) -> Result<(), CoordinatorError> {
        self.tx.send(request).await.map_err(|_| CoordinatorError::ChannelClosed)
    }

    /// Mount: open a fresh hub connection, superseding any current one
    pub async fn connect(&self) -> Result<(), CoordinatorError> {
        debug!("LockHandle::connect: called");
        self.send(CoordRequest::Connect).await
    }

    /// Unmount: tear down the current hub connection
    pub async fn disconnect(&self) -> Result<(), CoordinatorError> {
        debug!("LockHandle::disconnect: called");
        self.send(CoordRequest::Disconnect).await
    }

    /// Ask the hub for the edit lock on `protocol_id`
    ///
    /// Fails only for read-only coordinators. While disconnected the request
    /// is dropped with a warning.
    pub async fn lock(&self, protocol_id: impl Into<String>) -> Result<(), CoordinatorError> {
        let protocol_id = protocol_id.into();
        debug!(%protocol_id, "LockHandle::lock: called");
        if !self.capability.can_lock() {
            return Err(CoordinatorError::ReadOnly);
        }
        self.send(CoordRequest::Lock { protocol_id }).await
    }

    /// Release the edit lock on `protocol_id`
    pub async fn unlock(&self, protocol_id: impl Into<String>) -> Result<(), CoordinatorError> {
        let protocol_id = protocol_id.into();
        debug!(%protocol_id, "LockHandle::unlock: called");
        if !self.capability.can_lock() {
            return Err(CoordinatorError::ReadOnly);
        }
        self.send(CoordRequest::Unlock { protocol_id }).await
    }

    /// Current view, after every request queued before this call was handled
    pub async fn view(&self) -> Result<LockView, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordRequest::GetView { reply_tx }).await?;
        reply_rx.await.map_err(|_| CoordinatorError::ChannelClosed)
    }

    /// Latest published view, without a round trip
    pub fn snapshot(&self) -> LockView {
        self.view_rx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.view_rx.borrow().state
    }

    pub fn locks(&self) -> LockSnapshot {
        self.view_rx.borrow().locks.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.view_rx.borrow().is_connected()
    }

    /// Receiver that sees every published view
    pub fn watch(&self) -> watch::Receiver<LockView> {
        self.view_rx.clone()
    }

    /// Observer events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.bus.subscribe()
    }

    /// Tear down and stop the coordinator task
    ///
    /// Returns once pending teardowns finished or the shutdown grace passed.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        debug!("LockHandle::shutdown: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordRequest::Shutdown { reply_tx }).await?;
        reply_rx.await.map_err(|_| CoordinatorError::ChannelClosed)
    }
}
