//! Coordinator task implementation

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::CoordinatorConfig;
use super::handle::LockHandle;
use super::messages::{Capability, ConnectionState, CoordRequest, LockView, StartSettled};
use crate::events::{EventBus, LockEvent};
use crate::hub::{ConnectionId, EventSink, HubConnection, HubConnectionFactory, HubEvent, TransportEvent};
use crate::identity::DeviceIdentity;
use crate::locks::{InboundEvent, LockSnapshot, OutboundRequest};

/// The connection currently considered live
struct ActiveConnection {
    id: ConnectionId,
    connection: Arc<dyn HubConnection>,
    start_task: JoinHandle<()>,
}

/// Owns the hub connection, lock snapshot and connection state
///
/// Everything runs on one task; handles reach it over a request channel and
/// connections report back over an event channel. Hub events are drained
/// before requests, so a request observes every event that arrived before it.
pub struct LockCoordinator {
    config: CoordinatorConfig,
    capability: Capability,
    identity: Arc<DeviceIdentity>,
    factory: Arc<dyn HubConnectionFactory>,

    tx: Option<mpsc::Sender<CoordRequest>>,
    rx: mpsc::Receiver<CoordRequest>,
    hub_tx: mpsc::UnboundedSender<HubEvent>,
    hub_rx: mpsc::UnboundedReceiver<HubEvent>,
    settled_tx: mpsc::UnboundedSender<StartSettled>,
    settled_rx: mpsc::UnboundedReceiver<StartSettled>,

    view_tx: watch::Sender<LockView>,
    view_rx: watch::Receiver<LockView>,
    bus: Arc<EventBus>,

    next_id: u64,
    active: Option<ActiveConnection>,
    state: ConnectionState,
    snapshot: LockSnapshot,
    teardowns: Vec<JoinHandle<()>>,
}

impl LockCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        capability: Capability,
        identity: Arc<DeviceIdentity>,
        factory: Arc<dyn HubConnectionFactory>,
    ) -> Self {
        debug!(?config, ?capability, "LockCoordinator::new");
        let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(LockView::default());
        let bus = Arc::new(EventBus::new(config.event_capacity));

        Self {
            config,
            capability,
            identity,
            factory,
            tx: Some(tx),
            rx,
            hub_tx,
            hub_rx,
            settled_tx,
            settled_rx,
            view_tx,
            view_rx,
            bus,
            next_id: 0,
            active: None,
            state: ConnectionState::Disconnected,
            snapshot: LockSnapshot::new(),
            teardowns: Vec::new(),
        }
    }

    /// Create a handle; call before [`run`](Self::run)
    ///
    /// Once `run` has started, new handles come from cloning existing ones.
    pub fn handle(&self) -> LockHandle {
        let tx = match &self.tx {
            Some(tx) => tx.clone(),
            // Unreachable in practice: run() consumes self
            None => mpsc::channel(1).0,
        };
        LockHandle::new(tx, self.capability, self.view_rx.clone(), self.bus.clone())
    }

    /// The observer bus this coordinator publishes to
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Run the coordinator until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(capability = ?self.capability, "Lock coordinator started");
        // Only handles keep the request channel open from here on
        self.tx = None;

        loop {
            tokio::select! {
                biased;

                Some(event) = self.hub_rx.recv() => self.handle_hub_event(event),

                Some(settled) = self.settled_rx.recv() => self.handle_start_settled(settled),

                request = self.rx.recv() => match request {
                    Some(CoordRequest::Shutdown { reply_tx }) => {
                        self.shutdown(Some(reply_tx)).await;
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("LockCoordinator::run: all handles dropped");
                        self.shutdown(None).await;
                        break;
                    }
                },
            }
        }

        info!("Lock coordinator stopped");
    }

    fn handle_request(&mut self, request: CoordRequest) {
        match request {
            CoordRequest::Connect => self.connect(),
            CoordRequest::Disconnect => self.teardown(),
            CoordRequest::Lock { protocol_id } => self.lock(protocol_id),
            CoordRequest::Unlock { protocol_id } => self.unlock(protocol_id),
            CoordRequest::GetView { reply_tx } => {
                let _ = reply_tx.send(self.view());
            }
            // Handled in run()
            CoordRequest::Shutdown { .. } => {}
        }
    }

    fn active_id(&self) -> Option<ConnectionId> {
        self.active.as_ref().map(|active| active.id)
    }

    fn connect(&mut self) {
        if self.active.is_some() {
            debug!("LockCoordinator::connect: superseding current connection");
            self.teardown();
        }

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let connection = self.factory.create(id, EventSink::new(id, self.hub_tx.clone()));
        info!(connection = %id, "Connecting to lock hub");

        let starter = connection.clone();
        let settled_tx = self.settled_tx.clone();
        let start_task = tokio::spawn(async move {
            let result = starter.start().await;
            let _ = settled_tx.send(StartSettled { connection: id, result });
        });

        self.active = Some(ActiveConnection {
            id,
            connection,
            start_task,
        });
        self.set_state(ConnectionState::Connecting);
    }

    /// Detach the active connection and stop it once its start has settled
    fn teardown(&mut self) {
        let Some(ActiveConnection {
            id,
            connection,
            start_task,
        }) = self.active.take()
        else {
            debug!("LockCoordinator::teardown: nothing to tear down");
            return;
        };

        info!(connection = %id, "Tearing down lock hub connection");
        let task = tokio::spawn(async move {
            if let Err(e) = start_task.await {
                warn!(connection = %id, error = %e, "Start task failed to join");
            }
            match connection.stop().await {
                Ok(()) => debug!(connection = %id, "teardown: stopped"),
                Err(e) => warn!(connection = %id, error = %e, "Failed to stop hub connection"),
            }
        });
        self.teardowns.retain(|task| !task.is_finished());
        self.teardowns.push(task);

        let had_locks = !self.snapshot.is_empty();
        self.snapshot.clear();
        self.set_state(ConnectionState::Disconnected);
        if had_locks {
            self.bus.emit(LockEvent::LocksChanged { count: 0 });
        }
    }

    async fn shutdown(&mut self, reply_tx: Option<oneshot::Sender<()>>) {
        self.teardown();

        let pending: Vec<_> = self.teardowns.drain(..).collect();
        if !pending.is_empty() {
            let grace = self.config.shutdown_grace();
            debug!(count = pending.len(), ?grace, "LockCoordinator::shutdown: waiting for teardowns");
            if tokio::time::timeout(grace, futures::future::join_all(pending)).await.is_err() {
                warn!(?grace, "Hub connections still stopping at shutdown");
            }
        }

        if let Some(reply_tx) = reply_tx {
            let _ = reply_tx.send(());
        }
    }

    fn handle_start_settled(&mut self, settled: StartSettled) {
        let StartSettled { connection, result } = settled;
        if self.active_id() != Some(connection) {
            debug!(%connection, ok = result.is_ok(), "Ignoring start result from superseded connection");
            return;
        }

        match result {
            // A lifecycle event from this connection may already have moved us on
            Ok(()) if self.state != ConnectionState::Connecting => {
                debug!(%connection, state = %self.state, "Start settled after a lifecycle event, keeping state");
            }
            Ok(()) => {
                info!(%connection, "Connected to lock hub");
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                warn!(%connection, error = %e, "Failed to connect to lock hub");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn handle_hub_event(&mut self, event: HubEvent) {
        let HubEvent { connection, event } = event;
        if self.active_id() != Some(connection) {
            debug!(%connection, kind = event.kind(), "Ignoring event from superseded connection");
            return;
        }

        match event {
            TransportEvent::Invocation { target, arguments } => match InboundEvent::from_invocation(&target, &arguments) {
                Ok(Some(inbound)) => self.apply_inbound(inbound),
                Ok(None) => debug!(%target, "Ignoring unknown hub method"),
                Err(e) => warn!(%target, error = %e, "Ignoring malformed hub message"),
            },
            TransportEvent::Reconnecting { error } => {
                warn!(%connection, ?error, "Lock hub connection lost, reconnecting");
                self.set_state(ConnectionState::Reconnecting);
            }
            TransportEvent::Reconnected => {
                info!(%connection, "Reconnected to lock hub");
                self.set_state(ConnectionState::Connected);
            }
            TransportEvent::Closed { error } => {
                info!(%connection, ?error, "Lock hub connection closed");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn apply_inbound(&mut self, event: InboundEvent) {
        debug!(target = event.target(), "LockCoordinator::apply_inbound");
        match &event {
            InboundEvent::LockDenied { protocol_id, holder } => {
                warn!(%protocol_id, %holder, "Lock denied, protocol is held by another device");
                self.bus.emit(LockEvent::LockDenied {
                    protocol_id: protocol_id.clone(),
                    holder: holder.clone(),
                });
            }
            InboundEvent::ProtocolListUpdated => {
                self.bus.emit(LockEvent::ListChanged);
            }
            _ => {
                if self.snapshot.apply(&event) {
                    self.publish();
                    self.bus.emit(LockEvent::LocksChanged {
                        count: self.snapshot.len(),
                    });
                }
            }
        }
    }

    fn lock(&mut self, protocol_id: String) {
        if !self.capability.can_lock() {
            warn!(%protocol_id, "Read-only coordinator cannot lock");
            return;
        }
        let device_name = match self.identity.name() {
            Ok(name) => name,
            Err(e) => {
                warn!(%protocol_id, error = %e, "No device identity, lock not sent");
                return;
            }
        };
        self.invoke(OutboundRequest::LockProtocol {
            protocol_id,
            device_name,
        });
    }

    fn unlock(&mut self, protocol_id: String) {
        if !self.capability.can_lock() {
            warn!(%protocol_id, "Read-only coordinator cannot unlock");
            return;
        }
        self.invoke(OutboundRequest::UnlockProtocol { protocol_id });
    }

    /// Send a request to the hub without waiting for it
    fn invoke(&self, request: OutboundRequest) {
        let target = request.target();
        let active = match &self.active {
            Some(active) if self.state == ConnectionState::Connected => active,
            _ => {
                warn!(
                    protocol_id = request.protocol_id(),
                    %target,
                    state = %self.state,
                    "Not connected to lock hub, request skipped"
                );
                return;
            }
        };

        let connection = active.connection.clone();
        let id = active.id;
        tokio::spawn(async move {
            match connection.invoke(target, request.arguments()).await {
                Ok(_) => debug!(connection = %id, %target, "invoke: completed"),
                Err(e) => warn!(
                    connection = %id,
                    %target,
                    protocol_id = request.protocol_id(),
                    error = %e,
                    "Lock hub request failed"
                ),
            }
        });
    }

    fn view(&self) -> LockView {
        LockView {
            state: self.state,
            locks: self.snapshot.clone(),
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            self.publish();
            return;
        }
        debug!(from = %self.state, to = %state, "LockCoordinator::set_state");
        self.state = state;
        self.publish();
        self.bus.emit(LockEvent::StateChanged { state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::mock::{MockCall, MockHub};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn spawn(capability: Capability) -> (LockHandle, MockHub) {
        let hub = MockHub::new();
        let coordinator = LockCoordinator::new(
            CoordinatorConfig::default(),
            capability,
            Arc::new(DeviceIdentity::in_memory()),
            Arc::new(hub.clone()),
        );
        let handle = coordinator.handle();
        tokio::spawn(coordinator.run());
        (handle, hub)
    }

    async fn wait_connected(handle: &LockHandle) {
        let mut rx = handle.watch();
        tokio::time::timeout(WAIT, rx.wait_for(|view| view.is_connected()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (handle, hub) = spawn(Capability::ReadOnly);
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        handle.connect().await.unwrap();
        wait_connected(&handle).await;

        assert_eq!(hub.connections(), vec![ConnectionId(1)]);
        assert!(hub.is_running(ConnectionId(1)));
    }

    #[tokio::test]
    async fn test_failed_start_is_disconnected() {
        let (handle, hub) = spawn(Capability::ReadOnly);
        hub.fail_starts("refused");

        handle.connect().await.unwrap();
        // Connect has been handled once the view comes back
        handle.view().await.unwrap();
        let mut rx = handle.watch();
        tokio::time::timeout(WAIT, rx.wait_for(|view| view.state == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();

        assert!(hub.calls().contains(&MockCall::StartSettled {
            connection: ConnectionId(1),
            ok: false
        }));
    }

    #[tokio::test]
    async fn test_snapshot_follows_broadcasts() {
        let (handle, hub) = spawn(Capability::ReadOnly);
        handle.connect().await.unwrap();
        wait_connected(&handle).await;

        let conn = ConnectionId(1);
        hub.broadcast(conn, "ActiveLocks", vec![json!({})]);
        hub.broadcast(conn, "ProtocolLocked", vec![json!("42"), json!("Tablet 2")]);
        hub.broadcast(conn, "ProtocolLocked", vec![json!("7"), json!("Tablet 1")]);
        hub.broadcast(conn, "ProtocolUnlocked", vec![json!("42")]);

        let view = handle.view().await.unwrap();
        assert_eq!(view.locks.len(), 1);
        assert_eq!(view.locks.holder("7"), Some("Tablet 1"));
        assert_eq!(handle.locks(), view.locks);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_ignored() {
        let (handle, hub) = spawn(Capability::ReadOnly);
        handle.connect().await.unwrap();
        wait_connected(&handle).await;

        let conn = ConnectionId(1);
        hub.broadcast(conn, "ProtocolLocked", vec![json!("42")]);
        hub.broadcast(conn, "SomethingElse", vec![json!(1)]);

        let view = handle.view().await.unwrap();
        assert!(view.locks.is_empty());
        assert!(view.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_stops_connection() {
        let (handle, hub) = spawn(Capability::ReadOnly);
        handle.connect().await.unwrap();
        wait_connected(&handle).await;

        handle.shutdown().await.unwrap();
        assert!(hub.calls().contains(&MockCall::Stop(ConnectionId(1))));
        assert!(!hub.is_running(ConnectionId(1)));
        assert_eq!(handle.view().await, Err(crate::coordinator::CoordinatorError::ChannelClosed));
    }
}
