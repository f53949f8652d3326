//! Mock hub transport for testing
//!
//! [`MockHub`] is a [`HubConnectionFactory`] whose connections never touch
//! the network. It records every start, stop and invoke in order, can hold
//! starts open until released (to exercise teardown while a start is in
//! flight), can make starts or invocations fail, and lets a test push hub
//! events into any connection it created, including superseded ones.
//!
//! Connections follow the same rules as the real transport: `stop` while a
//! start is in flight fails with [`TransportError::StopDuringStart`], and
//! stopping a running connection emits [`TransportEvent::Closed`].
//!
//! # Example
//!
//! ```rust,ignore
//! let hub = MockHub::new();
//! hub.hold_starts();
//! // ... coordinator connects, start() blocks ...
//! hub.release_starts();
//! assert!(hub.wait_for(Duration::from_secs(1), |calls| calls.len() > 1).await);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::{ConnectionId, EventSink, HubConnection, HubConnectionFactory, TransportError, TransportEvent};

/// One recorded transport call
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Start(ConnectionId),
    StartSettled { connection: ConnectionId, ok: bool },
    Stop(ConnectionId),
    Invoke {
        connection: ConnectionId,
        target: String,
        arguments: Vec<Value>,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    created: Vec<ConnectionId>,
    sinks: HashMap<ConnectionId, EventSink>,
    starting: HashSet<ConnectionId>,
    running: HashSet<ConnectionId>,
    start_error: Option<String>,
    invoke_error: Option<String>,
}

/// In-process hub transport
#[derive(Clone)]
pub struct MockHub {
    state: Arc<Mutex<MockState>>,
    start_gate: Arc<watch::Sender<bool>>,
}

impl Default for MockHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHub {
    pub fn new() -> Self {
        let (start_gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            start_gate: Arc::new(start_gate),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every `start` wait until [`release_starts`](Self::release_starts)
    pub fn hold_starts(&self) {
        self.start_gate.send_replace(false);
    }

    pub fn release_starts(&self) {
        self.start_gate.send_replace(true);
    }

    /// Make subsequent starts fail with `message`
    pub fn fail_starts(&self, message: &str) {
        self.state().start_error = Some(message.to_string());
    }

    pub fn succeed_starts(&self) {
        self.state().start_error = None;
    }

    /// Make subsequent invocations fail with `message`
    pub fn fail_invocations(&self, message: &str) {
        self.state().invoke_error = Some(message.to_string());
    }

    /// Every call recorded so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Invocations recorded so far as `(connection, target, arguments)`
    pub fn invocations(&self) -> Vec<(ConnectionId, String, Vec<Value>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Invoke {
                    connection,
                    target,
                    arguments,
                } => Some((*connection, target.clone(), arguments.clone())),
                _ => None,
            })
            .collect()
    }

    /// Connections created so far, oldest first
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.state().created.clone()
    }

    /// Most recently created connection
    pub fn latest(&self) -> Option<ConnectionId> {
        self.state().created.last().copied()
    }

    pub fn is_running(&self, connection: ConnectionId) -> bool {
        self.state().running.contains(&connection)
    }

    /// Push an event as if `connection` raised it
    ///
    /// Returns false if no such connection was ever created.
    pub fn emit(&self, connection: ConnectionId, event: TransportEvent) -> bool {
        let sink = self.state().sinks.get(&connection).cloned();
        match sink {
            Some(sink) => {
                sink.emit(event);
                true
            }
            None => false,
        }
    }

    /// Push a hub invocation (`ActiveLocks`, `ProtocolLocked`, ...) into `connection`
    pub fn broadcast(&self, connection: ConnectionId, target: &str, arguments: Vec<Value>) -> bool {
        self.emit(
            connection,
            TransportEvent::Invocation {
                target: target.to_string(),
                arguments,
            },
        )
    }

    /// Poll the recorded calls until `predicate` holds or `timeout` passes
    pub async fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[MockCall]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.state().calls) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, call: MockCall) {
        debug!(?call, "MockHub::record");
        self.state().calls.push(call);
    }
}

impl HubConnectionFactory for MockHub {
    fn create(&self, id: ConnectionId, sink: EventSink) -> Arc<dyn HubConnection> {
        {
            let mut state = self.state();
            state.created.push(id);
            state.sinks.insert(id, sink.clone());
        }
        Arc::new(MockConnection {
            id,
            hub: self.clone(),
            sink,
        })
    }
}

struct MockConnection {
    id: ConnectionId,
    hub: MockHub,
    sink: EventSink,
}

#[async_trait]
impl HubConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.hub.record(MockCall::Start(self.id));
        self.hub.state().starting.insert(self.id);

        let mut gate = self.hub.start_gate.subscribe();
        let opened = gate.wait_for(|open| *open).await.is_ok();

        let result = {
            let mut state = self.hub.state();
            state.starting.remove(&self.id);
            match (state.start_error.clone(), opened) {
                (Some(message), _) => Err(TransportError::Connect {
                    url: "mock://hub".to_string(),
                    message,
                }),
                (None, false) => Err(TransportError::Closed(Some("mock hub dropped".to_string()))),
                (None, true) => {
                    state.running.insert(self.id);
                    Ok(())
                }
            }
        };

        self.hub.record(MockCall::StartSettled {
            connection: self.id,
            ok: result.is_ok(),
        });
        result
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.hub.record(MockCall::Stop(self.id));
        let was_running = {
            let mut state = self.hub.state();
            if state.starting.contains(&self.id) {
                return Err(TransportError::StopDuringStart);
            }
            state.running.remove(&self.id)
        };
        if was_running {
            self.sink.emit(TransportEvent::Closed { error: None });
        }
        Ok(())
    }

    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, TransportError> {
        self.hub.record(MockCall::Invoke {
            connection: self.id,
            target: target.to_string(),
            arguments,
        });
        let state = self.hub.state();
        if !state.running.contains(&self.id) {
            return Err(TransportError::NotConnected);
        }
        match &state.invoke_error {
            Some(message) => Err(TransportError::Invocation(message.clone())),
            None => Ok(Value::Null),
        }
    }
}
