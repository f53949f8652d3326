//! Event bus - broadcast fan-out of coordinator events

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::LockEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus carrying [`LockEvent`]s to every subscriber
///
/// Emitting never blocks. Events emitted while nobody listens are dropped,
/// and a subscriber that falls more than the capacity behind loses the
/// oldest events.
pub struct EventBus {
    tx: broadcast::Sender<LockEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: LockEvent) {
        debug!(event_type = event.event_type(), "EventBus::emit");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create a shared event bus with default capacity
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

/// Run `on_change` for every [`LockEvent::ListChanged`] seen on `rx`
///
/// The task ends when the bus is dropped. After a lag `on_change` runs once,
/// since the skipped events may have held a list change.
pub fn spawn_list_changed_listener<F>(mut rx: broadcast::Receiver<LockEvent>, mut on_change: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(LockEvent::ListChanged) => on_change(),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "List-changed listener lagged");
                    on_change();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("spawn_list_changed_listener: bus closed");
                    break;
                }
            }
        }
    })
}
