//! Coordinator configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoordinatorConfig {
    /// Buffer size for handle requests
    pub channel_buffer: usize,

    /// Capacity of the observer event bus
    pub event_capacity: usize,

    /// How long shutdown waits for pending teardowns to finish stopping
    pub shutdown_grace_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 100,
            event_capacity: crate::events::DEFAULT_CHANNEL_CAPACITY,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
