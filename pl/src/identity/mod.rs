//! Device identity
//!
//! Every physical device (tablet, dashboard browser profile) is labelled
//! `"Tablet N"`, where `N` is the lowest positive integer not yet claimed in
//! the shared claimed-ids list. The label is claimed lazily on first use and
//! reused across sessions. Claims are only race-free within one process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

mod store;

pub use store::{FileStore, KeyValueStore, MemoryStore};

/// Store key holding this device's label
pub const DEVICE_NAME_KEY: &str = "protolock.device-name";

/// Store key holding the JSON array of claimed integer suffixes
pub const USED_IDS_KEY: &str = "protolock.used-device-ids";

/// Errors from the identity store
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lazily-claimed, persisted device label
///
/// Construct one per process and share it; the claimed label is cached after
/// the first lookup.
pub struct DeviceIdentity {
    store: Arc<dyn KeyValueStore>,
    cached: Mutex<Option<String>>,
}

impl DeviceIdentity {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// Identity backed by a throwaway in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// This device's label, claiming one on first use
    pub fn name(&self) -> Result<String, IdentityError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(name) = cached.as_ref() {
            return Ok(name.clone());
        }

        let name = match self.store.get(DEVICE_NAME_KEY)? {
            Some(name) => {
                debug!(%name, "DeviceIdentity::name: found persisted label");
                name
            }
            None => self.claim()?,
        };
        *cached = Some(name.clone());
        Ok(name)
    }

    /// The persisted label, without claiming one
    pub fn current(&self) -> Result<Option<String>, IdentityError> {
        self.store.get(DEVICE_NAME_KEY)
    }

    /// Integer suffixes claimed so far by any device sharing the store
    ///
    /// An unreadable list is treated as empty.
    pub fn used_ids(&self) -> Result<Vec<u32>, IdentityError> {
        let Some(raw) = self.store.get(USED_IDS_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(ids) => Ok(ids),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable claimed device id list");
                Ok(Vec::new())
            }
        }
    }

    /// Forget this device's label; the claimed suffix stays claimed
    ///
    /// Returns the label that was forgotten. The next [`name`](Self::name)
    /// claims a fresh suffix.
    pub fn reset(&self) -> Result<Option<String>, IdentityError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.store.get(DEVICE_NAME_KEY)?;
        self.store.remove(DEVICE_NAME_KEY)?;
        *cached = None;
        info!(?previous, "Device identity reset");
        Ok(previous)
    }

    fn claim(&self) -> Result<String, IdentityError> {
        let mut used = self.used_ids()?;
        let suffix = lowest_unused(&used);
        used.push(suffix);

        self.store.set(USED_IDS_KEY, &serde_json::to_string(&used)?)?;
        let name = format!("Tablet {suffix}");
        self.store.set(DEVICE_NAME_KEY, &name)?;

        info!(%name, "Claimed device identity");
        Ok(name)
    }
}

/// Lowest positive integer not in `used`
pub fn lowest_unused(used: &[u32]) -> u32 {
    let mut candidate = 1;
    while used.contains(&candidate) {
        candidate += 1;
    }
    candidate
}
