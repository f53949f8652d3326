//! LockSnapshot - local mirror of the hub's lock table

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::messages::InboundEvent;

/// Who currently holds the edit lock on which protocol
///
/// Maps protocol id to the holding device's name. There is at most one holder
/// per protocol; conflicting broadcasts resolve as last writer wins. Ordered
/// by protocol id so listings are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockSnapshot {
    locks: BTreeMap<String, String>,
}

impl LockSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot by folding events, in order, into an empty one
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a InboundEvent>) -> Self {
        let mut snapshot = Self::new();
        for event in events {
            snapshot.apply(event);
        }
        snapshot
    }

    /// Fold one inbound event into the snapshot
    ///
    /// Returns true if the snapshot changed. Events that carry no lock state
    /// (`LockDenied`, `ProtocolListUpdated`) leave it untouched.
    pub fn apply(&mut self, event: &InboundEvent) -> bool {
        match event {
            InboundEvent::ActiveLocks(locks) => {
                if self.locks == *locks {
                    return false;
                }
                self.locks = locks.clone();
                true
            }
            InboundEvent::ProtocolLocked {
                protocol_id,
                device_name,
            } => self.locks.insert(protocol_id.clone(), device_name.clone()).as_ref() != Some(device_name),
            InboundEvent::ProtocolUnlocked { protocol_id } => self.locks.remove(protocol_id).is_some(),
            InboundEvent::LockDenied { .. } | InboundEvent::ProtocolListUpdated => false,
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.locks.clear();
    }

    /// Device currently holding the lock on `protocol_id`
    pub fn holder(&self, protocol_id: &str) -> Option<&str> {
        self.locks.get(protocol_id).map(String::as_str)
    }

    pub fn is_locked(&self, protocol_id: &str) -> bool {
        self.locks.contains_key(protocol_id)
    }

    /// True if someone other than `device_name` holds the lock
    pub fn is_locked_by_other(&self, protocol_id: &str, device_name: &str) -> bool {
        self.holder(protocol_id).is_some_and(|holder| holder != device_name)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Iterate `(protocol_id, device_name)` pairs in protocol id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.locks.iter().map(|(id, device)| (id.as_str(), device.as_str()))
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.locks
    }
}

impl From<BTreeMap<String, String>> for LockSnapshot {
    fn from(locks: BTreeMap<String, String>) -> Self {
        Self { locks }
    }
}

impl FromIterator<(String, String)> for LockSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            locks: iter.into_iter().collect(),
        }
    }
}
