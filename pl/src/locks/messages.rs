//! Hub method names and argument decoding for the protocol lock hub
//!
//! Inbound events arrive as hub invocations (`target` plus positional
//! `arguments`); outbound requests are invocations the client sends.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

pub const ACTIVE_LOCKS: &str = "ActiveLocks";
pub const PROTOCOL_LOCKED: &str = "ProtocolLocked";
pub const PROTOCOL_UNLOCKED: &str = "ProtocolUnlocked";
pub const LOCK_DENIED: &str = "LockDenied";
pub const PROTOCOL_LIST_UPDATED: &str = "ProtocolListUpdated";

pub const LOCK_PROTOCOL: &str = "LockProtocol";
pub const UNLOCK_PROTOCOL: &str = "UnlockProtocol";

/// Errors decoding hub invocation arguments
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("{target}: missing argument {index}")]
    MissingArgument { target: String, index: usize },

    #[error("{target}: argument {index} should be {expected}")]
    InvalidArgument {
        target: String,
        index: usize,
        expected: &'static str,
    },
}

/// Events broadcast by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Full lock table, sent on every fresh connection
    ActiveLocks(BTreeMap<String, String>),

    /// A device acquired the lock on a protocol
    ProtocolLocked { protocol_id: String, device_name: String },

    /// The lock on a protocol was released
    ProtocolUnlocked { protocol_id: String },

    /// Our lock request was refused because someone else holds it
    LockDenied { protocol_id: String, holder: String },

    /// The protocol list itself changed; callers should refetch it
    ProtocolListUpdated,
}

impl InboundEvent {
    /// Decode a hub invocation
    ///
    /// Returns `Ok(None)` for targets this client does not handle.
    pub fn from_invocation(target: &str, arguments: &[Value]) -> Result<Option<Self>, MessageError> {
        let event = match target {
            ACTIVE_LOCKS => Self::ActiveLocks(lock_map(target, arguments, 0)?),
            PROTOCOL_LOCKED => Self::ProtocolLocked {
                protocol_id: id_arg(target, arguments, 0)?,
                device_name: string_arg(target, arguments, 1)?,
            },
            PROTOCOL_UNLOCKED => Self::ProtocolUnlocked {
                protocol_id: id_arg(target, arguments, 0)?,
            },
            LOCK_DENIED => Self::LockDenied {
                protocol_id: id_arg(target, arguments, 0)?,
                holder: string_arg(target, arguments, 1)?,
            },
            PROTOCOL_LIST_UPDATED => Self::ProtocolListUpdated,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Hub method name of this event
    pub fn target(&self) -> &'static str {
        match self {
            Self::ActiveLocks(_) => ACTIVE_LOCKS,
            Self::ProtocolLocked { .. } => PROTOCOL_LOCKED,
            Self::ProtocolUnlocked { .. } => PROTOCOL_UNLOCKED,
            Self::LockDenied { .. } => LOCK_DENIED,
            Self::ProtocolListUpdated => PROTOCOL_LIST_UPDATED,
        }
    }
}

/// Requests sent to the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    LockProtocol { protocol_id: String, device_name: String },
    UnlockProtocol { protocol_id: String },
}

impl OutboundRequest {
    pub fn target(&self) -> &'static str {
        match self {
            Self::LockProtocol { .. } => LOCK_PROTOCOL,
            Self::UnlockProtocol { .. } => UNLOCK_PROTOCOL,
        }
    }

    pub fn arguments(&self) -> Vec<Value> {
        match self {
            Self::LockProtocol {
                protocol_id,
                device_name,
            } => vec![Value::from(protocol_id.as_str()), Value::from(device_name.as_str())],
            Self::UnlockProtocol { protocol_id } => vec![Value::from(protocol_id.as_str())],
        }
    }

    pub fn protocol_id(&self) -> &str {
        match self {
            Self::LockProtocol { protocol_id, .. } | Self::UnlockProtocol { protocol_id } => protocol_id,
        }
    }
}

fn arg<'a>(target: &str, arguments: &'a [Value], index: usize) -> Result<&'a Value, MessageError> {
    arguments.get(index).ok_or_else(|| MessageError::MissingArgument {
        target: target.to_string(),
        index,
    })
}

fn string_arg(target: &str, arguments: &[Value], index: usize) -> Result<String, MessageError> {
    arg(target, arguments, index)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidArgument {
            target: target.to_string(),
            index,
            expected: "a string",
        })
}

/// Protocol ids are strings on the wire, but numeric ids are accepted too
fn id_arg(target: &str, arguments: &[Value], index: usize) -> Result<String, MessageError> {
    match arg(target, arguments, index)? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(MessageError::InvalidArgument {
            target: target.to_string(),
            index,
            expected: "a protocol id",
        }),
    }
}

fn lock_map(target: &str, arguments: &[Value], index: usize) -> Result<BTreeMap<String, String>, MessageError> {
    let invalid = || MessageError::InvalidArgument {
        target: target.to_string(),
        index,
        expected: "an object of protocol id to device name",
    };

    match arg(target, arguments, index)? {
        Value::Object(entries) => entries
            .iter()
            .map(|(id, device)| device.as_str().map(|d| (id.clone(), d.to_string())).ok_or_else(invalid))
            .collect(),
        Value::Null => Ok(BTreeMap::new()),
        _ => Err(invalid()),
    }
}
