//! JSON hub protocol codec
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). A single WebSocket text frame may carry several messages. The
//! `type` field is numeric:
//!
//! | type | message    |
//! |------|------------|
//! | 1    | Invocation |
//! | 3    | Completion |
//! | 6    | Ping       |
//! | 7    | Close      |
//!
//! Other types (streaming, acks) are not used by the lock hub and decode as
//! [`HubMessage::Unsupported`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportError;

/// Terminator of every hub protocol message
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// First message a client sends after the socket opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: "json".to_string(),
            version: 1,
        }
    }
}

impl HandshakeRequest {
    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(format!("{}{}", serde_json::to_string(self)?, RECORD_SEPARATOR))
    }
}

/// Server reply to the handshake; `{}` on success
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn decode(frame: &str) -> Result<Self, TransportError> {
        serde_json::from_str(frame).map_err(|e| TransportError::Handshake(format!("invalid response: {e}")))
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(format!("{}{}", serde_json::to_string(self)?, RECORD_SEPARATOR))
    }
}

/// A decoded hub protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Call a method on the other side; `invocation_id` is set when a
    /// completion is expected
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },

    /// Result of an invocation
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// Keep-alive
    Ping,

    /// The server is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },

    /// A message type the lock hub does not use
    Unsupported(u8),
}

/// Wire shape shared by every message type
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    /// Encode as one record-separator-terminated frame
    pub fn encode(&self) -> Result<String, TransportError> {
        let raw = match self {
            Self::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawMessage {
                kind: INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Default::default()
            },
            Self::Completion {
                invocation_id,
                result,
                error,
            } => RawMessage {
                kind: COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..Default::default()
            },
            Self::Ping => RawMessage {
                kind: PING,
                ..Default::default()
            },
            Self::Close { error, allow_reconnect } => RawMessage {
                kind: CLOSE,
                error: error.clone(),
                allow_reconnect: allow_reconnect.then_some(true),
                ..Default::default()
            },
            Self::Unsupported(kind) => {
                return Err(TransportError::Protocol(format!("cannot encode message type {kind}")));
            }
        };
        Ok(format!("{}{}", serde_json::to_string(&raw)?, RECORD_SEPARATOR))
    }

    /// Decode one frame (without its record separator)
    pub fn decode(frame: &str) -> Result<Self, TransportError> {
        let raw: RawMessage = serde_json::from_str(frame)?;
        let message = match raw.kind {
            INVOCATION => Self::Invocation {
                invocation_id: raw.invocation_id,
                target: raw
                    .target
                    .ok_or_else(|| TransportError::Protocol("invocation without target".to_string()))?,
                arguments: raw.arguments.unwrap_or_default(),
            },
            COMPLETION => Self::Completion {
                invocation_id: raw
                    .invocation_id
                    .ok_or_else(|| TransportError::Protocol("completion without invocationId".to_string()))?,
                result: raw.result,
                error: raw.error,
            },
            PING => Self::Ping,
            CLOSE => Self::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            },
            other => Self::Unsupported(other),
        };
        Ok(message)
    }

    /// Decode every message in a text frame
    pub fn decode_all(text: &str) -> Result<Vec<Self>, TransportError> {
        split_frames(text)?.into_iter().map(Self::decode).collect()
    }
}

/// Split a text payload into its record-separator-terminated frames
///
/// Fails if the payload ends in the middle of a frame.
pub fn split_frames(text: &str) -> Result<Vec<&str>, TransportError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let Some(body) = text.strip_suffix(RECORD_SEPARATOR) else {
        return Err(TransportError::Protocol("incomplete message: missing record separator".to_string()));
    };
    Ok(body.split(RECORD_SEPARATOR).filter(|frame| !frame.is_empty()).collect())
}
