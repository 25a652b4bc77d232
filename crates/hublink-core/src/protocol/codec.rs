//! JSON codec for the connection envelope.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! {"type": "<kind>", "payload": {...}, "timestamp": <unix ms>}
//! ```
//!
//! Decoding is two-staged: the envelope is parsed first, then the payload is
//! decoded into the schema that belongs to `type` and validated.  An unknown
//! `type` is a typed [`ProtocolError::UnknownType`], never a silent no-op.
//! A client-supplied `timestamp` is accepted and ignored; outbound messages
//! always carry the server's own.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{ErrorKind, ServiceError};
use crate::protocol::messages::{
    AuthPayload, CallServicePayload, ClientMessage, CreatePairingSessionPayload, PairPayload,
    ServerMessage, SubscribeEntitiesPayload,
};

/// Errors that can occur while decoding or encoding a message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    /// The frame is not a JSON object with a string `type` field.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `type` field names a message kind this server does not know.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The payload does not match the schema of its message kind.
    #[error("invalid {message_type} payload: {reason}")]
    InvalidPayload {
        message_type: &'static str,
        reason: String,
    },

    /// An outbound message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Encode(_) => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }

    /// The message kind the failing frame declared, when it got that far.
    pub fn message_type(&self) -> Option<&str> {
        match self {
            ProtocolError::InvalidPayload { message_type, .. } => Some(*message_type),
            ProtocolError::UnknownType(kind) => Some(kind.as_str()),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ServiceError {
    fn from(err: ProtocolError) -> Self {
        ServiceError::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one client frame into a validated [`ClientMessage`].
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] when the text is not an envelope,
/// [`ProtocolError::UnknownType`] for unknown kinds, and
/// [`ProtocolError::InvalidPayload`] when the payload fails its schema.
///
/// # Examples
///
/// ```rust
/// use hublink_core::protocol::{decode_client_message, ClientMessage};
///
/// let msg = decode_client_message(r#"{"type":"ping","payload":{}}"#).unwrap();
/// assert_eq!(msg, ClientMessage::Ping);
/// ```
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    match envelope.kind.as_str() {
        "auth" => {
            let payload: AuthPayload = decode_payload("auth", envelope.payload)?;
            if payload.certificate.trim().is_empty() {
                return Err(invalid("auth", "certificate must not be empty"));
            }
            Ok(ClientMessage::Auth(payload))
        }
        "ping" => Ok(ClientMessage::Ping),
        "subscribe_entities" => {
            let payload: SubscribeEntitiesPayload =
                decode_payload("subscribe_entities", envelope.payload)?;
            if let Some(ids) = &payload.entity_ids {
                if ids.iter().any(|id| id.trim().is_empty()) {
                    return Err(invalid("subscribe_entities", "entity ids must not be empty"));
                }
            }
            Ok(ClientMessage::SubscribeEntities(payload))
        }
        "call_service" => {
            let payload: CallServicePayload = decode_payload("call_service", envelope.payload)?;
            if payload.domain.trim().is_empty() || payload.service.trim().is_empty() {
                return Err(invalid("call_service", "domain and service are required"));
            }
            Ok(ClientMessage::CallService(payload))
        }
        "pair" => {
            let payload: PairPayload = decode_payload("pair", envelope.payload)?;
            if payload.pin.trim().is_empty() {
                return Err(invalid("pair", "pin must not be empty"));
            }
            Ok(ClientMessage::Pair(payload))
        }
        "create_pairing_session" => {
            let payload: CreatePairingSessionPayload =
                decode_payload("create_pairing_session", envelope.payload)?;
            if payload.ttl_secs == Some(0) {
                return Err(invalid("create_pairing_session", "ttl_secs must be positive"));
            }
            Ok(ClientMessage::CreatePairingSession(payload))
        }
        other => {
            tracing::debug!("rejecting unknown message type {other:?}");
            Err(ProtocolError::UnknownType(other.to_string()))
        }
    }
}

/// Encodes a server message with the given timestamp.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode_server_message(
    msg: &ServerMessage,
    timestamp: DateTime<Utc>,
) -> Result<String, ProtocolError> {
    let mut value =
        serde_json::to_value(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "timestamp".to_string(),
            Value::from(timestamp.timestamp_millis()),
        );
    }
    serde_json::to_string(&value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Encodes a server message stamped with the current time.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode_server_message_now(msg: &ServerMessage) -> Result<String, ProtocolError> {
    encode_server_message(msg, Utc::now())
}

/// Encodes a client message into its envelope.  Used by device-side code
/// and tests.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    let payload = match msg {
        ClientMessage::Auth(p) => to_payload(p)?,
        ClientMessage::Ping => Value::Object(Map::new()),
        ClientMessage::SubscribeEntities(p) => to_payload(p)?,
        ClientMessage::CallService(p) => to_payload(p)?,
        ClientMessage::Pair(p) => to_payload(p)?,
        ClientMessage::CreatePairingSession(p) => to_payload(p)?,
    };
    let envelope = serde_json::json!({
        "type": msg.type_name(),
        "payload": payload,
        "timestamp": Utc::now().timestamp_millis(),
    });
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn decode_payload<T: DeserializeOwned>(
    message_type: &'static str,
    payload: Value,
) -> Result<T, ProtocolError> {
    // A missing payload is treated as `{}` so optional-only schemas decode.
    let payload = match payload {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| invalid(message_type, e.to_string()))
}

fn to_payload<T: Serialize>(payload: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(payload).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn invalid(message_type: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        message_type,
        reason: reason.into(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
