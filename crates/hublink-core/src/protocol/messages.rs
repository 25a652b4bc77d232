//! Message types for the persistent client connection.
//!
//! Every frame is a JSON text frame carrying the envelope
//!
//! ```json
//! {"type": "<kind>", "payload": { ... }, "timestamp": 1700000000000}
//! ```
//!
//! The two directions use distinct closed enums so that a server-only
//! message can never be decoded as a client request and vice versa.
//!
//! | type (client→server)     | payload                                          | reply                               |
//! |--------------------------|--------------------------------------------------|-------------------------------------|
//! | `auth`                   | `{client_id, certificate}`                       | `auth_ok` \| `error` (then close)   |
//! | `ping`                   | `{}`                                             | `pong`                              |
//! | `subscribe_entities`     | `{entity_ids?}`                                  | `subscribed`                        |
//! | `call_service`           | `{domain, service, service_data?, target?}`      | `service_call_result` \| `error`    |
//! | `pair`                   | `{pin, device_name, device_type, public_key, session_id?}` | `paired` \| `error`       |
//! | `create_pairing_session` | `{ttl_secs?}`                                    | `pairing_session` \| `error`        |
//!
//! Server-initiated: `connected`, `entity_update`, `error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::client::ClientId;
use crate::domain::pairing::SessionId;
use crate::error::{ErrorKind, ServiceError};

/// Protocol version announced in the `connected` message.
pub const PROTOCOL_VERSION: u8 = 1;

// ── Client → Server messages ──────────────────────────────────────────────────

/// Credentials presented once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub client_id: ClientId,
    pub certificate: String,
}

/// Declares which entities the connection wants updates for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeEntitiesPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
}

/// A remote action to forward to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallServicePayload {
    pub domain: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

/// Device-side pairing request: consumes a one-time PIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairPayload {
    pub pin: String,
    pub device_name: String,
    pub device_type: String,
    pub public_key: String,
    /// When present, failed PINs are counted against this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Operator-side request for a new pairing PIN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePairingSessionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

/// All messages a client can send, each with its validated payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth(AuthPayload),
    Ping,
    SubscribeEntities(SubscribeEntitiesPayload),
    CallService(CallServicePayload),
    Pair(PairPayload),
    CreatePairingSession(CreatePairingSessionPayload),
}

impl ClientMessage {
    /// Wire name of the message kind.
    ///
    /// Used in log lines instead of `Debug` so credentials and PINs never end
    /// up in the logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Auth(_) => "auth",
            ClientMessage::Ping => "ping",
            ClientMessage::SubscribeEntities(_) => "subscribe_entities",
            ClientMessage::CallService(_) => "call_service",
            ClientMessage::Pair(_) => "pair",
            ClientMessage::CreatePairingSession(_) => "create_pairing_session",
        }
    }

    /// `true` for message kinds that are rejected before authentication.
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            ClientMessage::SubscribeEntities(_)
                | ClientMessage::CallService(_)
                | ClientMessage::CreatePairingSession(_)
        )
    }
}

// ── Server → Client messages ──────────────────────────────────────────────────

/// All messages the gateway sends to a client.
///
/// Serialized adjacently tagged, which yields the `{type, payload}` envelope;
/// the codec adds the `timestamp` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every accepted connection.
    Connected {
        connection_id: Uuid,
        protocol_version: u8,
    },
    AuthOk {
        client_id: ClientId,
    },
    Pong {},
    Subscribed {
        /// Empty when the connection receives every entity.
        entity_ids: Vec<String>,
    },
    ServiceCallResult {
        success: bool,
        result: Value,
    },
    EntityUpdate {
        entity_id: String,
        state: Value,
    },
    Paired {
        client_id: ClientId,
        certificate: String,
    },
    PairingSession {
        session_id: SessionId,
        pin: String,
        expires_at: DateTime<Utc>,
    },
    /// Non-fatal protocol error, or the last message before a forced close.
    Error {
        error: String,
        code: ErrorKind,
    },
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::AuthOk { .. } => "auth_ok",
            ServerMessage::Pong {} => "pong",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::ServiceCallResult { .. } => "service_call_result",
            ServerMessage::EntityUpdate { .. } => "entity_update",
            ServerMessage::Paired { .. } => "paired",
            ServerMessage::PairingSession { .. } => "pairing_session",
            ServerMessage::Error { .. } => "error",
        }
    }
}

impl From<&ServiceError> for ServerMessage {
    fn from(err: &ServiceError) -> Self {
        ServerMessage::Error {
            error: err.message.clone(),
            code: err.kind,
        }
    }
}

impl From<ServiceError> for ServerMessage {
    fn from(err: ServiceError) -> Self {
        ServerMessage::Error {
            error: err.message,
            code: err.kind,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protected_messages_require_auth() {
        let subscribe = ClientMessage::SubscribeEntities(SubscribeEntitiesPayload::default());
        let call = ClientMessage::CallService(CallServicePayload {
            domain: "light".to_string(),
            service: "turn_on".to_string(),
            service_data: None,
            target: None,
        });
        let create = ClientMessage::CreatePairingSession(CreatePairingSessionPayload::default());

        assert!(subscribe.requires_auth());
        assert!(call.requires_auth());
        assert!(create.requires_auth());
    }

    #[test]
    fn test_handshake_messages_do_not_require_auth() {
        let auth = ClientMessage::Auth(AuthPayload {
            client_id: Uuid::new_v4(),
            certificate: "c".to_string(),
        });
        let pair = ClientMessage::Pair(PairPayload {
            pin: "123456".to_string(),
            device_name: "phone".to_string(),
            device_type: "mobile".to_string(),
            public_key: "PK1".to_string(),
            session_id: None,
        });

        assert!(!auth.requires_auth());
        assert!(!ClientMessage::Ping.requires_auth());
        assert!(!pair.requires_auth());
    }

    #[test]
    fn test_type_name_does_not_expose_credentials() {
        let auth = ClientMessage::Auth(AuthPayload {
            client_id: Uuid::new_v4(),
            certificate: "secret-cert".to_string(),
        });
        let name = auth.type_name();
        assert_eq!(name, "auth");
        assert!(!name.contains("secret"));
    }

    #[test]
    fn test_pong_serializes_with_empty_payload() {
        let value = serde_json::to_value(ServerMessage::Pong {}).unwrap();
        assert_eq!(value, json!({"type": "pong", "payload": {}}));
    }

    #[test]
    fn test_entity_update_uses_snake_case_type() {
        let msg = ServerMessage::EntityUpdate {
            entity_id: "light.kitchen".to_string(),
            state: json!({"state": "on"}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "entity_update");
        assert_eq!(value["payload"]["entity_id"], "light.kitchen");
        assert_eq!(value["payload"]["state"]["state"], "on");
        assert_eq!(msg.type_name(), "entity_update");
    }

    #[test]
    fn test_error_message_carries_stable_code() {
        let err = ServiceError::authentication("authentication required");
        let value = serde_json::to_value(ServerMessage::from(&err)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "payload": {"error": "authentication required", "code": "AUTHENTICATION_ERROR"}
            })
        );
    }
}
