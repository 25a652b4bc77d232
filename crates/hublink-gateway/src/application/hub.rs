//! The seam between the gateway and the external hub.
//!
//! The gateway needs exactly two things from a hub: a stream of entity state
//! changes, and a way to invoke a service (turn a light on, lock a door).
//! [`HubAdapter`] captures both so the gateway can run against the real Home
//! Assistant WebSocket API, the in-process `LocalHub`, or a mockall mock in
//! unit tests.

use std::time::Duration;

use async_trait::async_trait;
use hublink_core::protocol::CallServicePayload;
use hublink_core::{EntityChangeEvent, ErrorKind};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// A service invocation forwarded to the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    /// Always an object; `{}` when the client sent nothing.
    pub service_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

impl ServiceCall {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data: Value::Object(Default::default()),
            target: None,
        }
    }

    /// Entity ids named by `target.entity_id` or `service_data.entity_id`,
    /// each of which may be a single string or an array of strings.
    pub fn entity_ids(&self) -> Vec<String> {
        let from_target = self.target.as_ref().and_then(|t| t.get("entity_id"));
        let from_data = self.service_data.get("entity_id");
        match from_target.or(from_data) {
            Some(Value::String(id)) => vec![id.clone()],
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<CallServicePayload> for ServiceCall {
    fn from(payload: CallServicePayload) -> Self {
        Self {
            domain: payload.domain,
            service: payload.service,
            service_data: payload
                .service_data
                .unwrap_or_else(|| Value::Object(Default::default())),
            target: payload.target,
        }
    }
}

/// Errors reported by a hub adapter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HubError {
    #[error("hub is unavailable: {0}")]
    Unavailable(String),

    #[error("hub rejected {domain}.{service}: {reason}")]
    Rejected {
        domain: String,
        service: String,
        reason: String,
    },

    #[error("hub did not answer within {0:?}")]
    Timeout(Duration),

    #[error("hub authentication failed: {0}")]
    AuthFailed(String),
}

impl HubError {
    /// Every hub failure reaches the client as `SERVICE_UNAVAILABLE`.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ServiceUnavailable
    }
}

/// A live subscription to the hub's entity change stream.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<EntityChangeEvent>,
}

impl EventSubscription {
    pub fn new(rx: broadcast::Receiver<EntityChangeEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next event.  Returns `None` once the hub side is gone.
    ///
    /// If this subscriber falls behind the hub's buffer, the skipped events
    /// are logged and the stream resumes at the oldest retained event.
    pub async fn recv(&mut self) -> Option<EntityChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("hub event subscriber lagged; {skipped} events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Adapter onto a home-automation hub.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubAdapter: Send + Sync {
    /// Subscribes to entity state changes.
    fn subscribe(&self) -> EventSubscription;

    /// Invokes a hub service and returns the hub's result payload.
    ///
    /// Implementations need not enforce a deadline; the gateway wraps every
    /// call in its own action timeout.
    async fn invoke(&self, call: ServiceCall) -> Result<Value, HubError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
