//! In-process hub.
//!
//! Keeps entity states in memory and understands the generic
//! `turn_on` / `turn_off` / `toggle` services plus `set_state`.  Every state
//! change is published to subscribers, so a gateway running against it
//! behaves end to end like one connected to a real hub.  Used for local
//! development and in integration tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use hublink_core::EntityChangeEvent;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::application::hub::{EventSubscription, HubAdapter, HubError, ServiceCall};

/// In-memory [`HubAdapter`].
pub struct LocalHub {
    events: broadcast::Sender<EntityChangeEvent>,
    states: Mutex<HashMap<String, Value>>,
}

impl LocalHub {
    /// Creates a hub whose event stream buffers `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Publishes an event to current subscribers.  Returns how many received
    /// it.
    pub fn publish(&self, event: EntityChangeEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Sets an entity's state and publishes the change.
    pub async fn set_state(&self, entity_id: &str, state: Value) -> Value {
        let new_state = json!({
            "entity_id": entity_id,
            "state": state,
            "last_changed": Utc::now(),
        });
        self.states
            .lock()
            .await
            .insert(entity_id.to_string(), new_state.clone());
        self.publish(EntityChangeEvent::new(entity_id, new_state.clone()));
        new_state
    }

    pub async fn state(&self, entity_id: &str) -> Option<Value> {
        self.states.lock().await.get(entity_id).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    async fn current_state(&self, entity_id: &str) -> Option<String> {
        self.states
            .lock()
            .await
            .get(entity_id)
            .and_then(|s| s.get("state"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

#[async_trait]
impl HubAdapter for LocalHub {
    fn subscribe(&self) -> EventSubscription {
        EventSubscription::new(self.events.subscribe())
    }

    async fn invoke(&self, call: ServiceCall) -> Result<Value, HubError> {
        let entity_ids = call.entity_ids();
        if entity_ids.is_empty() {
            return Err(HubError::Rejected {
                domain: call.domain,
                service: call.service,
                reason: "no target entity_id".to_string(),
            });
        }

        let mut changed = Vec::with_capacity(entity_ids.len());
        for entity_id in &entity_ids {
            let next = match call.service.as_str() {
                "turn_on" => json!("on"),
                "turn_off" => json!("off"),
                "toggle" => match self.current_state(entity_id).await.as_deref() {
                    Some("on") => json!("off"),
                    _ => json!("on"),
                },
                "set_state" => call.service_data.get("state").cloned().ok_or_else(|| {
                    HubError::Rejected {
                        domain: call.domain.clone(),
                        service: call.service.clone(),
                        reason: "service_data.state is required".to_string(),
                    }
                })?,
                other => {
                    return Err(HubError::Rejected {
                        domain: call.domain.clone(),
                        service: other.to_string(),
                        reason: "unknown service".to_string(),
                    })
                }
            };
            changed.push(self.set_state(entity_id, next).await);
        }

        debug!(
            "local hub handled {}.{} for {} entit(ies)",
            call.domain,
            call.service,
            changed.len()
        );
        Ok(Value::Array(changed))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
