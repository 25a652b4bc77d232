//! Entity change events and subscription filters.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A state change produced by the hub for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChangeEvent {
    /// Hub entity id, e.g. `"light.kitchen"`.
    pub entity_id: String,
    /// The entity's new state object as reported by the hub.
    pub new_state: Value,
    pub timestamp: DateTime<Utc>,
}

impl EntityChangeEvent {
    pub fn new(entity_id: impl Into<String>, new_state: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            new_state,
            timestamp: Utc::now(),
        }
    }
}

/// Per-connection entity filter.
///
/// An absent or empty id list means "receive everything".  Filters live only
/// as long as the connection that declared them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    entity_ids: Option<BTreeSet<String>>,
}

impl EntityFilter {
    /// A filter that matches every entity.
    pub fn all() -> Self {
        Self::default()
    }

    /// Builds a filter from the optional id list of a `subscribe_entities`
    /// request.
    pub fn from_ids(ids: Option<Vec<String>>) -> Self {
        let entity_ids = ids
            .map(|ids| ids.into_iter().collect::<BTreeSet<_>>())
            .filter(|set| !set.is_empty());
        Self { entity_ids }
    }

    pub fn matches(&self, entity_id: &str) -> bool {
        match &self.entity_ids {
            None => true,
            Some(ids) => ids.contains(entity_id),
        }
    }

    pub fn is_all(&self) -> bool {
        self.entity_ids.is_none()
    }

    /// The ids this filter selects, sorted; empty when it matches everything.
    pub fn entity_ids(&self) -> Vec<String> {
        self.entity_ids
            .as_ref()
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
