//! The durable [`Client`] record.
//!
//! A client is created exactly once, when a pairing session completes, and
//! is then only touched by activity updates.  The certificate and id never
//! change for the lifetime of the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Stable identifier of a paired client.
pub type ClientId = Uuid;

/// A paired device as stored by the pairing authority.
///
/// The serialized field names are the persisted layout of the client store,
/// so renaming a field is a storage format change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    /// Human-readable device name supplied at pairing time.
    pub name: String,
    /// Free-form device category, e.g. `"mobile"` or `"tablet"`.
    pub device_type: String,
    /// Public key material supplied by the device at pairing time.
    pub public_key: String,
    /// Certificate issued at pairing time.  Immutable once issued.
    pub certificate: String,
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Client {
    /// Records activity: `last_seen = now` and `is_active = true`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.is_active = true;
    }

    /// Marks the client as no longer connected.  `last_seen` is kept.
    pub fn mark_inactive(&mut self) {
        self.is_active = false;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
