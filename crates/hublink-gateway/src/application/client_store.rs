//! Persistence port for [`Client`] records.
//!
//! The pairing authority keeps the authoritative copy of every client in
//! memory and writes the whole map through a [`ClientStore`] after each
//! mutation.  The production implementation is a JSON file
//! (`infrastructure::storage::client_store`); tests use [`MemoryClientStore`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use hublink_core::{Client, ClientId};
use thiserror::Error;

/// Error type for client store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error accessing client store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("client store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize clients: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("client store lock poisoned")]
    Poisoned,

    #[error("client store writer failed: {0}")]
    Writer(String),
}

/// Loads and saves the full client map.
pub trait ClientStore: Send + Sync {
    /// Returns every stored client, or an empty map when nothing is stored.
    fn load(&self) -> Result<HashMap<ClientId, Client>, StoreError>;

    /// Replaces the stored clients with `clients`.
    fn save(&self, clients: &HashMap<ClientId, Client>) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryClientStore {
    clients: Mutex<HashMap<ClientId, Client>>,
}

impl MemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `clients`.
    pub fn with_clients(clients: impl IntoIterator<Item = Client>) -> Self {
        Self {
            clients: Mutex::new(clients.into_iter().map(|c| (c.id, c)).collect()),
        }
    }
}

impl ClientStore for MemoryClientStore {
    fn load(&self) -> Result<HashMap<ClientId, Client>, StoreError> {
        let clients = self.clients.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(clients.clone())
    }

    fn save(&self, clients: &HashMap<ClientId, Client>) -> Result<(), StoreError> {
        let mut stored = self.clients.lock().map_err(|_| StoreError::Poisoned)?;
        *stored = clients.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_memory_store_round_trips_clients() {
        let now = Utc::now();
        let client = Client {
            id: Uuid::new_v4(),
            name: "tablet".to_string(),
            device_type: "tablet".to_string(),
            public_key: "PK".to_string(),
            certificate: "cert".to_string(),
            paired_at: now,
            last_seen: now,
            is_active: true,
            metadata: Default::default(),
        };
        let store = MemoryClientStore::new();
        let mut map = HashMap::new();
        map.insert(client.id, client.clone());

        store.save(&map).unwrap();

        assert_eq!(store.load().unwrap().get(&client.id), Some(&client));
    }

    #[test]
    fn test_empty_memory_store_loads_empty_map() {
        assert!(MemoryClientStore::new().load().unwrap().is_empty());
    }
}
