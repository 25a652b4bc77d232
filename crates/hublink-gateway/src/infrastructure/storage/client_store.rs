//! JSON file implementation of [`ClientStore`].
//!
//! The whole client map is written on every save: first to a sibling
//! `*.tmp` file, then renamed over the real file, so a crash mid-write leaves
//! the previous contents intact.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use hublink_core::{Client, ClientId};
use tracing::debug;

use crate::application::client_store::{ClientStore, StoreError};

/// Stores clients as a JSON object keyed by client id at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFileClientStore {
    path: PathBuf,
}

impl JsonFileClientStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "clients.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ClientStore for JsonFileClientStore {
    fn load(&self) -> Result<HashMap<ClientId, Client>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let clients: BTreeMap<String, Client> =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        // The record's own id is authoritative over the object key.
        Ok(clients.into_values().map(|c| (c.id, c)).collect())
    }

    fn save(&self, clients: &HashMap<ClientId, Client>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        }

        let ordered: BTreeMap<&ClientId, &Client> = clients.iter().collect();
        let json = serde_json::to_vec_pretty(&ordered)?;

        let tmp = self.temp_path();
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!("saved {} client(s) to {}", clients.len(), self.path.display());
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
