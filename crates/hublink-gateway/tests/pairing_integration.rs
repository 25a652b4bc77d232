//! Integration tests for the pairing authority backed by the JSON client
//! store.
//!
//! # Purpose
//!
//! These tests drive `PairingAuthority` through its public API with the real
//! file store, the way `main.rs` wires it.  They verify:
//!
//! - A paired client survives a restart: a new authority loading the same
//!   file still accepts the issued certificate.
//! - Activity updates are persisted.
//! - The bootstrap session is only offered to an empty install.
//!
//! # Pairing flow
//!
//! ```text
//! create_session(ttl) → {session_id, pin}
//! complete_session({pin, device_name, device_type, public_key})
//!   → Client {id, certificate}
//! verify_client_certificate(id, certificate) → true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use hublink_gateway::application::{CompletePairing, PairingAuthority, PairingError};
use hublink_gateway::application::ClientStore;
use hublink_gateway::domain::PairingSettings;
use hublink_gateway::infrastructure::storage::JsonFileClientStore;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn temp_store_path() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("hublink_pairing_{}", Uuid::new_v4()));
    let path = dir.join("clients.json");
    (dir, path)
}

fn authority_at(path: &PathBuf) -> PairingAuthority {
    PairingAuthority::new(
        PairingSettings::default(),
        Box::new(JsonFileClientStore::new(path.clone())),
    )
    .expect("load store")
}

fn pairing(pin: &str, name: &str) -> CompletePairing {
    CompletePairing {
        pin: pin.to_string(),
        device_name: name.to_string(),
        device_type: "tablet".to_string(),
        public_key: format!("PK-{name}"),
        session_id: None,
    }
}

#[tokio::test]
async fn test_paired_client_survives_restart() {
    // Arrange
    let (dir, path) = temp_store_path();
    let first = authority_at(&path);
    let issued = assert_ok!(first.create_session(Duration::from_secs(300)).await);
    let client = assert_ok!(first.complete_session(pairing(&issued.pin, "Kitchen")).await);
    drop(first);

    // Act: a fresh authority reads the same file.
    let second = authority_at(&path);

    // Assert
    assert!(second.verify_client_certificate(client.id, &client.certificate).await);
    assert_eq!(second.get_client(client.id).await.unwrap().name, "Kitchen");

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_inactive_flag_is_persisted() {
    let (dir, path) = temp_store_path();
    let authority = authority_at(&path);
    let issued = authority.create_session(Duration::from_secs(300)).await.unwrap();
    let client = authority.complete_session(pairing(&issued.pin, "Hall")).await.unwrap();

    authority.mark_client_inactive(client.id).await;

    let stored = JsonFileClientStore::new(path.clone()).load().unwrap();
    assert!(!stored[&client.id].is_active);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_two_devices_pair_independently() {
    let (dir, path) = temp_store_path();
    let authority = authority_at(&path);
    let a = authority.create_session(Duration::from_secs(300)).await.unwrap();
    let b = authority.create_session(Duration::from_secs(300)).await.unwrap();

    let client_a = authority.complete_session(pairing(&a.pin, "A")).await.unwrap();
    let client_b = authority.complete_session(pairing(&b.pin, "B")).await.unwrap();

    assert_ne!(client_a.id, client_b.id);
    assert_ne!(client_a.certificate, client_b.certificate);
    assert!(!authority.verify_client_certificate(client_a.id, &client_b.certificate).await);
    let names: Vec<String> = authority.list_clients().await.into_iter().map(|c| c.name).collect();
    assert_eq!(names.len(), 2);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_consumed_pin_cannot_pair_second_device() {
    let (dir, path) = temp_store_path();
    let authority = authority_at(&path);
    let issued = authority.create_session(Duration::from_secs(300)).await.unwrap();
    authority.complete_session(pairing(&issued.pin, "First")).await.unwrap();

    let result = authority.complete_session(pairing(&issued.pin, "Second")).await;

    let err = assert_err!(result);
    assert_eq!(err, PairingError::AlreadyConsumed);
    assert_eq!(authority.client_count().await, 1);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_bootstrap_session_offered_only_to_empty_install() {
    let (dir, path) = temp_store_path();
    let authority = authority_at(&path);

    let bootstrap = authority.ensure_bootstrap_session().await.unwrap().expect("bootstrap");
    authority.complete_session(pairing(&bootstrap.pin, "First")).await.unwrap();
    drop(authority);

    let restarted = authority_at(&path);
    assert!(restarted.ensure_bootstrap_session().await.unwrap().is_none());
    std::fs::remove_dir_all(&dir).ok();
}
