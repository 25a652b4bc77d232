//! hublink-gateway library crate.
//!
//! This crate enrols devices through one-time PIN pairing and then serves
//! their persistent, authenticated WebSocket connections: hub entity changes
//! are pushed to them in real time and their remote action requests are
//! forwarded to the hub.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Device (JSON over WebSocket, optionally TLS)
//!         ↕
//! [hublink-gateway]
//!   ├── domain/             Runtime settings (no I/O)
//!   ├── application/
//!   │     ├── pairing_authority/   PIN sessions → Client + certificate
//!   │     ├── connection_registry/ Live connections, liveness, fan-out
//!   │     ├── gateway/             Per-connection state machine + dispatch
//!   │     ├── hub/                 HubAdapter seam (events in, actions out)
//!   │     └── client_store/        Persistence port for Client records
//!   └── infrastructure/
//!         ├── tls/          rustls acceptor or explicit plaintext
//!         ├── ws_server/    Accept loops, per-connection tasks, sweeps
//!         ├── hub/          LocalHub and HomeAssistantHub adapters
//!         └── storage/      TOML config file and JSON client store
//!         ↕
//! Hub (entity state stream + service calls)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no dependencies beyond `std` and `serde`.
//! - `application` depends on `domain` and `hublink-core`, and reaches the
//!   outside world only through the `HubAdapter` and `ClientStore` traits.
//! - `infrastructure` implements those traits and owns every socket and file.

/// Domain layer: runtime settings.
pub mod domain;

/// Application layer: pairing, registry, and message dispatch.
pub mod application;

/// Infrastructure layer: TLS, WebSocket server, hub adapters, storage.
pub mod infrastructure;
