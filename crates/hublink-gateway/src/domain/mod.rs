//! Domain layer for hublink-gateway.
//!
//! Holds the plain runtime settings every other layer is configured with.
//! They are built once at startup from the TOML file and CLI flags (see
//! `infrastructure::storage::config`) and then shared read-only, so nothing
//! in here reads files or environment variables.

pub mod config;

pub use config::{GatewaySettings, PairingSettings, ServerSettings, TlsSettings, TlsVersion};
