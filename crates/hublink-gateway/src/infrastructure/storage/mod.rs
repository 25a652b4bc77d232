//! Storage infrastructure: configuration file and client persistence.
//!
//! - `config` reads and writes the TOML configuration and converts it into
//!   the runtime settings in `domain`.
//! - `client_store` persists paired clients as a JSON file behind the
//!   application's `ClientStore` port.

pub mod client_store;
pub mod config;

pub use client_store::JsonFileClientStore;
pub use config::{load_config, save_config, AppConfig, ConfigError, HubMode};
