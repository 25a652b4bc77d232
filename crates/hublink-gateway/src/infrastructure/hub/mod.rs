//! Hub adapters.
//!
//! - `local` – in-process hub for development and tests.
//! - `home_assistant` – Home Assistant WebSocket API client.

pub mod home_assistant;
pub mod local;

pub use home_assistant::{HomeAssistantConfig, HomeAssistantHub};
pub use local::LocalHub;
