//! Application layer for hublink-gateway.
//!
//! The use cases live here: turning a PIN into a client identity, deciding
//! which connection is authenticated, and routing every inbound message.
//! Nothing in this layer opens a socket or touches the file system; the hub
//! and the client store are reached through traits so tests can substitute
//! in-memory versions.
//!
//! # Sub-modules
//!
//! - **`pairing_authority`** – Pairing sessions, certificate minting, and the
//!   durable client registry.
//! - **`connection_registry`** – Live connections keyed by connection id and
//!   client id, liveness probing, and broadcast fan-out.
//! - **`gateway`** – The per-connection state machine and message dispatch.
//! - **`hub`** – The `HubAdapter` seam onto the external hub.
//! - **`client_store`** – The persistence port behind the client registry.

pub mod client_store;
pub mod connection_registry;
pub mod gateway;
pub mod hub;
pub mod pairing_authority;

pub use client_store::{ClientStore, MemoryClientStore, StoreError};
pub use connection_registry::{ConnectionHandle, ConnectionRegistry, Outbound};
pub use gateway::{ConnectionSession, ConnectionState, Flow, Gateway};
pub use hub::{EventSubscription, HubAdapter, HubError, ServiceCall};
pub use pairing_authority::{CompletePairing, IssuedSession, PairingAuthority, PairingError};
