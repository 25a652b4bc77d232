//! # hublink-core
//!
//! Shared library for HubLink containing the WebSocket wire protocol, the
//! domain records exchanged between the pairing authority and the gateway,
//! and the flat error taxonomy every layer reports through.
//!
//! This crate has zero dependencies on sockets, async runtimes, or the file
//! system, so everything in it can be tested in isolation.
//!
//! # Architecture overview
//!
//! HubLink sits between a home-automation hub and a set of paired client
//! devices.  A device enrols once with a one-time PIN, receives a certificate,
//! and from then on keeps a persistent WebSocket open over which the hub's
//! entity changes are pushed and remote actions are requested.
//!
//! - **`domain`** – Records with business meaning: [`Client`],
//!   [`PairingSession`], [`EntityChangeEvent`] and the per-connection
//!   [`EntityFilter`].
//!
//! - **`protocol`** – The JSON envelope `{type, payload, timestamp?}` and the
//!   two closed tagged unions for each direction, plus the codec that turns
//!   text frames into validated messages before dispatch.
//!
//! - **`error`** – [`ErrorKind`] with its status code and stable wire code,
//!   and [`ServiceError`], the typed failure reported back to clients.

pub mod domain;
pub mod error;
pub mod protocol;

pub use domain::client::{Client, ClientId};
pub use domain::entity::{EntityChangeEvent, EntityFilter};
pub use domain::pairing::{PairingSession, SessionId, SessionState};
pub use error::{ErrorKind, ServiceError};
pub use protocol::codec::{decode_client_message, encode_server_message, ProtocolError};
pub use protocol::messages::{ClientMessage, ServerMessage};
