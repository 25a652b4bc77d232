//! Infrastructure layer for the gateway.
//!
//! Contains every adapter that touches the outside world: the TLS acceptor,
//! the WebSocket listeners, the hub connections, and file storage.
//!
//! **Dependency rule**: this layer may depend on `application`, `domain` and
//! `hublink_core`, but MUST NOT be imported by the `application` or `domain`
//! layers.

pub mod hub;
pub mod storage;
pub mod tls;
pub mod ws_server;
