//! Domain records for HubLink.
//!
//! Pure data and state transitions with no I/O.  The gateway crate owns the
//! registries that hold these records; this module only defines what a valid
//! record looks like and which transitions it allows.

/// Durable record of a paired device.
pub mod client;

/// Entity change events from the hub and the per-connection filter.
pub mod entity;

/// Ephemeral one-time PIN sessions and their state machine.
pub mod pairing;
