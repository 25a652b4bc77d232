//! Runtime settings for the gateway.
//!
//! Each struct covers one component and is handed to that component at
//! construction.  Keeping them as plain values (no global state, no
//! environment reads) makes every component easy to build in tests with
//! short intervals and tiny timeouts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Listener addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Address of the main listener (TLS when enabled).
    pub bind_addr: SocketAddr,
    /// Optional plaintext listener, only used when TLS is enabled.
    pub fallback_addr: Option<SocketAddr>,
    /// Refuse upgrades on the fallback listener with a redirect to `wss://`.
    pub redirect_to_secure: bool,
}

impl Default for ServerSettings {
    /// | Field              | Default        |
    /// |--------------------|----------------|
    /// | bind_addr          | `0.0.0.0:8443` |
    /// | fallback_addr      | none           |
    /// | redirect_to_secure | `false`        |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            fallback_addr: None,
            redirect_to_secure: false,
        }
    }
}

/// Settings for the connection registry and message dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Interval between liveness probes.  A silent peer is removed after at
    /// most twice this long.
    pub probe_interval: Duration,
    /// Upper bound on a proxied `call_service` round trip.
    pub action_timeout: Duration,
    /// Capacity of each connection's outbound queue.  A connection whose
    /// queue is full when a broadcast arrives is closed as a slow consumer.
    pub outbound_queue: usize,
    /// Upper bound on a single WebSocket write.
    pub write_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            action_timeout: Duration::from_secs(10),
            outbound_queue: 256,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for the pairing authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSettings {
    /// TTL used when a caller does not ask for one.
    pub default_ttl: Duration,
    /// Requested TTLs are clamped to this.
    pub max_ttl: Duration,
    /// Failed attempts a single session tolerates before it is exhausted.
    pub max_attempts: u8,
    /// Interval of the expired-session sweep.
    pub sweep_interval: Duration,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(3600),
            max_attempts: 5,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Lowest TLS protocol version the listener accepts.  The highest is always
/// TLS 1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// Transport security settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub enabled: bool,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    /// Optional CA bundle appended to the served chain when present.
    pub ca_path: Option<PathBuf>,
    pub min_version: TlsVersion,
    /// Explicit opt-in to plaintext when production indicators are present.
    pub allow_insecure: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            key_path: PathBuf::from("/ssl/privkey.pem"),
            cert_path: PathBuf::from("/ssl/fullchain.pem"),
            ca_path: None,
            min_version: TlsVersion::Tls12,
            allow_insecure: false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
