//! TOML configuration file for the gateway.
//!
//! The file path comes from `--config` / `HUBLINK_CONFIG` (default
//! `hublink.toml` in the working directory).  A missing file is not an
//! error: every field has a default, so a bare install starts in local-hub
//! mode on port 8443 with TLS off.
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8443
//! environment = "production"
//!
//! [tls]
//! enabled = true
//! key_path = "/ssl/privkey.pem"
//! cert_path = "/ssl/fullchain.pem"
//!
//! [hub]
//! mode = "home_assistant"
//! url = "ws://supervisor/core/websocket"
//! ```
//!
//! Fields annotated with `#[serde(default = "some_fn")]` fall back to
//! `some_fn()` when absent, so older files keep working as fields are added.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{GatewaySettings, PairingSettings, ServerSettings, TlsSettings, TlsVersion};

/// Environment variable that flags a production deployment.
pub const ENVIRONMENT_VAR: &str = "HUBLINK_ENV";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Plaintext port served alongside TLS.  Ignored when TLS is off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_port: Option<u16>,
    #[serde(default)]
    pub redirect_to_secure: bool,
    /// `"production"` enables the plaintext guard.
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<PathBuf>,
    #[serde(default = "default_min_version")]
    pub min_version: TlsVersion,
    #[serde(default)]
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_max_session_ttl_secs")]
    pub max_session_ttl_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// JSON file holding paired clients.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// Which hub adapter to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HubMode {
    /// In-process hub; entity changes come only from service calls.
    Local,
    /// Home Assistant WebSocket API.
    HomeAssistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default = "default_hub_mode")]
    pub mode: HubMode,
    #[serde(default = "default_hub_url")]
    pub url: String,
    /// Environment variable holding the hub access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default value functions (required by serde) ───────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_key_path() -> PathBuf {
    PathBuf::from("/ssl/privkey.pem")
}
fn default_cert_path() -> PathBuf {
    PathBuf::from("/ssl/fullchain.pem")
}
fn default_min_version() -> TlsVersion {
    TlsVersion::Tls12
}
fn default_probe_interval_secs() -> u64 {
    30
}
fn default_action_timeout_secs() -> u64 {
    10
}
fn default_outbound_queue() -> usize {
    256
}
fn default_session_ttl_secs() -> u64 {
    300
}
fn default_max_session_ttl_secs() -> u64 {
    3600
}
fn default_max_attempts() -> u8 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_store_path() -> PathBuf {
    PathBuf::from("hublink-clients.json")
}
fn default_hub_mode() -> HubMode {
    HubMode::Local
}
fn default_hub_url() -> String {
    "ws://supervisor/core/websocket".to_string()
}
fn default_token_env() -> String {
    "SUPERVISOR_TOKEN".to_string()
}
fn default_event_buffer() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            fallback_port: None,
            redirect_to_secure: false,
            environment: default_environment(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_path: default_key_path(),
            cert_path: default_cert_path(),
            ca_path: None,
            min_version: default_min_version(),
            allow_insecure: false,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            action_timeout_secs: default_action_timeout_secs(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            max_session_ttl_secs: default_max_session_ttl_secs(),
            max_attempts: default_max_attempts(),
            sweep_interval_secs: default_sweep_interval_secs(),
            store_path: default_store_path(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mode: default_hub_mode(),
            url: default_hub_url(),
            token_env: default_token_env(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Conversion to runtime settings ────────────────────────────────────────────

impl AppConfig {
    /// Rejects values that would make the gateway misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.probe_interval_secs == 0 {
            return Err(ConfigError::Invalid("gateway.probe_interval_secs must be > 0".into()));
        }
        if self.gateway.action_timeout_secs == 0 {
            return Err(ConfigError::Invalid("gateway.action_timeout_secs must be > 0".into()));
        }
        if self.gateway.outbound_queue == 0 {
            return Err(ConfigError::Invalid("gateway.outbound_queue must be > 0".into()));
        }
        if self.pairing.max_attempts == 0 {
            return Err(ConfigError::Invalid("pairing.max_attempts must be > 0".into()));
        }
        if self.pairing.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("pairing.sweep_interval_secs must be > 0".into()));
        }
        if self.pairing.session_ttl_secs > self.pairing.max_session_ttl_secs {
            return Err(ConfigError::Invalid(
                "pairing.session_ttl_secs exceeds pairing.max_session_ttl_secs".into(),
            ));
        }
        if self.tls.enabled && self.server.fallback_port == Some(self.server.port) {
            return Err(ConfigError::Invalid(
                "server.fallback_port must differ from server.port".into(),
            ));
        }
        self.server_settings().map(|_| ())
    }

    /// `true` when the config or `HUBLINK_ENV` says this is production.
    pub fn is_production(&self) -> bool {
        let from_env = std::env::var(ENVIRONMENT_VAR).ok();
        is_production_marker(&self.server.environment)
            || from_env.as_deref().map(is_production_marker).unwrap_or(false)
    }

    pub fn server_settings(&self) -> Result<ServerSettings, ConfigError> {
        let ip: IpAddr = self.server.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "server.bind_address {:?} is not an IP address",
                self.server.bind_address
            ))
        })?;
        Ok(ServerSettings {
            bind_addr: SocketAddr::new(ip, self.server.port),
            fallback_addr: if self.tls.enabled {
                self.server.fallback_port.map(|p| SocketAddr::new(ip, p))
            } else {
                None
            },
            redirect_to_secure: self.server.redirect_to_secure,
        })
    }

    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            enabled: self.tls.enabled,
            key_path: self.tls.key_path.clone(),
            cert_path: self.tls.cert_path.clone(),
            ca_path: self.tls.ca_path.clone(),
            min_version: self.tls.min_version,
            allow_insecure: self.tls.allow_insecure,
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            probe_interval: Duration::from_secs(self.gateway.probe_interval_secs),
            action_timeout: Duration::from_secs(self.gateway.action_timeout_secs),
            outbound_queue: self.gateway.outbound_queue,
            ..GatewaySettings::default()
        }
    }

    pub fn pairing_settings(&self) -> PairingSettings {
        PairingSettings {
            default_ttl: Duration::from_secs(self.pairing.session_ttl_secs),
            max_ttl: Duration::from_secs(self.pairing.max_session_ttl_secs),
            max_attempts: self.pairing.max_attempts,
            sweep_interval: Duration::from_secs(self.pairing.sweep_interval_secs),
        }
    }
}

fn is_production_marker(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("production")
}

// ── File I/O ──────────────────────────────────────────────────────────────────

/// Loads the config at `path`, or defaults when the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path` as pretty TOML, creating parent directories.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_runtime_settings_match_domain_defaults() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.gateway_settings(), GatewaySettings::default());
        assert_eq!(cfg.pairing_settings(), PairingSettings::default());
        assert_eq!(cfg.server_settings().unwrap(), ServerSettings::default());
        assert_eq!(cfg.tls_settings(), TlsSettings::default());
    }

    #[test]
    fn test_deserialize_minimal_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();

        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.hub.mode, HubMode::Local);
    }

    #[test]
    fn test_deserialize_partial_sections_override_defaults() {
        let toml_str = r#"
[server]
port = 9000
environment = "production"

[tls]
enabled = true
min_version = "1.3"

[hub]
mode = "home_assistant"
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind_address, "0.0.0.0");
        assert!(cfg.tls.enabled);
        assert_eq!(cfg.tls.min_version, TlsVersion::Tls13);
        assert_eq!(cfg.hub.mode, HubMode::HomeAssistant);
        assert!(cfg.is_production());
    }

    #[test]
    fn test_deserialize_invalid_toml_returns_parse_error() {
        let result = toml::from_str::<AppConfig>("[server\nport = ");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_probe_interval() {
        let mut cfg = AppConfig::default();
        cfg.gateway.probe_interval_secs = 0;

        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_bind_address() {
        let mut cfg = AppConfig::default();
        cfg.server.bind_address = "not-an-ip".to_string();

        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_fallback_port_only_used_with_tls() {
        let mut cfg = AppConfig::default();
        cfg.server.fallback_port = Some(8080);
        assert!(cfg.server_settings().unwrap().fallback_addr.is_none());

        cfg.tls.enabled = true;
        assert_eq!(cfg.server_settings().unwrap().fallback_addr.map(|a| a.port()), Some(8080));
    }

    #[test]
    fn test_production_marker_is_case_insensitive() {
        assert!(is_production_marker("Production"));
        assert!(is_production_marker(" production "));
        assert!(!is_production_marker("development"));
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/hublink.toml");

        let cfg = load_config(&path).unwrap();

        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_and_load_config_round_trip_via_temp_dir() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("hublink_test_{}", Uuid::new_v4()));
        let path = dir.join("hublink.toml");
        let mut cfg = AppConfig::default();
        cfg.server.port = 12345;
        cfg.logging.level = "debug".to_string();
        cfg.tls.ca_path = Some(PathBuf::from("/ssl/ca.pem"));

        // Act
        save_config(&cfg, &path).unwrap();
        let loaded = load_config(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }
}
