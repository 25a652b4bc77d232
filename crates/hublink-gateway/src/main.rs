//! HubLink gateway entry point.
//!
//! Pairs client devices with a one-time PIN and then serves their persistent
//! WebSocket connections: hub entity changes are pushed to them in real time
//! and their `call_service` requests are forwarded to the hub.
//!
//! # Usage
//!
//! ```text
//! hublink-gateway [OPTIONS]
//!
//! Options:
//!   --config <PATH>          TOML config file [default: hublink.toml]
//!   --bind <IP>              Override server.bind_address
//!   --port <PORT>            Override server.port
//!   --tls <true|false>       Override tls.enabled
//!   --log-level <FILTER>     Override logging.level
//!   --write-default-config   Write the effective config to --config and exit
//! ```
//!
//! # Environment variables
//!
//! | Variable           | Description                                       |
//! |--------------------|---------------------------------------------------|
//! | `HUBLINK_CONFIG`   | Config file path (same as `--config`)             |
//! | `HUBLINK_PORT`     | Listener port (same as `--port`)                  |
//! | `HUBLINK_TLS`      | TLS toggle (same as `--tls`)                      |
//! | `HUBLINK_ENV`      | `production` enables the plaintext guard          |
//! | `RUST_LOG`         | `tracing` filter; wins over `logging.level`       |
//! | `SUPERVISOR_TOKEN` | Hub access token (name set by `hub.token_env`)    |
//!
//! # Startup sequence
//!
//! 1. Parse flags, load and validate the config file.
//! 2. Initialise `tracing`.
//! 3. Build transport security; refuse to start on missing certificates or
//!    on plaintext in production without explicit opt-in.
//! 4. Load paired clients, connect the hub adapter, bind the listeners.
//! 5. With no paired clients, open a bootstrap pairing session and log its
//!    PIN so the first device can enrol.
//! 6. Serve until Ctrl+C.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hublink_gateway::application::{ConnectionRegistry, Gateway, HubAdapter, PairingAuthority};
use hublink_gateway::infrastructure::hub::{HomeAssistantConfig, HomeAssistantHub, LocalHub};
use hublink_gateway::infrastructure::storage::{
    load_config, save_config, AppConfig, HubMode, JsonFileClientStore,
};
use hublink_gateway::infrastructure::tls::TransportSecurity;
use hublink_gateway::infrastructure::ws_server::GatewayServer;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// HubLink pairing authority and real-time WebSocket gateway.
#[derive(Debug, Parser)]
#[command(
    name = "hublink-gateway",
    about = "Pairing authority and real-time WebSocket gateway for home-automation hubs",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "hublink.toml", env = "HUBLINK_CONFIG")]
    config: PathBuf,

    /// IP address to bind the listener to.
    #[arg(long, env = "HUBLINK_BIND")]
    bind: Option<IpAddr>,

    /// Listener port.
    #[arg(long, env = "HUBLINK_PORT")]
    port: Option<u16>,

    /// Enable or disable TLS on the main listener.
    #[arg(long, env = "HUBLINK_TLS")]
    tls: Option<bool>,

    /// `tracing` filter directive, e.g. `debug` or `hublink_gateway=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Write the effective configuration to `--config` and exit.
    #[arg(long)]
    write_default_config: bool,
}

impl Cli {
    /// Applies command-line overrides on top of the file config.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(bind) = self.bind {
            config.server.bind_address = bind.to_string();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(tls) = self.tls {
            config.tls.enabled = tls;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    cli.apply(&mut config);

    if cli.write_default_config {
        save_config(&config, &cli.config)?;
        println!("wrote configuration to {}", cli.config.display());
        return Ok(());
    }

    // ── Logging setup ─────────────────────────────────────────────────────────
    //
    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    config.validate().context("invalid configuration")?;

    // ── Transport security ────────────────────────────────────────────────────
    let production = config.is_production();
    let security = TransportSecurity::from_settings(&config.tls_settings(), production)
        .context("transport security setup failed")?;

    // ── Application wiring ────────────────────────────────────────────────────
    let store = JsonFileClientStore::new(config.pairing.store_path.clone());
    let authority = Arc::new(
        PairingAuthority::new(config.pairing_settings(), Box::new(store))
            .context("failed to load paired clients")?,
    );
    let hub = build_hub(&config)?;
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&authority),
        Arc::new(ConnectionRegistry::new()),
        hub,
        config.gateway_settings(),
    ));

    let server = GatewayServer::bind(config.server_settings()?, security, gateway).await?;

    if let Some(issued) = authority.ensure_bootstrap_session().await? {
        warn!(
            "no paired clients yet; bootstrap pairing PIN {} (session {}, expires {})",
            issued.pin, issued.session_id, issued.expires_at
        );
    }

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    server.run(running).await?;

    info!("HubLink gateway stopped");
    Ok(())
}

fn build_hub(config: &AppConfig) -> anyhow::Result<Arc<dyn HubAdapter>> {
    match config.hub.mode {
        HubMode::Local => {
            info!("using the in-process local hub");
            Ok(Arc::new(LocalHub::new(config.hub.event_buffer)))
        }
        HubMode::HomeAssistant => {
            let token = std::env::var(&config.hub.token_env).with_context(|| {
                format!(
                    "hub.mode = home_assistant requires the {} environment variable",
                    config.hub.token_env
                )
            })?;
            let mut ha = HomeAssistantConfig::new(config.hub.url.clone(), token);
            ha.event_buffer = config.hub.event_buffer;
            info!("connecting to Home Assistant at {}", ha.url);
            Ok(Arc::new(HomeAssistantHub::spawn(ha)))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_use_hublink_toml() {
        let cli = Cli::parse_from(["hublink-gateway"]);

        assert_eq!(cli.config, PathBuf::from("hublink.toml"));
        assert!(cli.port.is_none());
        assert!(!cli.write_default_config);
    }

    #[test]
    fn test_cli_overrides_apply_to_config() {
        // Arrange
        let cli = Cli::parse_from([
            "hublink-gateway",
            "--bind",
            "127.0.0.1",
            "--port",
            "9001",
            "--tls",
            "true",
            "--log-level",
            "debug",
        ]);
        let mut config = AppConfig::default();

        // Act
        cli.apply(&mut config);

        // Assert
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.port, 9001);
        assert!(config.tls.enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_rejects_non_ip_bind() {
        let result = Cli::try_parse_from(["hublink-gateway", "--bind", "localhost"]);

        assert!(result.is_err());
    }

    #[test]
    fn test_local_hub_is_default() {
        assert!(build_hub(&AppConfig::default()).is_ok());
    }
}
