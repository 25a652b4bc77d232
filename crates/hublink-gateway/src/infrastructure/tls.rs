//! Transport security for the WebSocket listener.
//!
//! [`TransportSecurity::from_settings`] is called once at startup and either
//! returns a ready [`TlsAcceptor`] or an explicit `Plaintext` marker.  It
//! never degrades silently:
//!
//! | `tls.enabled` | files present | production | `allow_insecure` | Result                 |
//! |---------------|---------------|------------|------------------|------------------------|
//! | true          | yes           | any        | any              | `Tls`                  |
//! | true          | no            | any        | any              | `MissingFile` error    |
//! | false         | n/a           | no         | any              | `Plaintext` + warning  |
//! | false         | n/a           | yes        | false            | `InsecureInProduction` |
//! | false         | n/a           | yes        | true             | `Plaintext` + warning  |
//!
//! The acceptor uses the `ring` provider restricted to AEAD cipher suites with
//! forward secrecy, and negotiates between the configured minimum version and
//! TLS 1.3.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::version::{TLS12, TLS13};
use rustls::{CipherSuite, ServerConfig, SupportedProtocolVersion};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::domain::{TlsSettings, TlsVersion};

/// Cipher suites the listener is willing to negotiate.
const ALLOWED_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

static TLS12_AND_TLS13: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

/// Errors raised while preparing transport security.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS is enabled but the {role} file {path} does not exist")]
    MissingFile { role: &'static str, path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no PEM certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no PEM private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error(
        "refusing to serve plaintext in production; enable TLS or set tls.allow_insecure = true"
    )]
    InsecureInProduction,
}

/// How accepted TCP streams are secured.
#[derive(Clone)]
pub enum TransportSecurity {
    Tls(TlsAcceptor),
    /// Explicitly configured plaintext.
    Plaintext,
}

impl std::fmt::Debug for TransportSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportSecurity::Tls(_) => f.write_str("TransportSecurity::Tls"),
            TransportSecurity::Plaintext => f.write_str("TransportSecurity::Plaintext"),
        }
    }
}

impl TransportSecurity {
    /// Builds the listener's security mode.  See the module table.
    pub fn from_settings(settings: &TlsSettings, production: bool) -> Result<Self, TlsError> {
        if !settings.enabled {
            if production && !settings.allow_insecure {
                return Err(TlsError::InsecureInProduction);
            }
            warn!("TLS is DISABLED: certificates and tokens travel in plaintext");
            if production {
                warn!("plaintext explicitly allowed in production via tls.allow_insecure");
            }
            return Ok(TransportSecurity::Plaintext);
        }

        let config = build_server_config(settings)?;
        info!(
            "TLS enabled (min version {:?}, cert {})",
            settings.min_version,
            settings.cert_path.display()
        );
        Ok(TransportSecurity::Tls(TlsAcceptor::from(Arc::new(config))))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, TransportSecurity::Tls(_))
    }

    /// URL scheme clients should use.
    pub fn scheme(&self) -> &'static str {
        if self.is_tls() {
            "wss"
        } else {
            "ws"
        }
    }
}

/// The `ring` provider with non-allow-listed suites removed.
pub fn restricted_provider() -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    provider
        .cipher_suites
        .retain(|suite| ALLOWED_CIPHER_SUITES.contains(&suite.suite()));
    provider
}

fn protocol_versions(min: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match min {
        TlsVersion::Tls12 => TLS12_AND_TLS13,
        TlsVersion::Tls13 => TLS13_ONLY,
    }
}

fn build_server_config(settings: &TlsSettings) -> Result<ServerConfig, TlsError> {
    require_file("private key", &settings.key_path)?;
    require_file("certificate", &settings.cert_path)?;

    let mut chain = load_certs(&settings.cert_path)?;
    if let Some(ca_path) = &settings.ca_path {
        if ca_path.exists() {
            chain.extend(load_certs(ca_path)?);
        } else {
            warn!("CA file {} not found; serving chain without it", ca_path.display());
        }
    }
    let key = load_private_key(&settings.key_path)?;

    let config = ServerConfig::builder_with_provider(Arc::new(restricted_provider()))
        .with_protocol_versions(protocol_versions(settings.min_version))?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(config)
}

fn require_file(role: &'static str, path: &Path) -> Result<(), TlsError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(TlsError::MissingFile {
            role,
            path: path.to_path_buf(),
        })
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
