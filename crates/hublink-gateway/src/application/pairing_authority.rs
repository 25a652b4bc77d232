//! Pairing authority: one-time PIN sessions and the durable client registry.
//!
//! # Pairing flow
//!
//! ```text
//! operator / paired device          PairingAuthority               new device
//!        │ create_session(ttl) ──────────►│                             │
//!        │◄──────── {session_id, pin} ────│                             │
//!        │            (PIN shown out of band to the new device)         │
//!        │                                │◄── complete_session(pin) ───│
//!        │                                │  mint id + certificate      │
//!        │                                │  persist Client             │
//!        │                                │──── {client_id, cert} ─────►│
//! ```
//!
//! # Concurrency
//!
//! Sessions and clients live behind separate async locks.  Completion takes
//! the session lock first and the client lock second; nothing takes them in
//! the opposite order.  Holding the session lock across the whole completion
//! guarantees a PIN is consumed by exactly one of several concurrent callers.
//!
//! The client lock is never held across disk I/O.  Each mutation takes a
//! numbered snapshot under the write lock, releases it, and hands the
//! snapshot to the store on the blocking pool.  Writes are serialised and a
//! snapshot older than the one already on disk is skipped.
//!
//! # Certificates
//!
//! A certificate is base64 of a small JSON document (serial, client id,
//! device name, SHA-256 of the submitted public key, issue time).  It is not
//! signed.  Verification is an exact comparison against the stored value.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hublink_core::protocol::PairPayload;
use hublink_core::{Client, ClientId, ErrorKind, PairingSession, ServiceError, SessionId, SessionState};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::client_store::{ClientStore, StoreError};
use crate::domain::PairingSettings;

/// How many fresh PINs are tried before giving up on a collision.
pub const MAX_PIN_RETRIES: usize = 32;

/// Version stamped into every minted certificate.
const CERTIFICATE_VERSION: u8 = 1;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Pairing failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PairingError {
    /// No usable session matches the submitted PIN (or session id).
    #[error("invalid PIN")]
    InvalidPin,

    #[error("pairing session has expired")]
    Expired,

    #[error("pairing session has already been used")]
    AlreadyConsumed,

    #[error("too many failed attempts for this pairing session")]
    AttemptsExceeded,

    /// No collision-free PIN could be generated.
    #[error("no free PIN available; retry later")]
    ResourceExhausted,

    #[error("invalid pairing request: {0}")]
    InvalidRequest(String),

    #[error("failed to persist client: {0}")]
    Storage(String),
}

impl PairingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PairingError::InvalidPin | PairingError::Expired => ErrorKind::NotFound,
            PairingError::AlreadyConsumed => ErrorKind::Conflict,
            PairingError::AttemptsExceeded | PairingError::ResourceExhausted => {
                ErrorKind::RateLimit
            }
            PairingError::InvalidRequest(_) => ErrorKind::Validation,
            PairingError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<PairingError> for ServiceError {
    fn from(err: PairingError) -> Self {
        ServiceError::new(err.kind(), err.to_string())
    }
}

impl From<StoreError> for PairingError {
    fn from(err: StoreError) -> Self {
        PairingError::Storage(err.to_string())
    }
}

// ── Requests / results ────────────────────────────────────────────────────────

/// A request to complete a pairing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletePairing {
    pub pin: String,
    pub device_name: String,
    pub device_type: String,
    pub public_key: String,
    /// When present, the PIN is checked against this session only.
    pub session_id: Option<SessionId>,
}

impl From<PairPayload> for CompletePairing {
    fn from(p: PairPayload) -> Self {
        Self {
            pin: p.pin,
            device_name: p.device_name,
            device_type: p.device_type,
            public_key: p.public_key,
            session_id: p.session_id,
        }
    }
}

/// A freshly created pairing session as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedSession {
    pub session_id: SessionId,
    pub pin: String,
    pub expires_at: DateTime<Utc>,
}

// ── PIN generation ────────────────────────────────────────────────────────────

/// Source of candidate PINs.
pub trait PinGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Uniformly random six-digit PINs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPinGenerator;

impl PinGenerator for RandomPinGenerator {
    fn generate(&self) -> String {
        format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
    }
}

// ── Certificate minting ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct CertificateClaims<'a> {
    version: u8,
    serial: String,
    client_id: ClientId,
    device_name: &'a str,
    public_key_sha256: String,
    issued_at: DateTime<Utc>,
}

/// Mints the opaque certificate for a new client.
fn mint_certificate(
    client_id: ClientId,
    device_name: &str,
    public_key: &str,
    issued_at: DateTime<Utc>,
) -> Result<String, PairingError> {
    let claims = CertificateClaims {
        version: CERTIFICATE_VERSION,
        serial: hex::encode(rand::random::<[u8; 16]>()),
        client_id,
        device_name,
        public_key_sha256: hex::encode(Sha256::digest(public_key.as_bytes())),
        issued_at,
    };
    let json = serde_json::to_vec(&claims)
        .map_err(|e| PairingError::Storage(format!("certificate encoding failed: {e}")))?;
    Ok(BASE64.encode(json))
}

// ── PairingAuthority ──────────────────────────────────────────────────────────

/// Issues pairing sessions, completes them into clients, and answers
/// certificate checks for the gateway.
pub struct PairingAuthority {
    settings: PairingSettings,
    sessions: Mutex<HashMap<SessionId, PairingSession>>,
    clients: RwLock<HashMap<ClientId, Client>>,
    /// Bumped under the client write lock for every snapshot taken.
    revision: AtomicU64,
    /// Revision of the last snapshot the store accepted.
    persisted: Mutex<u64>,
    store: Arc<dyn ClientStore>,
    pins: Box<dyn PinGenerator>,
}

type Snapshot = (u64, HashMap<ClientId, Client>);

impl PairingAuthority {
    /// Loads existing clients from `store` and starts with no sessions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store exists but cannot be read.
    pub fn new(settings: PairingSettings, store: Box<dyn ClientStore>) -> Result<Self, StoreError> {
        Self::with_pin_generator(settings, store, Box::new(RandomPinGenerator))
    }

    pub fn with_pin_generator(
        settings: PairingSettings,
        store: Box<dyn ClientStore>,
        pins: Box<dyn PinGenerator>,
    ) -> Result<Self, StoreError> {
        let clients = store.load()?;
        info!("pairing authority loaded {} client(s)", clients.len());
        Ok(Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
            clients: RwLock::new(clients),
            revision: AtomicU64::new(0),
            persisted: Mutex::new(0),
            store: Arc::from(store),
            pins,
        })
    }

    pub fn settings(&self) -> &PairingSettings {
        &self.settings
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    /// Creates a pairing session whose PIN is unique among active sessions.
    ///
    /// `ttl` is clamped to the configured maximum.
    ///
    /// # Errors
    ///
    /// [`PairingError::ResourceExhausted`] after [`MAX_PIN_RETRIES`]
    /// consecutive collisions.
    pub async fn create_session(&self, ttl: Duration) -> Result<IssuedSession, PairingError> {
        let ttl = ttl.min(self.settings.max_ttl);
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;

        for _ in 0..MAX_PIN_RETRIES {
            let pin = self.pins.generate();
            let collides = sessions.values().any(|s| s.pin == pin && s.is_active(now));
            if collides {
                debug!("generated PIN collides with an active session; retrying");
                continue;
            }

            let session = PairingSession::new(pin, ttl, now);
            let issued = IssuedSession {
                session_id: session.id,
                pin: session.pin.clone(),
                expires_at: session.expires_at,
            };
            sessions.insert(session.id, session);
            info!(
                "pairing session {} created, expires at {}",
                issued.session_id, issued.expires_at
            );
            return Ok(issued);
        }

        warn!("could not generate a unique PIN after {MAX_PIN_RETRIES} attempts");
        Err(PairingError::ResourceExhausted)
    }

    /// Creates a session with the default TTL when no client has ever
    /// paired, so a fresh install can enrol its first device.
    pub async fn ensure_bootstrap_session(&self) -> Result<Option<IssuedSession>, PairingError> {
        if self.client_count().await > 0 {
            return Ok(None);
        }
        self.create_session(self.settings.default_ttl).await.map(Some)
    }

    /// Consumes the session matching `request.pin` and creates a client.
    ///
    /// # Errors
    ///
    /// | Condition                                    | Error               |
    /// |----------------------------------------------|---------------------|
    /// | no session holds the PIN                     | `InvalidPin`        |
    /// | ... and that miss exhausts an active session | `AttemptsExceeded`  |
    /// | `session_id` given and the PIN is wrong      | `InvalidPin`        |
    /// | matched session already completed            | `AlreadyConsumed`   |
    /// | matched session past its TTL                 | `Expired`           |
    /// | matched session hit the attempt limit        | `AttemptsExceeded`  |
    /// | blank device name, type, or public key       | `InvalidRequest`    |
    /// | the client could not be persisted            | `Storage`           |
    ///
    /// A failed completion never consumes the session.  A wrong PIN counts
    /// as a failed attempt against every session it could have been aimed
    /// at: the named one when `session_id` is given, otherwise every active
    /// session.
    pub async fn complete_session(&self, request: CompletePairing) -> Result<Client, PairingError> {
        let now = Utc::now();
        let max_attempts = self.settings.max_attempts;
        let mut sessions = self.sessions.lock().await;

        let session_id = match request.session_id {
            Some(id) => Self::match_by_id(&mut sessions, id, &request.pin, now, max_attempts)?,
            None => Self::match_by_pin(&mut sessions, &request.pin, now, max_attempts)?,
        };

        if let Err(reason) = validate_device(&request) {
            if let Some(session) = sessions.get_mut(&session_id) {
                if session.record_failed_attempt(max_attempts) {
                    warn!("pairing session {session_id} exhausted by invalid requests");
                    return Err(PairingError::AttemptsExceeded);
                }
            }
            return Err(PairingError::InvalidRequest(reason));
        }

        let client_id = Uuid::new_v4();
        let certificate = mint_certificate(client_id, &request.device_name, &request.public_key, now)?;
        let client = Client {
            id: client_id,
            name: request.device_name,
            device_type: request.device_type,
            public_key: request.public_key,
            certificate,
            paired_at: now,
            last_seen: now,
            is_active: true,
            metadata: Default::default(),
        };

        let snapshot = {
            let mut clients = self.clients.write().await;
            clients.insert(client_id, client.clone());
            self.snapshot(&clients)
        };
        if let Err(e) = self.persist(snapshot).await {
            warn!("failed to persist new client {client_id}: {e}");
            let rollback = {
                let mut clients = self.clients.write().await;
                clients.remove(&client_id);
                self.snapshot(&clients)
            };
            // A concurrent write may have stored the client already.
            if let Err(again) = self.persist(rollback).await {
                debug!("rollback of client {client_id} not persisted: {again}");
            }
            return Err(e.into());
        }

        if let Some(session) = sessions.get_mut(&session_id) {
            session.complete();
        }
        info!(
            "client {client_id} ({}, {}) paired via session {session_id}",
            client.name, client.device_type
        );
        Ok(client)
    }

    /// Removes every expired or otherwise terminal session.  Returns how
    /// many were removed.
    pub async fn sweep_sessions(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.refresh(now).is_terminal());
        let removed = before - sessions.len();
        if removed > 0 {
            debug!("swept {removed} pairing session(s)");
        }
        removed
    }

    /// Number of sessions currently held, terminal ones included.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    // ── Clients ───────────────────────────────────────────────────────────────

    /// `true` iff `client_id` is registered and its stored certificate is
    /// exactly `certificate`.
    pub async fn verify_client_certificate(&self, client_id: ClientId, certificate: &str) -> bool {
        let clients = self.clients.read().await;
        clients
            .get(&client_id)
            .map(|c| c.certificate == certificate)
            .unwrap_or(false)
    }

    /// Sets `last_seen` to now and marks the client active.  Unknown ids are
    /// ignored.
    pub async fn update_client_activity(&self, client_id: ClientId) {
        let now = Utc::now();
        self.mutate_client(client_id, |c| c.touch(now)).await;
    }

    /// Clears the client's active flag.  Unknown ids are ignored.
    pub async fn mark_client_inactive(&self, client_id: ClientId) {
        self.mutate_client(client_id, Client::mark_inactive).await;
    }

    /// Clears the client's active flag unless `still_bound` reports that the
    /// client has a live connection again.
    ///
    /// `still_bound` runs while the client write lock is held, so an
    /// `update_client_activity` racing with this call is ordered either
    /// entirely before the check or entirely after the mark.  Returns `true`
    /// when the flag was cleared.
    pub async fn mark_client_inactive_unless<F, Fut>(&self, client_id: ClientId, still_bound: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let snapshot = {
            let mut clients = self.clients.write().await;
            if still_bound().await {
                debug!("client {client_id} reconnected; keeping it active");
                return false;
            }
            let Some(client) = clients.get_mut(&client_id) else {
                return false;
            };
            client.mark_inactive();
            self.snapshot(&clients)
        };
        if let Err(e) = self.persist(snapshot).await {
            warn!("failed to persist activity for client {client_id}: {e}");
        }
        true
    }

    pub async fn get_client(&self, client_id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&client_id).cloned()
    }

    /// All clients, oldest pairing first.
    pub async fn list_clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.read().await.values().cloned().collect();
        clients.sort_by_key(|c| c.paired_at);
        clients
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn mutate_client(&self, client_id: ClientId, f: impl FnOnce(&mut Client)) {
        let snapshot = {
            let mut clients = self.clients.write().await;
            let Some(client) = clients.get_mut(&client_id) else {
                debug!("ignoring activity update for unknown client {client_id}");
                return;
            };
            f(client);
            self.snapshot(&clients)
        };
        // The in-memory copy stays authoritative if persisting fails.
        if let Err(e) = self.persist(snapshot).await {
            warn!("failed to persist activity for client {client_id}: {e}");
        }
    }

    /// Copies the client map and numbers the copy.  Taking the write guard
    /// keeps revisions in mutation order.
    fn snapshot(&self, clients: &RwLockWriteGuard<'_, HashMap<ClientId, Client>>) -> Snapshot {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        (revision, (**clients).clone())
    }

    /// Writes a snapshot through the store on the blocking pool.
    async fn persist(&self, (revision, clients): Snapshot) -> Result<(), StoreError> {
        let mut persisted = self.persisted.lock().await;
        if *persisted >= revision {
            debug!("client snapshot {revision} superseded before it was written");
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&clients))
            .await
            .map_err(|e| StoreError::Writer(e.to_string()))??;
        *persisted = revision;
        Ok(())
    }

    /// Resolves an explicit session id, counting a wrong PIN against it.
    fn match_by_id(
        sessions: &mut HashMap<SessionId, PairingSession>,
        id: SessionId,
        pin: &str,
        now: DateTime<Utc>,
        max_attempts: u8,
    ) -> Result<SessionId, PairingError> {
        let Some(session) = sessions.get_mut(&id) else {
            return Err(PairingError::InvalidPin);
        };

        if let Err(e) = usable(session.refresh(now)) {
            sessions.remove(&id);
            return Err(e);
        }

        if session.pin != pin {
            if session.record_failed_attempt(max_attempts) {
                warn!("pairing session {id} exhausted after {max_attempts} failed attempts");
                return Err(PairingError::AttemptsExceeded);
            }
            debug!(
                "wrong PIN for session {id}; {} attempt(s) remaining",
                session.attempts_remaining(max_attempts)
            );
            return Err(PairingError::InvalidPin);
        }
        Ok(id)
    }

    /// Resolves a bare PIN.  A usable session wins; otherwise the most
    /// informative terminal state among sessions holding the PIN is reported
    /// and those sessions are dropped, so a repeat submission sees
    /// `InvalidPin`.  A PIN no session holds is a failed attempt against
    /// every active session.
    fn match_by_pin(
        sessions: &mut HashMap<SessionId, PairingSession>,
        pin: &str,
        now: DateTime<Utc>,
        max_attempts: u8,
    ) -> Result<SessionId, PairingError> {
        let mut terminal: Vec<(SessionId, SessionState)> = Vec::new();
        for session in sessions.values_mut().filter(|s| s.pin == pin) {
            match session.refresh(now) {
                SessionState::Created => return Ok(session.id),
                state => terminal.push((session.id, state)),
            }
        }

        let reported = terminal
            .iter()
            .map(|(_, state)| *state)
            .min_by_key(|state| match state {
                SessionState::Completed => 0,
                SessionState::Exhausted => 1,
                _ => 2,
            });
        for (id, _) in &terminal {
            sessions.remove(id);
        }

        match reported {
            Some(state) => Err(usable(state).err().unwrap_or(PairingError::InvalidPin)),
            None => Err(Self::record_miss(sessions, now, max_attempts)),
        }
    }

    /// Counts an unmatched PIN against every active session.
    fn record_miss(
        sessions: &mut HashMap<SessionId, PairingSession>,
        now: DateTime<Utc>,
        max_attempts: u8,
    ) -> PairingError {
        let mut exhausted = false;
        for session in sessions.values_mut() {
            if !matches!(session.refresh(now), SessionState::Created) {
                continue;
            }
            if session.record_failed_attempt(max_attempts) {
                warn!(
                    "pairing session {} exhausted after {max_attempts} unmatched PINs",
                    session.id
                );
                exhausted = true;
            }
        }
        if exhausted {
            PairingError::AttemptsExceeded
        } else {
            PairingError::InvalidPin
        }
    }
}

/// Maps a session state to the error a completion attempt reports.
fn usable(state: SessionState) -> Result<(), PairingError> {
    match state {
        SessionState::Created => Ok(()),
        SessionState::Completed => Err(PairingError::AlreadyConsumed),
        SessionState::Expired => Err(PairingError::Expired),
        SessionState::Exhausted => Err(PairingError::AttemptsExceeded),
    }
}

fn validate_device(request: &CompletePairing) -> Result<(), String> {
    if request.device_name.trim().is_empty() {
        return Err("device_name must not be empty".to_string());
    }
    if request.device_type.trim().is_empty() {
        return Err("device_type must not be empty".to_string());
    }
    if request.public_key.trim().is_empty() {
        return Err("public_key must not be empty".to_string());
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::client_store::MemoryClientStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Always returns the same PIN.
    struct FixedPin(&'static str);

    impl PinGenerator for FixedPin {
        fn generate(&self) -> String {
            self.0.to_string()
        }
    }

    /// Counts how many PINs were requested.
    struct CountingPin(Arc<AtomicUsize>);

    impl PinGenerator for CountingPin {
        fn generate(&self) -> String {
            self.0.fetch_add(1, Ordering::SeqCst);
            "000000".to_string()
        }
    }

    /// A store whose writes always fail.
    struct FailingStore;

    impl ClientStore for FailingStore {
        fn load(&self) -> Result<HashMap<ClientId, Client>, StoreError> {
            Ok(HashMap::new())
        }
        fn save(&self, _: &HashMap<ClientId, Client>) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    fn authority() -> PairingAuthority {
        PairingAuthority::new(PairingSettings::default(), Box::new(MemoryClientStore::new())).unwrap()
    }

    fn fixed_authority(pin: &'static str) -> PairingAuthority {
        PairingAuthority::with_pin_generator(
            PairingSettings::default(),
            Box::new(MemoryClientStore::new()),
            Box::new(FixedPin(pin)),
        )
        .unwrap()
    }

    fn request(pin: &str) -> CompletePairing {
        CompletePairing {
            pin: pin.to_string(),
            device_name: "Kitchen Tablet".to_string(),
            device_type: "tablet".to_string(),
            public_key: "PK".to_string(),
            session_id: None,
        }
    }

    // ── create_session ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_session_returns_six_digit_pin() {
        let issued = authority().create_session(Duration::from_secs(300)).await.unwrap();

        assert_eq!(issued.pin.len(), 6);
        assert!(issued.pin.chars().all(|c| c.is_ascii_digit()));
        assert!(issued.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_active_session_pins_are_unique() {
        let authority = authority();
        let mut pins = HashSet::new();
        for _ in 0..50 {
            let issued = authority.create_session(Duration::from_secs(300)).await.unwrap();
            assert!(pins.insert(issued.pin), "duplicate PIN among active sessions");
        }
    }

    #[tokio::test]
    async fn test_pin_collision_exhausts_after_bounded_retries() {
        // Arrange: every candidate is "000000", which the first session holds.
        let calls = Arc::new(AtomicUsize::new(0));
        let authority = PairingAuthority::with_pin_generator(
            PairingSettings::default(),
            Box::new(MemoryClientStore::new()),
            Box::new(CountingPin(Arc::clone(&calls))),
        )
        .unwrap();
        authority.create_session(Duration::from_secs(300)).await.unwrap();

        // Act
        let result = authority.create_session(Duration::from_secs(300)).await;

        // Assert
        assert_eq!(result, Err(PairingError::ResourceExhausted));
        assert_eq!(calls.load(Ordering::SeqCst), 1 + MAX_PIN_RETRIES);
        assert_eq!(PairingError::ResourceExhausted.kind(), ErrorKind::RateLimit);
    }

    #[tokio::test]
    async fn test_expired_session_pin_can_be_reissued() {
        let authority = fixed_authority("424242");
        authority.create_session(Duration::ZERO).await.unwrap();

        let second = authority.create_session(Duration::from_secs(60)).await;

        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_create_session_clamps_ttl() {
        let authority = authority();
        let max = authority.settings().max_ttl;

        let issued = authority.create_session(max * 10).await.unwrap();

        let ttl = issued.expires_at - Utc::now();
        assert!(ttl <= chrono::Duration::from_std(max).unwrap());
    }

    // ── complete_session ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_complete_session_creates_client_with_certificate() {
        // Arrange
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();

        // Act
        let client = authority.complete_session(request("123456")).await.unwrap();

        // Assert
        assert_eq!(client.name, "Kitchen Tablet");
        assert!(client.is_active);
        assert!(!client.certificate.is_empty());
        assert!(authority.verify_client_certificate(client.id, &client.certificate).await);
        assert_eq!(authority.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_certificate_decodes_to_claims() {
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();
        let client = authority.complete_session(request("123456")).await.unwrap();

        let raw = BASE64.decode(&client.certificate).unwrap();
        let claims: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        assert_eq!(claims["client_id"], client.id.to_string());
        assert_eq!(claims["device_name"], "Kitchen Tablet");
        assert_eq!(claims["public_key_sha256"], hex::encode(Sha256::digest(b"PK")));
        assert_eq!(claims["serial"].as_str().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_second_completion_is_conflict_then_invalid_pin() {
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();
        authority.complete_session(request("123456")).await.unwrap();

        let second = authority.complete_session(request("123456")).await;
        let third = authority.complete_session(request("123456")).await;

        assert_eq!(second, Err(PairingError::AlreadyConsumed));
        assert_eq!(third, Err(PairingError::InvalidPin));
        assert_eq!(authority.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_pin_is_invalid() {
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();

        let result = authority.complete_session(request("000000")).await;

        assert_eq!(result, Err(PairingError::InvalidPin));
        assert_eq!(PairingError::InvalidPin.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_zero_ttl_session_reports_expired() {
        let authority = fixed_authority("123456");
        authority.create_session(Duration::ZERO).await.unwrap();

        let result = authority.complete_session(request("123456")).await;

        assert_eq!(result, Err(PairingError::Expired));
        assert_eq!(authority.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_pin_with_session_id_exhausts_session() {
        // Arrange
        let authority = fixed_authority("123456");
        let issued = authority.create_session(Duration::from_secs(300)).await.unwrap();
        let max = authority.settings().max_attempts;
        let mut wrong = request("999999");
        wrong.session_id = Some(issued.session_id);

        // Act: max - 1 plain failures, then the one that exhausts.
        for _ in 1..max {
            assert_eq!(
                authority.complete_session(wrong.clone()).await,
                Err(PairingError::InvalidPin)
            );
        }
        let exhausting = authority.complete_session(wrong).await;

        // Assert: even the right PIN is now refused.
        let mut right = request("123456");
        right.session_id = Some(issued.session_id);
        assert_eq!(exhausting, Err(PairingError::AttemptsExceeded));
        assert_eq!(
            authority.complete_session(right).await,
            Err(PairingError::AttemptsExceeded)
        );
    }

    #[tokio::test]
    async fn test_pin_only_guessing_exhausts_active_session() {
        // Arrange
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();
        let max = authority.settings().max_attempts;

        // Act: guesses without a session id still count against the session.
        for _ in 1..max {
            assert_eq!(
                authority.complete_session(request("999999")).await,
                Err(PairingError::InvalidPin)
            );
        }
        let exhausting = authority.complete_session(request("999999")).await;

        // Assert
        assert_eq!(exhausting, Err(PairingError::AttemptsExceeded));
        assert_eq!(
            authority.complete_session(request("123456")).await,
            Err(PairingError::AttemptsExceeded)
        );
        assert_eq!(authority.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_pin_counts_against_every_active_session() {
        let authority = authority();
        let a = authority.create_session(Duration::from_secs(300)).await.unwrap();
        let b = authority.create_session(Duration::from_secs(300)).await.unwrap();
        let wrong = (0..1_000_000u32)
            .map(|n| format!("{n:06}"))
            .find(|p| *p != a.pin && *p != b.pin)
            .unwrap();

        for _ in 0..authority.settings().max_attempts {
            let _ = authority.complete_session(request(&wrong)).await;
        }

        assert_eq!(
            authority.complete_session(request(&a.pin)).await,
            Err(PairingError::AttemptsExceeded)
        );
        assert_eq!(
            authority.complete_session(request(&b.pin)).await,
            Err(PairingError::AttemptsExceeded)
        );
    }

    #[tokio::test]
    async fn test_unmatched_pin_without_sessions_is_invalid() {
        let authority = authority();

        for _ in 0..10 {
            assert_eq!(
                authority.complete_session(request("123456")).await,
                Err(PairingError::InvalidPin)
            );
        }
    }

    #[tokio::test]
    async fn test_blank_device_name_counts_as_failed_attempt() {
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();
        let mut bad = request("123456");
        bad.device_name = "   ".to_string();

        let result = authority.complete_session(bad).await;

        assert!(matches!(result, Err(PairingError::InvalidRequest(_))));
        // The session survives and can still be completed.
        assert!(authority.complete_session(request("123456")).await.is_ok());
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_consume_session() {
        let authority = PairingAuthority::with_pin_generator(
            PairingSettings::default(),
            Box::new(FailingStore),
            Box::new(FixedPin("123456")),
        )
        .unwrap();
        authority.create_session(Duration::from_secs(300)).await.unwrap();

        let result = authority.complete_session(request("123456")).await;

        assert!(matches!(result, Err(PairingError::Storage(_))));
        assert_eq!(authority.client_count().await, 0);
        assert_eq!(
            authority.complete_session(request("123456")).await.map(|_| ()),
            Err(PairingError::Storage("client store lock poisoned".to_string()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_completions_consume_pin_once() {
        // Arrange
        let authority = Arc::new(fixed_authority("123456"));
        authority.create_session(Duration::from_secs(300)).await.unwrap();

        // Act
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let a = Arc::clone(&authority);
            tasks.push(tokio::spawn(async move { a.complete_session(request("123456")).await }));
        }
        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        // Assert
        assert_eq!(successes, 1);
        assert_eq!(authority.client_count().await, 1);
    }

    // ── Certificates & activity ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_verify_is_exact_string_equality() {
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();
        let client = authority.complete_session(request("123456")).await.unwrap();

        let padded = format!("{} ", client.certificate);
        assert!(!authority.verify_client_certificate(client.id, &padded).await);
        assert!(!authority.verify_client_certificate(client.id, "").await);
        assert!(!authority.verify_client_certificate(Uuid::new_v4(), &client.certificate).await);
    }

    #[tokio::test]
    async fn test_activity_updates_last_seen_and_active_flag() {
        let authority = fixed_authority("123456");
        authority.create_session(Duration::from_secs(300)).await.unwrap();
        let client = authority.complete_session(request("123456")).await.unwrap();

        authority.mark_client_inactive(client.id).await;
        assert!(!authority.get_client(client.id).await.unwrap().is_active);

        authority.update_client_activity(client.id).await;
        let updated = authority.get_client(client.id).await.unwrap();
        assert!(updated.is_active);
        assert!(updated.last_seen >= client.last_seen);
    }

    #[tokio::test]
    async fn test_activity_for_unknown_client_is_noop() {
        let authority = authority();

        authority.update_client_activity(Uuid::new_v4()).await;
        authority.mark_client_inactive(Uuid::new_v4()).await;

        assert_eq!(authority.client_count().await, 0);
    }

    /// A store whose saves block until the test opens the gate.
    struct GatedStore {
        clients: HashMap<ClientId, Client>,
        entered: std::sync::Mutex<std::sync::mpsc::Sender<()>>,
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ClientStore for GatedStore {
        fn load(&self) -> Result<HashMap<ClientId, Client>, StoreError> {
            Ok(self.clients.clone())
        }
        fn save(&self, _: &HashMap<ClientId, Client>) -> Result<(), StoreError> {
            let _ = self.entered.lock().map_err(|_| StoreError::Poisoned)?.send(());
            let _ = self.gate.lock().map_err(|_| StoreError::Poisoned)?.recv();
            Ok(())
        }
    }

    fn stored_client() -> Client {
        let now = Utc::now();
        Client {
            id: Uuid::new_v4(),
            name: "phone".to_string(),
            device_type: "phone".to_string(),
            public_key: "PK".to_string(),
            certificate: "cert".to_string(),
            paired_at: now,
            last_seen: now,
            is_active: false,
            metadata: Default::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_verify_does_not_wait_for_a_slow_store_write() {
        // Arrange
        let existing = stored_client();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let store = GatedStore {
            clients: [(existing.id, existing.clone())].into_iter().collect(),
            entered: std::sync::Mutex::new(entered_tx),
            gate: std::sync::Mutex::new(gate_rx),
        };
        let authority = Arc::new(PairingAuthority::new(PairingSettings::default(), Box::new(store)).unwrap());
        let writer = {
            let a = Arc::clone(&authority);
            let id = existing.id;
            tokio::spawn(async move { a.update_client_activity(id).await })
        };
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Act: the write is stuck in the store.
        let verified = tokio::time::timeout(
            Duration::from_secs(1),
            authority.verify_client_certificate(existing.id, "cert"),
        )
        .await;
        let seen = tokio::time::timeout(Duration::from_secs(1), authority.get_client(existing.id)).await;
        gate_tx.send(()).unwrap();
        writer.await.unwrap();

        // Assert
        assert!(matches!(verified, Ok(true)));
        assert!(seen.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_inactive_mark_skipped_when_client_is_bound_again() {
        let existing = stored_client();
        let store = MemoryClientStore::with_clients([Client {
            is_active: true,
            ..existing.clone()
        }]);
        let authority = PairingAuthority::new(PairingSettings::default(), Box::new(store)).unwrap();

        let skipped = authority.mark_client_inactive_unless(existing.id, || async { true }).await;
        let cleared = authority.mark_client_inactive_unless(existing.id, || async { false }).await;

        assert!(!skipped);
        assert!(cleared);
        assert!(!authority.get_client(existing.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_clients_are_loaded_from_store() {
        let now = Utc::now();
        let existing = Client {
            id: Uuid::new_v4(),
            name: "phone".to_string(),
            device_type: "phone".to_string(),
            public_key: "PK".to_string(),
            certificate: "cert".to_string(),
            paired_at: now,
            last_seen: now,
            is_active: false,
            metadata: Default::default(),
        };
        let store = MemoryClientStore::with_clients([existing.clone()]);

        let authority = PairingAuthority::new(PairingSettings::default(), Box::new(store)).unwrap();

        assert!(authority.verify_client_certificate(existing.id, "cert").await);
        assert_eq!(authority.list_clients().await, vec![existing]);
    }

    // ── Sweeping & bootstrap ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_sweep_removes_expired_and_keeps_active() {
        let authority = authority();
        authority.create_session(Duration::ZERO).await.unwrap();
        authority.create_session(Duration::from_secs(300)).await.unwrap();

        let removed = authority.sweep_sessions().await;

        assert_eq!(removed, 1);
        assert_eq!(authority.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_session_only_when_no_clients() {
        let authority = fixed_authority("123456");

        let first = authority.ensure_bootstrap_session().await.unwrap();
        assert!(first.is_some());

        authority.complete_session(request("123456")).await.unwrap();
        let second = authority.ensure_bootstrap_session().await.unwrap();
        assert!(second.is_none());
    }
}
