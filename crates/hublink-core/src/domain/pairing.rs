//! One-time PIN pairing sessions.
//!
//! # Session lifecycle
//!
//! ```text
//!            ┌──► Completed   (PIN consumed, client created)
//! Created ───┼──► Expired     (TTL elapsed)
//!            └──► Exhausted   (failed-attempt limit hit)
//! ```
//!
//! All three right-hand states are terminal: no method on [`PairingSession`]
//! moves a session out of them.  Expiry is evaluated lazily through
//! [`PairingSession::refresh`], so a session past its TTL is unusable even if
//! no sweep has run yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a pairing session.
pub type SessionId = Uuid;

/// Lifecycle state of a [`PairingSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Completed,
    Expired,
    Exhausted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Created)
    }
}

/// An ephemeral pairing session.  Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingSession {
    pub id: SessionId,
    pub pin: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    state: SessionState,
    failed_attempts: u8,
}

impl PairingSession {
    /// Creates a session in the `Created` state that expires `ttl` after `now`.
    pub fn new(pin: impl Into<String>, ttl: std::time::Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            id: Uuid::new_v4(),
            pin: pin.into(),
            created_at: now,
            expires_at: now + ttl,
            state: SessionState::Created,
            failed_attempts: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn failed_attempts(&self) -> u8 {
        self.failed_attempts
    }

    /// `true` while the session can still be completed at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Created && now < self.expires_at
    }

    /// Applies the lazy TTL check and returns the resulting state.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> SessionState {
        if self.state == SessionState::Created && now >= self.expires_at {
            self.state = SessionState::Expired;
        }
        self.state
    }

    /// Consumes the session.  Returns `false` (and changes nothing) unless
    /// the session was still `Created`.
    pub fn complete(&mut self) -> bool {
        if self.state != SessionState::Created {
            return false;
        }
        self.state = SessionState::Completed;
        true
    }

    /// Counts one failed attempt against this session.
    ///
    /// Returns `true` when the attempt reached `max_attempts` and the session
    /// is now `Exhausted`.  Terminal sessions are not modified.
    pub fn record_failed_attempt(&mut self, max_attempts: u8) -> bool {
        if self.state != SessionState::Created {
            return self.state == SessionState::Exhausted;
        }
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts >= max_attempts {
            self.state = SessionState::Exhausted;
            return true;
        }
        false
    }

    /// Attempts left before the session is exhausted.
    pub fn attempts_remaining(&self, max_attempts: u8) -> u8 {
        max_attempts.saturating_sub(self.failed_attempts)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
