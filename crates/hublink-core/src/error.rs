//! Flat error taxonomy shared by every HubLink layer.
//!
//! Every operational failure, whether it comes from the pairing authority,
//! the protocol codec, or the hub adapter, is classified into exactly one
//! [`ErrorKind`].  The kind decides the status code and the stable
//! upper-snake code that clients see in an `error` reply; the human-readable
//! message is for logs and diagnostics only.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an operational failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed request body or message.
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    /// Missing or invalid credentials, or a protected message before auth.
    #[serde(rename = "AUTHENTICATION_ERROR")]
    Authentication,
    /// Unknown client or session.
    NotFound,
    /// The resource was already consumed (e.g. a pairing PIN).
    Conflict,
    /// Attempt limit or PIN space exhausted.
    RateLimit,
    /// The hub could not be reached or did not answer in time.
    ServiceUnavailable,
    /// Unexpected internal fault.
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code associated with the kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimit => 429,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// Stable code carried in `error` replies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// `true` for failures that are reported to the caller and never
    /// terminate anything beyond the current request.
    pub fn is_operational(self) -> bool {
        !matches!(self, ErrorKind::Internal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified failure, ready to be reported to a client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_taxonomy() {
        assert_eq!(ErrorKind::Validation.status_code(), 400);
        assert_eq!(ErrorKind::Authentication.status_code(), 401);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
        assert_eq!(ErrorKind::RateLimit.status_code(), 429);
        assert_eq!(ErrorKind::ServiceUnavailable.status_code(), 503);
        assert_eq!(ErrorKind::Internal.status_code(), 500);
    }

    #[test]
    fn test_kind_serializes_as_its_wire_code() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Authentication,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::RateLimit,
            ErrorKind::ServiceUnavailable,
            ErrorKind::Internal,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn test_only_internal_is_non_operational() {
        assert!(ErrorKind::Authentication.is_operational());
        assert!(ErrorKind::RateLimit.is_operational());
        assert!(!ErrorKind::Internal.is_operational());
    }

    #[test]
    fn test_service_error_display_includes_code_and_message() {
        let err = ServiceError::authentication("authentication required");
        assert_eq!(err.to_string(), "AUTHENTICATION_ERROR: authentication required");
        assert_eq!(err.status_code(), 401);
    }
}
