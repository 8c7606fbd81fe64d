//! Error types shared across the node agent workspace.

use std::io;
use thiserror::Error;

/// Result type alias for node agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a session/bearer token was rejected. Kept distinct from the error
/// message string so callers can branch on the category (e.g. to choose
/// between an `auth-expired` and `auth-revoked` transport event) without
/// matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureKind {
    Expired,
    Revoked,
}

/// Error categories named in the error-handling design (§7): validation,
/// not-found, transient transport, auth, protocol, and fatal configuration
/// errors. Every variant maps to exactly one of those categories via
/// [`Error::is_retryable`].
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-range input (protocol payload, host fields, wake
    /// verification parameters). Non-retryable.
    #[error("validation error: {0}")]
    Validation(String),

    /// Host lookup by name or MAC failed. Non-retryable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness constraint on name/mac/ip violated.
    #[error("uniqueness conflict: {0}")]
    UniquenessConflict(String),

    /// Socket error, DNS failure, subprocess failure. Retryable via
    /// reconnect or command retry depending on context.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Session-token or bearer-token auth failure, tagged with why it was
    /// rejected so callers can distinguish expired from revoked.
    #[error("auth error: {1}")]
    Auth(AuthFailureKind, String),

    /// Inbound/outbound frame failed schema validation, or the peer
    /// reported an unsupported protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration detected at startup. The process aborts after
    /// logging this.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error with automatic conversion.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the command-reliability engine (§4.D) should retry an
    /// operation that failed with this error. Validation and not-found
    /// errors are tagged non-retryable per spec so they terminate
    /// immediately as `failed` rather than exhausting retry attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Validation(_) | Error::NotFound(_) | Error::UniquenessConflict(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_not_found_are_non_retryable() {
        assert!(!Error::Validation("bad field".into()).is_retryable());
        assert!(!Error::NotFound("host".into()).is_retryable());
        assert!(!Error::UniquenessConflict("mac".into()).is_retryable());
    }

    #[test]
    fn transient_and_timeout_are_retryable() {
        assert!(Error::Transient("socket reset".into()).is_retryable());
        assert!(Error::Timeout("wake".into()).is_retryable());
        assert!(Error::Auth(AuthFailureKind::Expired, "expired".into()).is_retryable());
    }

    #[test]
    fn io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<Vec<i32>>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
