//! Error handling for the AirDrop protocol engine
//!
//! One error type covers the whole engine. Most variants convert
//! automatically from the underlying library errors via `thiserror`;
//! the protocol-specific variants carry the context the caller needs
//! to decide between log-and-continue, surfacing to the user, and
//! aborting startup.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, AirDropError>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum AirDropError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS error during handshake or stream I/O
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Key generation, certificate build or signing failure
    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// HTTP layer error (connection setup, stream handling)
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Certificate store inaccessible (fatal at startup)
    #[error("certificate store unavailable: {0}")]
    StoreUnavailable(String),

    /// BLE radio or Wi-Fi Direct hardware not present
    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),

    /// Every transport provider failed for the peer
    #[error("no transport available for peer {0}")]
    NoTransport(String),

    /// Peer did not answer /Discover with a 2xx
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// TLS handshake failed or the peer certificate was unusable
    #[error("TLS handshake failure: {0}")]
    TlsHandshake(String),

    /// Non-conforming JSON, bad multipart, or /Upload without /Ask
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Peer declined the transfer (/Ask answered 403)
    #[error("peer rejected the transfer")]
    PeerRejected(Option<String>),

    /// No approval decision within the configured window
    #[error("approval timed out")]
    ApprovalTimeout,

    /// A timed operation exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation cancelled by the user
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Device not present in the registry
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Operation attempted in an invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Discovery backend failure (mDNS daemon, BLE adapter)
    #[error("discovery error: {0}")]
    Discovery(String),
}

impl AirDropError {
    /// Convert a generic I/O error into a more specific variant where the
    /// error kind tells us what actually happened.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => AirDropError::Timeout(format!("{context}: {error}")),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => {
                AirDropError::PeerUnreachable(format!("{context}: {error}"))
            }
            _ => AirDropError::Io(error),
        }
    }

    /// Whether this error makes startup impossible and must abort the
    /// process rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AirDropError::StoreUnavailable(_) | AirDropError::Crypto(_)
        )
    }

    /// Whether the failed operation may succeed if tried again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AirDropError::Timeout(_)
                | AirDropError::PeerUnreachable(_)
                | AirDropError::NoTransport(_)
                | AirDropError::Io(_)
                | AirDropError::Discovery(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        use std::io::{Error, ErrorKind};

        let e = AirDropError::from_io_error(
            Error::new(ErrorKind::TimedOut, "deadline"),
            "connecting",
        );
        assert!(matches!(e, AirDropError::Timeout(_)));

        let e = AirDropError::from_io_error(
            Error::new(ErrorKind::ConnectionRefused, "refused"),
            "connecting",
        );
        assert!(matches!(e, AirDropError::PeerUnreachable(_)));

        let e = AirDropError::from_io_error(
            Error::new(ErrorKind::NotFound, "missing"),
            "reading",
        );
        assert!(matches!(e, AirDropError::Io(_)));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(AirDropError::StoreUnavailable("no keychain".into()).is_fatal());
        assert!(!AirDropError::ApprovalTimeout.is_fatal());
        assert!(!AirDropError::PeerRejected(None).is_fatal());
    }

    #[test]
    fn test_rejection_display() {
        let e = AirDropError::PeerRejected(Some("busy".into()));
        assert_eq!(e.to_string(), "peer rejected the transfer");
    }
}
