//! Error types for BitChat core.
//!
//! All errors are designed to avoid leaking sensitive information.
//! Inbound-path errors (decryption, parse) are silently dropped with a
//! log entry rather than surfaced, to avoid oracle leaks.

use thiserror::Error;

/// Core error type for BitChat operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed user-supplied input (hash id, QR URI, exchange payload).
    #[error("invalid input")]
    InvalidInput(String),

    /// The entity already exists; soft, callers usually return the
    /// existing record instead of propagating this.
    #[error("already exists")]
    AlreadyExists(String),

    /// Resource not found; queries surface this as `None`/empty.
    #[error("not found")]
    NotFound(String),

    /// Action refused because the peer is blocked.
    #[error("peer is blocked")]
    BlockedPeer,

    /// No Noise session established with the peer yet.
    #[error("no active session")]
    SessionUnavailable,

    /// Disk, encryption, or schema failure in the durable stores.
    /// Writes swallow this (logged); reads surface empty.
    #[error("persistence error")]
    Persistence(String),

    /// The send queue for a peer is saturated.
    #[error("send queue saturated")]
    Backpressure,

    /// The engine is shutting down; no further sends are accepted.
    #[error("shutting down")]
    ShuttingDown,

    /// Cryptographic operation failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),
}

/// Result type alias using BitChat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error should cause a silent drop on the inbound
    /// path. Malformed or undecryptable inbound data is logged and
    /// discarded, never surfaced.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Encoding(_) | Error::Crypto(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
