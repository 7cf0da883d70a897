//! Error types for the relay transport.

use thiserror::Error;

/// Errors surfaced by the relay transport.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Destination string is malformed (bad scheme, non-opaque payload).
    #[error("invalid destination: {0}")]
    Destination(String),

    /// Token payload failed to decode or validate.
    #[error("invalid token: {0}")]
    Token(String),

    /// Service configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rendezvous map or rendezvous node is unavailable.
    #[error("rendezvous error: {0}")]
    Rendezvous(String),

    /// Wire-level failure: framing, encryption, oversized payloads.
    #[error("transport error: {0}")]
    Transport(String),

    /// A deadline or acknowledgement window expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The listener accept queue is full.
    #[error("relay listener overloaded")]
    Overloaded,

    /// Operation on a closed listener, connection, or client.
    #[error("connection closed")]
    Closed,

    /// Underlying network I/O failure.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Returns true if the error reports a closed listener or connection.
    pub fn is_closed(&self) -> bool {
        matches!(self, RelayError::Closed)
    }

    /// Returns true if the error reports an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Timeout(_))
    }
}

impl From<RelayError> for std::io::Error {
    fn from(err: RelayError) -> Self {
        use std::io::ErrorKind;
        match err {
            RelayError::Io(io) => io,
            RelayError::Timeout(msg) => {
                std::io::Error::new(ErrorKind::TimedOut, format!("timed out: {}", msg))
            }
            RelayError::Closed => {
                std::io::Error::new(ErrorKind::NotConnected, "connection closed")
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
