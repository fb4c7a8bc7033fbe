//! Common error types for Parley.

use thiserror::Error;

/// Result type alias using Parley's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No reply arrived within the call timeout
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote endpoint could not be reached
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Malformed or unexpected message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A handshake for this peer is already in progress
    #[error("duplicate operation: {0}")]
    DuplicateOperation(String),

    /// The peer declined the connection
    #[error("connection refused: {0}")]
    Refused(String),

    /// The peer is not in the `Connected` state
    #[error("not connected: {0}")]
    NotConnected(String),

    /// No pending request or record for this peer
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Payload exceeds the configured bound
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Illegal connection state transition
    #[error("invalid transition for {username}: {from} -> {to}")]
    InvalidTransition {
        username: String,
        from: String,
        to: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an unreachable error from any displayable type.
    pub fn unreachable(msg: impl std::fmt::Display) -> Self {
        Self::Unreachable(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a crypto error from any displayable type.
    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// True for failures that mean the remote listener is gone.
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
