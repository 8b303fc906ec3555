//! Error types for live connections and calls.

use std::time::Duration;

use thiserror::Error;
use wirecall_proto::ProtocolError;
use wirecall_crypto::CryptoError;

/// Result alias for connection and call operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors surfaced to callers of the RPC layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The peer closed or reset the connection.
    #[error("connection lost")]
    ConnectionLost,

    /// The connect target stayed unreachable until the deadline.
    #[error("connection refused by {addr}")]
    ConnectionRefused {
        /// Address that refused the connection.
        addr: String,
    },

    /// No connection is currently established.
    #[error("not connected")]
    NotConnected,

    /// A call outlived its caller-supplied deadline.
    #[error("call timed out after {elapsed:?}")]
    Timeout {
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// Shutdown was signalled while waiting.
    #[error("cancelled by connection shutdown")]
    Cancelled,

    /// Wire-format error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer's handler raised; re-raised here in the caller's context.
    #[error("remote {kind}: {message}")]
    Remote {
        /// Exception class reported by the peer (`TypeError`,
        /// `AttributeError`, or user-defined).
        kind: String,
        /// Message reported by the peer.
        message: String,
    },

    /// Key exchange or bulk decryption failed.
    #[error("handshake failure: {0}")]
    Handshake(String),

    /// A file transfer could not be completed.
    #[error("file transfer failed: {0}")]
    File(String),
}

impl From<CryptoError> for RpcError {
    fn from(err: CryptoError) -> Self {
        Self::Handshake(err.to_string())
    }
}

impl RpcError {
    /// Whether this error may succeed on retry over a fresh connection.
    ///
    /// Protocol violations and remote exceptions are deterministic; timeouts
    /// and connection failures are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::ConnectionRefused { .. }
                | Self::NotConnected
                | Self::Timeout { .. }
                | Self::Cancelled
        )
    }
}
