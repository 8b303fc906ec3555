//! Server-specific error types.

use thiserror::Error;

/// Errors from the acceptor lifecycle.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be created.
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        /// Requested listen address.
        addr: String,
        /// Underlying I/O failure.
        reason: String,
    },

    /// A connection-level failure bubbled up from the engine.
    #[error(transparent)]
    Rpc(#[from] wirecall_core::RpcError),
}
