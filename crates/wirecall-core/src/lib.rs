//! Wirecall connection engine and call dispatcher.
//!
//! This crate turns the I/O-free wire format of `wirecall-proto` into live,
//! symmetric RPC connections. Either peer may invoke handlers exposed by the
//! other, and calls nest arbitrarily: a handler may call back into the peer
//! that invoked it while that peer is still waiting.
//!
//! # Architecture
//!
//! - [`Connection`]: one reader task per TCP connection feeds a packet
//!   builder; a transmit mutex serializes writes. Inbound `FunctionCall`s
//!   either spawn a worker task (auto-executing connections, the accepted
//!   side) or land in the inbox where a waiting caller executes them inline
//!   (the reentrant path).
//! - [`CorrelationManager`]: the `(function_id, global_id)` bookkeeping that
//!   pairs responses with requests across nested calls. Both peers mirror
//!   every update, so their stacks stay identical.
//! - [`HandlerRegistry`]: named async handlers; a handler receives a
//!   [`CallContext`] carrying the connection, so it can call back.
//! - [`Connector`]: thin per-connection facade with the `remote()` call
//!   namespace; client/server crates build their registries on top.
//! - The optional crypto engine (`wirecall-crypto`) is wired in by the
//!   handshake driver: two reserved correlation slots, an RSA-OAEP key
//!   exchange, then every byte in both directions travels inside Fernet
//!   envelopes.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
mod connector;
mod correlation;
mod dispatch;
mod engine;
mod error;
mod file;
mod handler;
pub(crate) mod handshake;

pub use connector::{Connector, Remote};
pub use correlation::{CorrelationManager, CorrelationMismatch};
pub use dispatch::CallResult;
pub use engine::{Connection, ConnectionOptions, Origin};
pub use error::{Result, RpcError};
pub use file::{FileSentinel, ReceivedFile};
pub use handler::{
    CallContext, HandlerError, HandlerRegistry, HandlerValue, RemoteCallable,
    current_connection_id,
};
pub use wirecall_proto::{Value, value};
