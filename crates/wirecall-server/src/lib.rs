//! Server side of the Wirecall RPC protocol.
//!
//! The [`Acceptor`] listens on a TCP socket, wraps every accepted peer in a
//! per-connection [`wirecall_core::Connector`] sharing the server's handler
//! registry, and tracks the live peers in a table keyed by connection id
//! (the accepted range, 30 upward).
//!
//! Handlers run on per-call worker tasks; a handler that needs to call back
//! into *its own* caller uses the connection from its
//! [`wirecall_core::CallContext`], while [`Acceptor::get_current`] resolves
//! the connector owning the currently executing handler for code further
//! down the stack.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod acceptor;
mod error;

pub use acceptor::{Acceptor, AcceptorConfig};
pub use error::ServerError;
pub use wirecall_core::{
    CallContext, CallResult, Connection, Connector, FileSentinel, HandlerError, HandlerRegistry,
    HandlerValue, RpcError, Value,
};
