//! Client side of the Wirecall RPC protocol.
//!
//! Two flavors of connector, both interned in a [`ConnectorRegistry`]:
//!
//! - **Single connectors**, looked up by endpoint name: a process-wide
//!   named endpoint with at most one active connection at a time.
//! - **Keyed-multi connectors**, looked up by small integer key:
//!   `multi(k)` returns the same instance for the same key, so independent
//!   parts of a process can share connections without passing handles
//!   around.
//!
//! Client-initiated connector ids live in the range `0..30`; connections a
//! server accepts are numbered from 30 upward, so the two id populations
//! never collide.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod connector;
mod registry;

pub use connector::ClientConnector;
pub use registry::{ClientError, ConnectorRegistry, MULTI_KEY_LIMIT};
pub use wirecall_core::{
    CallResult, Connection, Connector, HandlerRegistry, Remote, RpcError, Value,
    config::EngineConfig,
};
