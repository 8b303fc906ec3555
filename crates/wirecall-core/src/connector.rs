//! Per-connection facade.
//!
//! A [`Connector`] pairs a live [`Connection`] with the `remote()` call
//! namespace. The client crate interns connectors by endpoint name or
//! integer key; the server acceptor creates one per accepted peer. Both
//! hand out this type, so application code looks the same on either side of
//! the wire.

use std::{collections::BTreeMap, time::Duration};

use wirecall_proto::Value;

use crate::{
    dispatch::CallResult,
    engine::Connection,
    error::Result,
};

/// A connected peer and the namespace for calling into it.
#[derive(Debug, Clone)]
pub struct Connector {
    connection: Connection,
}

impl Connector {
    /// Wrap an established connection.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.connection.id()
    }

    /// Whether the connection is currently usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Namespace for invoking the peer's procedures.
    #[must_use]
    pub fn remote(&self) -> Remote<'_> {
        Remote { connection: &self.connection, timeout: None }
    }

    /// Shut the connection down (idempotent).
    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// Call namespace of a connector.
///
/// Each call travels as a `FunctionCall` frame and blocks until the
/// matching response arrives, executing reentrant inbound calls in the
/// meantime.
#[derive(Debug, Clone, Copy)]
pub struct Remote<'a> {
    connection: &'a Connection,
    timeout: Option<Duration>,
}

impl Remote<'_> {
    /// Bound every call made through this handle by `limit`.
    #[must_use]
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Invoke `name` with positional arguments.
    ///
    /// # Errors
    ///
    /// - See [`Connection::call`].
    pub async fn call(&self, name: &str, positional: Vec<Value>) -> Result<CallResult> {
        self.call_kw(name, positional, BTreeMap::new()).await
    }

    /// Invoke `name` with positional and named arguments.
    ///
    /// # Errors
    ///
    /// - See [`Connection::call`].
    pub async fn call_kw(
        &self,
        name: &str,
        positional: Vec<Value>,
        named: BTreeMap<String, Value>,
    ) -> Result<CallResult> {
        let timeout = self.timeout.or(self.connection.inner.config.call_timeout);
        self.connection.call_with(name, positional, named, timeout).await
    }
}
