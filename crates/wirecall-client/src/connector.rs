//! A client connector: one endpoint, at most one live connection.

use std::{
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::net::TcpStream;
use wirecall_core::{
    Connection, Connector, Origin, RpcError,
    config::{EngineConfig, RECONNECT_DELAY},
};

use crate::registry::SharedHandlers;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named or keyed client endpoint.
///
/// Holds at most one active connection. `connect` on an already connected
/// endpoint is a no-op; `close` tears the connection down and leaves the
/// connector reusable.
#[derive(Debug)]
pub struct ClientConnector {
    id: i32,
    config: EngineConfig,
    handlers: SharedHandlers,
    active: Mutex<Option<Connector>>,
}

impl ClientConnector {
    pub(crate) fn new(id: i32, config: EngineConfig, handlers: SharedHandlers) -> Self {
        Self { id, config, handlers, active: Mutex::new(None) }
    }

    /// Connector id within the client range.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Whether a usable connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.active).as_ref().is_some_and(Connector::is_connected)
    }

    /// Establish the connection, retrying refused attempts with a fixed
    /// backoff until `timeout` elapses (`None` retries indefinitely).
    ///
    /// No-op when already connected. On encrypted configurations the key
    /// exchange completes before this returns.
    ///
    /// # Errors
    ///
    /// - `RpcError::ConnectionRefused` when the deadline passes without a
    ///   successful dial.
    /// - `RpcError::Handshake` if the key exchange fails.
    pub async fn connect(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<(), RpcError> {
        if self.is_connected() {
            return Ok(());
        }

        let stream = dial_with_retry(addr, timeout).await?;
        let options = wirecall_core::ConnectionOptions::new(
            self.id,
            Origin::Outbound,
            self.config.clone(),
            self.handlers.clone(),
        );
        let connection = Connection::establish(stream, options)?;

        if self.config.encrypted {
            if let Err(err) = connection.exchange_keys_as_initiator().await {
                tracing::warn!(connector = self.id, error = %err, "key exchange failed");
                connection.close().await;
                return Err(err);
            }
        }

        // A concurrent connect may have won the race while we dialed; one
        // endpoint never holds two connections.
        let superseded = {
            let mut active = lock(&self.active);
            if active.as_ref().is_some_and(Connector::is_connected) {
                Some(connection)
            } else {
                *active = Some(Connector::new(connection));
                None
            }
        };
        if let Some(duplicate) = superseded {
            duplicate.close().await;
            return Ok(());
        }

        tracing::info!(connector = self.id, %addr, "connected");
        Ok(())
    }

    /// Spawn [`ClientConnector::connect`] in the background and return
    /// immediately; check [`ClientConnector::is_connected`] for progress.
    pub fn connect_background(self: &std::sync::Arc<Self>, addr: SocketAddr) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.connect(addr, None).await {
                tracing::warn!(connector = this.id, %addr, error = %err, "background connect failed");
            }
        });
    }

    /// The active connector facade.
    ///
    /// # Errors
    ///
    /// - `RpcError::NotConnected` when no connection is established.
    pub fn connector(&self) -> Result<Connector, RpcError> {
        lock(&self.active).clone().ok_or(RpcError::NotConnected)
    }

    /// The active connection.
    ///
    /// # Errors
    ///
    /// - `RpcError::NotConnected` when no connection is established.
    pub fn connection(&self) -> Result<Connection, RpcError> {
        self.connector().map(|c| c.connection().clone())
    }

    /// Shut down the active connection, if any. Idempotent.
    pub async fn close(&self) {
        let active = lock(&self.active).take();
        if let Some(connector) = active {
            connector.close().await;
        }
    }
}

/// Dial `addr`, retrying with the fixed backoff until the deadline.
async fn dial_with_retry(
    addr: SocketAddr,
    timeout: Option<Duration>,
) -> Result<TcpStream, RpcError> {
    let started = Instant::now();
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::warn!(%addr, error = %err, "connect attempt failed");
                if let Some(limit) = timeout {
                    if started.elapsed() + RECONNECT_DELAY >= limit {
                        return Err(RpcError::ConnectionRefused { addr: addr.to_string() });
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            },
        }
    }
}
