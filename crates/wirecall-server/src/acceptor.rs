//! TCP acceptor and connected-peer table.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    time::Duration,
};

use tokio::{net::TcpListener, task::JoinHandle};
use wirecall_core::{
    Connection, ConnectionOptions, Connector, HandlerRegistry, Origin,
    config::{ACCEPTED_ID_OFFSET, EngineConfig},
    current_connection_id,
};

use crate::error::ServerError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Acceptor configuration.
#[derive(Debug, Clone, Default)]
pub struct AcceptorConfig {
    /// Require the key exchange on every accepted connection and encrypt
    /// all subsequent traffic.
    pub encrypted: bool,
    /// Default timeout applied to calls the server initiates.
    pub call_timeout: Option<Duration>,
}

/// Accepts connections and tracks the live peers.
///
/// Each accepted socket gets an id from the accepted range (30 upward), a
/// per-connection [`Connector`] sharing the acceptor's handler registry,
/// and an on-close hook that removes it from the table again, so the table
/// always reflects the peers that are actually connected.
pub struct Acceptor {
    local_addr: SocketAddr,
    handlers: Arc<HandlerRegistry>,
    config: AcceptorConfig,
    clients: Mutex<HashMap<i32, Connector>>,
    next_id: AtomicI32,
    shutdown: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Bind `addr` and start accepting.
    ///
    /// # Errors
    ///
    /// - `ServerError::Bind` if the listener cannot be created.
    pub async fn bind(
        addr: SocketAddr,
        handlers: Arc<HandlerRegistry>,
        config: AcceptorConfig,
    ) -> Result<Arc<Self>, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let acceptor = Arc::new(Self {
            local_addr,
            handlers,
            config,
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(ACCEPTED_ID_OFFSET),
            shutdown: AtomicBool::new(false),
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(accept_loop(acceptor.clone(), listener));
        *lock(&acceptor.accept_task) = Some(task);

        tracing::info!(addr = %local_addr, encrypted = acceptor.config.encrypted, "listening");
        Ok(acceptor)
    }

    /// Address the acceptor is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connector for a connected peer, by connection id.
    #[must_use]
    pub fn get(&self, id: i32) -> Option<Connector> {
        lock(&self.clients).get(&id).cloned()
    }

    /// Connector whose handler the calling task is currently executing.
    ///
    /// Resolves through the task-local connection id, so it works from
    /// anywhere beneath a handler invocation and returns `None` elsewhere.
    #[must_use]
    pub fn get_current(&self) -> Option<Connector> {
        current_connection_id().and_then(|id| self.get(id))
    }

    /// Number of currently connected peers.
    #[must_use]
    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Ids of the currently connected peers, unordered.
    #[must_use]
    pub fn client_ids(&self) -> Vec<i32> {
        lock(&self.clients).keys().copied().collect()
    }

    /// Stop listening and close every connected peer. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            task.abort();
        }

        let clients: Vec<Connector> = {
            let mut table = lock(&self.clients);
            table.drain().map(|(_, connector)| connector).collect()
        };
        for connector in clients {
            connector.close().await;
        }
        tracing::info!(addr = %self.local_addr, "acceptor stopped");
    }

    fn register(&self, connector: Connector) {
        if self.shutdown.load(Ordering::SeqCst) {
            let doomed = connector;
            tokio::spawn(async move { doomed.close().await });
            return;
        }
        lock(&self.clients).insert(connector.id(), connector);
    }

    fn remove(&self, id: i32) {
        if lock(&self.clients).remove(&id).is_some() {
            tracing::info!(connection = id, "peer removed");
        }
    }
}

async fn accept_loop(acceptor: Arc<Acceptor>, listener: TcpListener) {
    loop {
        if acceptor.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                if acceptor.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(error = %err, "accept failed");
                continue;
            },
        };

        let id = acceptor.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::info!(connection = id, %peer, "peer connected");

        let on_close = {
            let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
            move |closed_id: i32| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.remove(closed_id);
                }
            }
        };

        let options = ConnectionOptions::new(
            id,
            Origin::Inbound,
            EngineConfig {
                call_timeout: acceptor.config.call_timeout,
                ..EngineConfig::accepted(acceptor.config.encrypted)
            },
            acceptor.handlers.clone(),
        )
        .on_close(on_close);

        let connection = match Connection::establish(stream, options) {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(connection = id, error = %err, "failed to start engine");
                continue;
            },
        };

        // The key exchange can take a while (the peer generates an RSA key
        // pair); run it off the accept loop so other peers keep connecting.
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if acceptor.config.encrypted {
                if let Err(err) = connection.exchange_keys_as_acceptor().await {
                    tracing::warn!(connection = connection.id(), error = %err, "key exchange failed");
                    connection.close().await;
                    return;
                }
            }
            acceptor.register(Connector::new(connection));
        });
    }
}
