//! Interned connector registries.
//!
//! Explicit context object instead of process-wide singletons: create one
//! [`ConnectorRegistry`] per process (or per test) and thread it to the
//! code that needs connections. Lookups intern: the same name or key always
//! yields the same [`ClientConnector`] instance.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use wirecall_core::{HandlerRegistry, config::EngineConfig};

use crate::connector::ClientConnector;

pub(crate) type SharedHandlers = Arc<HandlerRegistry>;

/// Keyed-multi connector keys must be below this bound.
///
/// Keys map directly onto connector ids `0..16`; named single connectors
/// allocate ids `16..30`. Both stay inside the client id range, disjoint
/// from the server-side accepted range starting at 30.
pub const MULTI_KEY_LIMIT: i32 = 16;

/// First id handed to named single connectors.
const SINGLE_ID_START: i32 = 16;
/// One past the last single-connector id.
const SINGLE_ID_END: i32 = 30;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors specific to connector management.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// A keyed-multi key outside `0..MULTI_KEY_LIMIT`.
    #[error("multi connector key {key} outside 0..{MULTI_KEY_LIMIT}")]
    KeyOutOfRange {
        /// The rejected key.
        key: i32,
    },

    /// The single-connector id range is exhausted.
    #[error("no single-connector ids left (limit {limit})")]
    EndpointsExhausted {
        /// Maximum number of named endpoints.
        limit: i32,
    },
}

/// Process-wide table of client connectors.
#[derive(Debug)]
pub struct ConnectorRegistry {
    config: EngineConfig,
    single: Mutex<HashMap<String, Arc<ClientConnector>>>,
    multi: Mutex<HashMap<i32, Arc<ClientConnector>>>,
    next_single_id: Mutex<i32>,
}

impl ConnectorRegistry {
    /// Create a registry whose connectors share `config`.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            single: Mutex::new(HashMap::new()),
            multi: Mutex::new(HashMap::new()),
            next_single_id: Mutex::new(SINGLE_ID_START),
        }
    }

    /// Registry with the default outbound configuration (plaintext).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::outbound(false))
    }

    /// The named single connector for `name`, created on first use with
    /// `handlers` as its local function table.
    ///
    /// # Errors
    ///
    /// - `ClientError::EndpointsExhausted` when all single-connector ids
    ///   are taken.
    pub fn single(
        &self,
        name: &str,
        handlers: SharedHandlers,
    ) -> Result<Arc<ClientConnector>, ClientError> {
        let mut table = lock(&self.single);
        if let Some(existing) = table.get(name) {
            return Ok(existing.clone());
        }

        let id = {
            let mut next = lock(&self.next_single_id);
            if *next >= SINGLE_ID_END {
                return Err(ClientError::EndpointsExhausted {
                    limit: SINGLE_ID_END - SINGLE_ID_START,
                });
            }
            let id = *next;
            *next += 1;
            id
        };

        let connector = Arc::new(ClientConnector::new(id, self.config.clone(), handlers));
        table.insert(name.to_string(), connector.clone());
        tracing::debug!(endpoint = name, id, "registered single connector");
        Ok(connector)
    }

    /// The keyed-multi connector for `key`, created on first use.
    ///
    /// The same key always returns the same instance.
    ///
    /// # Errors
    ///
    /// - `ClientError::KeyOutOfRange` for keys outside `0..MULTI_KEY_LIMIT`.
    pub fn multi(
        &self,
        key: i32,
        handlers: SharedHandlers,
    ) -> Result<Arc<ClientConnector>, ClientError> {
        if !(0..MULTI_KEY_LIMIT).contains(&key) {
            return Err(ClientError::KeyOutOfRange { key });
        }

        let mut table = lock(&self.multi);
        if let Some(existing) = table.get(&key) {
            return Ok(existing.clone());
        }

        let connector = Arc::new(ClientConnector::new(key, self.config.clone(), handlers));
        table.insert(key, connector.clone());
        tracing::debug!(key, "registered multi connector");
        Ok(connector)
    }

    /// Close every connector in the registry. Connectors stay interned and
    /// can reconnect afterwards.
    pub async fn close_all(&self) {
        let connectors: Vec<Arc<ClientConnector>> = {
            let single = lock(&self.single);
            let multi = lock(&self.multi);
            single.values().chain(multi.values()).cloned().collect()
        };
        for connector in connectors {
            connector.close().await;
        }
    }
}
