//! Handler registry and invocation context.
//!
//! Handlers are named async callables. A connection configured for
//! auto-execution runs each inbound call on a fresh worker task; the
//! reentrant path runs them inline on the task that is waiting for a
//! response. Either way the handler receives a [`CallContext`] carrying the
//! connection it arrived on, so it can call straight back into its caller.
//!
//! Handler failures never travel as panics: they become a serializable
//! error surrogate (a reserved JSON shape in the `return` field) that the
//! remote dispatcher re-raises as [`crate::RpcError::Remote`].

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use wirecall_proto::Value;

use crate::{engine::Connection, file::FileSentinel};

tokio::task_local! {
    /// Connection id owning the handler execution on this task.
    pub(crate) static CURRENT_CONNECTION_ID: i32;
}

/// Connection id of the handler execution the current task belongs to.
///
/// `None` outside handler execution. Used by the server acceptor's
/// `get_current` to resolve which peer invoked the running handler.
#[must_use]
pub fn current_connection_id() -> Option<i32> {
    CURRENT_CONNECTION_ID.try_with(|id| *id).ok()
}

/// Reserved field marking an error surrogate inside a `return` map.
const ERROR_KEY: &str = "__error__";

/// A failure produced by a handler, serializable across the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Exception class: `TypeError`, `AttributeError`, or user-defined.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl HandlerError {
    /// Build an error with an arbitrary kind.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    /// Wrong argument count or argument type.
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Unknown handler name.
    #[must_use]
    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    /// Encode as the wire surrogate carried in a `return` field.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut inner = BTreeMap::new();
        inner.insert("kind".to_string(), Value::Str(self.kind.clone()));
        inner.insert("message".to_string(), Value::Str(self.message.clone()));
        let mut outer = BTreeMap::new();
        outer.insert(ERROR_KEY.to_string(), Value::Map(inner));
        Value::Map(outer)
    }

    /// Decode the wire surrogate, if `value` is one.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let outer = value.as_map()?;
        if outer.len() != 1 {
            return None;
        }
        let inner = outer.get(ERROR_KEY)?.as_map()?;
        Some(Self {
            kind: inner.get("kind")?.as_str()?.to_string(),
            message: inner.get("message")?.as_str()?.to_string(),
        })
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What a handler hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerValue {
    /// An ordinary value, sent as a `DataReturn`.
    Value(Value),
    /// A file, sent via the `FileMeta`-plus-body sub-protocol.
    File(FileSentinel),
}

impl From<Value> for HandlerValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<FileSentinel> for HandlerValue {
    fn from(sentinel: FileSentinel) -> Self {
        Self::File(sentinel)
    }
}

/// Arguments and connection context handed to a handler.
pub struct CallContext {
    connection: Connection,
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl CallContext {
    pub(crate) fn new(
        connection: Connection,
        positional: Vec<Value>,
        named: BTreeMap<String, Value>,
    ) -> Self {
        Self { connection, positional, named }
    }

    /// The connection the call arrived on; handlers use it to call back.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Positional arguments in order.
    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Named arguments.
    #[must_use]
    pub fn named(&self) -> &BTreeMap<String, Value> {
        &self.named
    }

    /// Positional argument `index`.
    ///
    /// # Errors
    ///
    /// - `TypeError` surrogate if the argument is missing.
    pub fn arg(&self, index: usize) -> Result<&Value, HandlerError> {
        self.positional.get(index).ok_or_else(|| {
            HandlerError::type_error(format!(
                "missing positional argument {index} (got {})",
                self.positional.len()
            ))
        })
    }

    /// Positional argument `index` as an integer.
    ///
    /// # Errors
    ///
    /// - `TypeError` surrogate if missing or of another kind.
    pub fn int_arg(&self, index: usize) -> Result<i32, HandlerError> {
        let value = self.arg(index)?;
        value.as_int().ok_or_else(|| {
            HandlerError::type_error(format!(
                "argument {index} must be an int, got {}",
                value.kind_name()
            ))
        })
    }

    /// Positional argument `index` as a string slice.
    ///
    /// # Errors
    ///
    /// - `TypeError` surrogate if missing or of another kind.
    pub fn str_arg(&self, index: usize) -> Result<&str, HandlerError> {
        let value = self.arg(index)?;
        value.as_str().ok_or_else(|| {
            HandlerError::type_error(format!(
                "argument {index} must be a string, got {}",
                value.kind_name()
            ))
        })
    }
}

/// A named procedure callable by the remote peer.
#[async_trait]
pub trait RemoteCallable: Send + Sync {
    /// Execute the call.
    async fn invoke(&self, ctx: CallContext) -> Result<HandlerValue, HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RemoteCallable for FnHandler<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerValue, HandlerError>> + Send,
{
    async fn invoke(&self, ctx: CallContext) -> Result<HandlerValue, HandlerError> {
        (self.f)(ctx).await
    }
}

/// Table of local procedures exposed to the peer.
///
/// Resolution is exact string match; an unknown name is reported to the
/// caller as an `AttributeError`-kind remote error.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn RemoteCallable>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a boxed handler under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn RemoteCallable>) {
        lock_handlers(&self.handlers).insert(name.into(), handler);
    }

    /// Register an async closure under `name`.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerValue, HandlerError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { f }));
    }

    /// Look up a handler by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn RemoteCallable>> {
        lock_handlers(&self.handlers).get(name).cloned()
    }

    /// Registered handler names, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        lock_handlers(&self.handlers).keys().cloned().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("names", &self.names()).finish()
    }
}

fn lock_handlers(
    m: &Mutex<HashMap<String, Arc<dyn RemoteCallable>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn RemoteCallable>>> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
