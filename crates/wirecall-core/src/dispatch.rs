//! Call dispatch: outbound calls, response matching, reentrant execution.
//!
//! An outbound call sends a `FunctionCall` and then waits on the inbox.
//! While waiting, three things can surface:
//!
//! - a `FunctionCall` from the peer: a *reentrant* inbound call, executed
//!   inline on the waiting task and answered before waiting resumes — this
//!   is what lets mutually recursive calls terminate on one connection;
//! - the matching `DataReturn` or `FileMeta`: the call completes;
//! - a response for a different caller: parked for whoever owns it.
//!
//! Waiting polls the inbox on a fixed tick, honors the per-call timeout,
//! and aborts with `Cancelled` when the connection shuts down.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wirecall_proto::{
    DataReturn, FileMeta, FunctionCall, Packet, PacketBody, PacketKind, ProtocolError, Value,
};

use crate::{
    config::{CHUNK_SIZE, POLL_TICK},
    engine::{Connection, lock},
    error::{Result, RpcError},
    file::{FileSentinel, ReceivedFile},
    handler::{CURRENT_CONNECTION_ID, CallContext, HandlerError, HandlerValue},
};

/// Outcome of a completed call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    /// The handler returned a value.
    Value(Value),
    /// The handler returned a file, now saved locally.
    File(ReceivedFile),
}

impl CallResult {
    /// The returned value, if this was a plain return.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::File(_) => None,
        }
    }

    /// Consume into the returned value, if this was a plain return.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::File(_) => None,
        }
    }

    /// The received file, if the handler returned one.
    #[must_use]
    pub fn file(&self) -> Option<&ReceivedFile> {
        match self {
            Self::Value(_) => None,
            Self::File(file) => Some(file),
        }
    }

    /// Consume into the received file, if the handler returned one.
    #[must_use]
    pub fn into_file(self) -> Option<ReceivedFile> {
        match self {
            Self::Value(_) => None,
            Self::File(file) => Some(file),
        }
    }
}

impl Connection {
    /// Invoke `name` on the peer with positional arguments only.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` if the peer's handler raised.
    /// - `RpcError::Timeout` past the configured default timeout.
    /// - `RpcError::ConnectionLost` / `RpcError::Cancelled` on teardown.
    /// - Codec errors if an argument cannot be represented on the wire.
    pub async fn call(&self, name: &str, positional: Vec<Value>) -> Result<CallResult> {
        self.call_with(name, positional, BTreeMap::new(), self.inner.config.call_timeout).await
    }

    /// Invoke `name` with positional and named arguments and an explicit
    /// timeout (`None` waits indefinitely).
    ///
    /// # Errors
    ///
    /// - See [`Connection::call`].
    pub async fn call_with(
        &self,
        name: &str,
        positional: Vec<Value>,
        named: BTreeMap<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<CallResult> {
        if self.inner.is_shutdown() {
            return Err(RpcError::Cancelled);
        }
        if !self.inner.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let packet = Packet::function_call(name, positional, named);
        let ids = self.inner.send_packet(&packet).await?;
        tracing::debug!(
            connection = self.id(),
            function = name,
            function_id = ids.function_id,
            "call sent"
        );

        let response = self.wait_for_packet(ids.function_id, timeout).await?;
        match response.body {
            PacketBody::DataReturn(data) => {
                let value = data
                    .fields
                    .get(DataReturn::RETURN_FIELD)
                    .cloned()
                    .unwrap_or(Value::Null);
                match HandlerError::from_value(&value) {
                    Some(err) => {
                        tracing::debug!(
                            connection = self.id(),
                            function = name,
                            kind = %err.kind,
                            "remote handler raised"
                        );
                        Err(RpcError::Remote { kind: err.kind, message: err.message })
                    },
                    None => Ok(CallResult::Value(value)),
                }
            },
            PacketBody::FileMeta(meta) => Ok(CallResult::File(ReceivedFile::from_meta(&meta))),
            PacketBody::FunctionCall(_) => {
                unreachable!("wait_for_packet only yields responses")
            },
        }
    }

    /// Wait for the response carrying `call_fid`, executing reentrant
    /// inbound calls inline and parking responses that belong to other
    /// waiters.
    pub(crate) async fn wait_for_packet(
        &self,
        call_fid: i32,
        timeout: Option<Duration>,
    ) -> Result<Packet> {
        let started = Instant::now();
        loop {
            if let Some(parked) = lock(&self.inner.parked).remove(&call_fid) {
                return Ok(parked);
            }

            // Register interest before checking the inbox so a delivery in
            // between still wakes this task promptly.
            let notified = self.inner.inbox_notify.notified();

            match self.inner.pop_inbox() {
                Some(packet) => {
                    self.inner.apply_inbound(&packet);
                    match packet {
                        Packet { body: PacketBody::FunctionCall(call), .. } => {
                            execute_inbound(self.clone(), call).await?;
                        },
                        response => {
                            if response.ids.function_id == call_fid {
                                return Ok(response);
                            }
                            let owner = response.ids.function_id;
                            lock(&self.inner.parked).insert(owner, response);
                            self.inner.inbox_notify.notify_waiters();
                        },
                    }
                },
                None => {
                    if self.inner.is_shutdown() {
                        return Err(RpcError::Cancelled);
                    }
                    if !self.inner.is_connected() {
                        return Err(RpcError::ConnectionLost);
                    }

                    let tick = match timeout {
                        Some(limit) => {
                            let elapsed = started.elapsed();
                            if elapsed >= limit {
                                return Err(RpcError::Timeout { elapsed });
                            }
                            POLL_TICK.min(limit - elapsed)
                        },
                        None => POLL_TICK,
                    };
                    let _ = tokio::time::timeout(tick, notified).await;
                },
            }
        }
    }
}

/// Execute an inbound call and transmit its response.
///
/// Shared by the worker-task path (auto-executing connections) and the
/// inline reentrant path. Handler failures become the error surrogate; an
/// error from this function means the response could not be *sent* and the
/// connection is unusable.
pub(crate) async fn execute_inbound(conn: Connection, call: FunctionCall) -> Result<()> {
    let FunctionCall { name, positional, named } = call;

    let outcome = match conn.handlers().get(&name) {
        None => {
            tracing::debug!(connection = conn.id(), function = %name, "unknown remote function");
            Err(HandlerError::attribute_error(format!("no remote function named '{name}'")))
        },
        Some(handler) => {
            let ctx = CallContext::new(conn.clone(), positional, named);
            CURRENT_CONNECTION_ID.scope(conn.id(), handler.invoke(ctx)).await
        },
    };

    match outcome {
        Ok(HandlerValue::File(sentinel)) => send_file(&conn, sentinel).await,
        Ok(HandlerValue::Value(value)) => send_return(&conn, value).await,
        Err(err) => send_return(&conn, err.to_value()).await,
    }
}

/// Send a `DataReturn { return: value }`, degrading unserializable values
/// to a remote `TypeError` so the caller never hangs.
async fn send_return(conn: &Connection, value: Value) -> Result<()> {
    let packet = Packet::data_return(DataReturn::with_return(value));
    match conn.inner.send_packet(&packet).await {
        Ok(_) => Ok(()),
        Err(RpcError::Protocol(err @ ProtocolError::UnsupportedType(_))) => {
            let surrogate = HandlerError::type_error(format!("unserializable return value: {err}"));
            let fallback = Packet::data_return(DataReturn::with_return(surrogate.to_value()));
            conn.inner.send_packet(&fallback).await.map(|_| ())
        },
        Err(err) => Err(err),
    }
}

/// Transmit a file return: one `FileMeta` frame, then the body in
/// `2 * CHUNK_SIZE` reads, all under a single hold of the transmit mutex so
/// no other frame interleaves with the body.
async fn send_file(conn: &Connection, sentinel: FileSentinel) -> Result<()> {
    let inner = &conn.inner;
    let src_display = sentinel.src_path.display().to_string();

    // Stat and open before touching the wire; local filesystem problems are
    // the handler's failure, not the connection's.
    let size = match tokio::fs::metadata(&sentinel.src_path).await {
        Ok(meta) if meta.len() <= i32::MAX as u64 => meta.len(),
        Ok(meta) => {
            let err = HandlerError::new(
                "OSError",
                format!("{src_display} is {} bytes, exceeding the transfer limit", meta.len()),
            );
            return send_return(conn, err.to_value()).await;
        },
        Err(io_err) => {
            let err = HandlerError::new("OSError", format!("{src_display}: {io_err}"));
            return send_return(conn, err.to_value()).await;
        },
    };
    let mut file = match tokio::fs::File::open(&sentinel.src_path).await {
        Ok(file) => file,
        Err(io_err) => {
            let err = HandlerError::new("OSError", format!("{src_display}: {io_err}"));
            return send_return(conn, err.to_value()).await;
        },
    };

    let meta = FileMeta {
        src_path: src_display.clone(),
        dst_path: sentinel.dst_path.as_ref().map(|p| p.display().to_string()),
        size: size as i32,
    };
    let payload = Packet::file_meta(meta).encode_payload()?;

    let mut guard = inner.writer.lock().await;
    let writer = guard.as_mut().ok_or(RpcError::NotConnected)?;
    let (ids, wire) = inner.assemble(PacketKind::FileMeta, &payload);
    writer.write_all(&wire).await.map_err(|_| {
        inner.mark_disconnected();
        RpcError::ConnectionLost
    })?;

    let mut sent: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE * 2];
    while sent < size {
        let want = buf.len().min((size - sent) as usize);
        let read = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| RpcError::File(format!("read {src_display}: {e}")))?;
        if read == 0 {
            // The stream is now short of the announced byte count; the
            // connection cannot realign.
            return Err(RpcError::File(format!("{src_display} truncated during transfer")));
        }
        let body = inner.seal(&buf[..read]);
        writer.write_all(&body).await.map_err(|_| {
            inner.mark_disconnected();
            RpcError::ConnectionLost
        })?;
        sent += read as u64;
    }

    tracing::debug!(
        connection = conn.id(),
        function_id = ids.function_id,
        path = %src_display,
        size,
        "file sent"
    );
    Ok(())
}
