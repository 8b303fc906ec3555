//! Per-connection I/O engine.
//!
//! One reader task per connection pulls `CHUNK_SIZE` reads off the socket,
//! feeds them through the (optional) envelope decryptor into the packet
//! builder, and routes complete packets: inbound calls on auto-executing
//! connections spawn worker tasks, file bodies are streamed to disk in-band,
//! everything else lands in the inbox for waiting callers.
//!
//! Writes from any task are serialized by the transmit mutex; correlation
//! ids are assigned under that mutex so ids hit the wire in assignment
//! order.
//!
//! # Invariants
//!
//! - Shutdown is idempotent and the on-close callback runs exactly once.
//! - During a file body no frames are parsed; the stream is non-reentrant
//!   until the byte count is satisfied.
//! - Once a session key is installed, every outbound byte is one Fernet
//!   envelope and every inbound byte is decrypted before parsing.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, Notify},
    task::JoinHandle,
};
use wirecall_crypto::SessionKey;
use wirecall_proto::{
    ByteStream, CorrelationIds, Packet, PacketBody, PacketBuilder, PacketHeader, PacketKind,
    ProtocolError,
};

use crate::{
    config::{CHUNK_SIZE, EngineConfig, RECONNECT_DELAY},
    correlation::CorrelationManager,
    dispatch,
    error::{Result, RpcError},
    file::temp_destination,
    handler::HandlerRegistry,
};

/// Lock a std mutex, recovering from poisoning.
///
/// State behind these mutexes stays consistent across panics (plain data,
/// no partial updates), so continuing with the inner value is safe.
pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether a connection was dialed or accepted.
///
/// Controls the reconnect policy: only outbound connections re-dial their
/// peer after a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by a listening server.
    Inbound,
    /// Initiated by a connecting client.
    Outbound,
}

type OnClose = Box<dyn FnOnce(i32) + Send>;

/// Parameters for establishing a connection engine over a socket.
pub struct ConnectionOptions {
    /// Connection id (client range `0..30`, accepted range `30..`).
    pub id: i32,
    /// Dialed or accepted.
    pub origin: Origin,
    /// Engine configuration.
    pub config: EngineConfig,
    /// Local procedures the peer may invoke.
    pub handlers: Arc<HandlerRegistry>,
    on_close: Option<OnClose>,
}

impl ConnectionOptions {
    /// Options with no on-close callback.
    #[must_use]
    pub fn new(id: i32, origin: Origin, config: EngineConfig, handlers: Arc<HandlerRegistry>) -> Self {
        Self { id, origin, config, handlers, on_close: None }
    }

    /// Invoke `callback` with the connection id when the connection is torn
    /// down. Runs exactly once, however many times `close` is called.
    #[must_use]
    pub fn on_close(mut self, callback: impl FnOnce(i32) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Inner {
    pub(crate) id: i32,
    pub(crate) peer: SocketAddr,
    pub(crate) origin: Origin,
    pub(crate) config: EngineConfig,
    pub(crate) handlers: Arc<HandlerRegistry>,
    /// Transmit mutex; `None` once the socket is gone.
    pub(crate) writer: AsyncMutex<Option<OwnedWriteHalf>>,
    pub(crate) correlation: StdMutex<CorrelationManager>,
    inbox: StdMutex<VecDeque<Packet>>,
    /// Responses popped by a waiter they do not belong to.
    pub(crate) parked: StdMutex<HashMap<i32, Packet>>,
    pub(crate) inbox_notify: Notify,
    crypto: StdMutex<Option<SessionKey>>,
    connected: AtomicBool,
    shutdown: AtomicBool,
    closed: AtomicBool,
    on_close: StdMutex<Option<OnClose>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inbox_notify.notify_waiters();
    }

    fn install_session_key(&self, key: SessionKey) {
        *lock(&self.crypto) = Some(key);
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        lock(&self.crypto).is_some()
    }

    /// Envelope `plaintext` for the wire: a Fernet token behind a length
    /// prefix when encryption is active, the bytes themselves otherwise.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let key = lock(&self.crypto).clone();
        match key {
            Some(key) => {
                let token = key.encrypt(plaintext);
                let mut out = Vec::with_capacity(4 + token.len());
                out.extend_from_slice(&(token.len() as u32).to_be_bytes());
                out.extend_from_slice(&token);
                out
            },
            None => plaintext.to_vec(),
        }
    }

    /// Assign ids, frame, and seal a payload. Call under the transmit mutex
    /// so ids reach the wire in assignment order.
    pub(crate) fn assemble(&self, kind: PacketKind, payload: &[u8]) -> (CorrelationIds, Vec<u8>) {
        let ids = lock(&self.correlation).assign_outbound(kind);
        if ids.function_id == -1 {
            tracing::warn!(connection = self.id, ?kind, "response assigned with no call outstanding");
        }
        let header = PacketHeader::new(ids, kind, payload.len() as u32);
        let mut frame = Vec::with_capacity(PacketHeader::SIZE + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        (ids, self.seal(&frame))
    }

    /// Serialize and transmit one packet.
    pub(crate) async fn send_packet(&self, packet: &Packet) -> Result<CorrelationIds> {
        let payload = packet.encode_payload()?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RpcError::NotConnected)?;
        let (ids, wire) = self.assemble(packet.kind(), &payload);

        if let Err(err) = writer.write_all(&wire).await {
            tracing::warn!(connection = self.id, error = %err, "write failed");
            self.mark_disconnected();
            return Err(RpcError::ConnectionLost);
        }
        tracing::trace!(
            connection = self.id,
            function_id = ids.function_id,
            global_id = ids.global_id,
            kind = ?packet.kind(),
            "sent packet"
        );
        Ok(ids)
    }

    /// Queue a packet for waiting callers.
    fn deliver(&self, packet: Packet) {
        lock(&self.inbox).push_back(packet);
        self.inbox_notify.notify_waiters();
    }

    pub(crate) fn pop_inbox(&self) -> Option<Packet> {
        lock(&self.inbox).pop_front()
    }

    /// Mirror the correlation update of a received packet, logging any
    /// divergence from the local prediction.
    pub(crate) fn apply_inbound(&self, packet: &Packet) {
        let mismatches = lock(&self.correlation).apply_inbound(packet.kind(), packet.ids);
        for mismatch in mismatches {
            tracing::warn!(connection = self.id, ?mismatch, "correlation anomaly");
        }
    }

    /// Tear down shared state. Returns quietly when already done; the
    /// on-close callback fires on the first invocation only.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.inbox).clear();
        lock(&self.parked).clear();
        self.inbox_notify.notify_waiters();

        let callback = lock(&self.on_close).take();
        if let Some(callback) = callback {
            callback(self.id);
        }
        tracing::info!(connection = self.id, peer = %self.peer, "connection closed");
    }

    fn should_reconnect(&self) -> bool {
        self.origin == Origin::Outbound
            && self.config.auto_reconnect
            && !self.config.encrypted
            && !self.is_shutdown()
    }
}

/// Handle to a live connection.
///
/// Clones share the same engine; the connection dies when [`Connection::close`]
/// is called or the reader terminates, not when handles drop.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("origin", &self.inner.origin)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Take ownership of a connected socket and start the reader task.
    ///
    /// Must run inside a tokio runtime. Encrypted configurations still need
    /// the key exchange before application traffic:
    /// [`Connection::exchange_keys_as_initiator`] on the dialing side,
    /// [`Connection::exchange_keys_as_acceptor`] on the accepting side.
    ///
    /// # Errors
    ///
    /// - `RpcError::NotConnected` if the socket has no peer address.
    pub fn establish(stream: TcpStream, options: ConnectionOptions) -> Result<Self> {
        let peer = stream.peer_addr().map_err(|_| RpcError::NotConnected)?;
        let (read_half, write_half) = stream.into_split();

        let inner = Arc::new(Inner {
            id: options.id,
            peer,
            origin: options.origin,
            config: options.config,
            handlers: options.handlers,
            writer: AsyncMutex::new(Some(write_half)),
            correlation: StdMutex::new(CorrelationManager::new()),
            inbox: StdMutex::new(VecDeque::new()),
            parked: StdMutex::new(HashMap::new()),
            inbox_notify: Notify::new(),
            crypto: StdMutex::new(None),
            connected: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            on_close: StdMutex::new(options.on_close),
            reader: StdMutex::new(None),
        });

        let handle = tokio::spawn(reader_loop(inner.clone(), read_half));
        *lock(&inner.reader) = Some(handle);

        tracing::debug!(connection = inner.id, peer = %peer, origin = ?inner.origin, "connection established");
        Ok(Self { inner })
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.inner.id
    }

    /// Peer socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Dialed or accepted.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    /// Whether the socket is currently usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected() && !self.inner.is_shutdown()
    }

    /// Whether the session key is installed and traffic is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.inner.is_encrypted()
    }

    /// Number of calls currently in flight on this connection.
    #[must_use]
    pub fn call_stack_depth(&self) -> usize {
        lock(&self.inner.correlation).depth()
    }

    /// `(next_function_id, next_global_id)` of the correlation manager.
    #[must_use]
    pub fn next_ids(&self) -> (i32, i32) {
        let ids = lock(&self.inner.correlation);
        (ids.next_function_id(), ids.next_global_id())
    }

    /// Local handler registry serving the peer's calls.
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    pub(crate) fn install_session_key(&self, key: SessionKey) {
        self.inner.install_session_key(key);
    }

    /// Shut the connection down.
    ///
    /// Idempotent: the socket closes, every waiter wakes with `Cancelled`,
    /// correlation and inbox state is dropped, and the on-close callback
    /// runs exactly once.
    pub async fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.mark_disconnected();

        let reader = lock(&self.inner.reader).take();
        if let Some(handle) = reader {
            handle.abort();
        }

        self.inner.writer.lock().await.take();
        self.inner.teardown();
    }
}

/// Length-prefixed Fernet envelope reassembly for encrypted streams.
#[derive(Debug, Default)]
struct EnvelopeReader {
    stream: ByteStream,
}

/// Upper bound on one envelope: a full-size frame as base64 plus slack.
const MAX_ENVELOPE: usize = 32 * 1024 * 1024;

impl EnvelopeReader {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, chunk: &[u8]) {
        self.stream.append(chunk);
    }

    /// Next complete token, or `None` until more bytes arrive.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` for an absurd length prefix; the
    ///   stream cannot be trusted afterwards.
    fn next_token(&mut self) -> Result<Option<Vec<u8>>> {
        if self.stream.remaining() < 4 {
            return Ok(None);
        }
        let len = self.stream.next_uint(4)? as usize;
        if len > MAX_ENVELOPE {
            return Err(RpcError::Protocol(ProtocolError::PayloadTooLarge {
                size: len,
                max: MAX_ENVELOPE,
            }));
        }
        if self.stream.remaining() < len {
            self.stream.rewind();
            return Ok(None);
        }
        let token = self.stream.next_bytes(len)?.to_vec();
        self.stream.trim_consumed();
        Ok(Some(token))
    }
}

/// Decrypt (if active) and buffer a received chunk.
fn ingest(
    inner: &Inner,
    builder: &mut PacketBuilder,
    envelopes: &mut EnvelopeReader,
    chunk: &[u8],
) -> Result<()> {
    let key = lock(&inner.crypto).clone();
    if let Some(key) = key {
        envelopes.push(chunk);
        while let Some(token) = envelopes.next_token()? {
            let plaintext = key.decrypt(&token)?;
            builder.push(&plaintext);
        }
    } else {
        builder.push(chunk);
    }
    Ok(())
}

async fn reader_loop(inner: Arc<Inner>, mut read: OwnedReadHalf) {
    let mut builder = PacketBuilder::new();
    let mut envelopes = EnvelopeReader::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        if inner.is_shutdown() {
            break;
        }

        let received = match read.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                if !inner.is_shutdown() {
                    tracing::debug!(connection = inner.id, error = %err, "socket read failed");
                }
                0
            },
        };

        if received == 0 {
            inner.mark_disconnected();
            if inner.should_reconnect() {
                tracing::info!(connection = inner.id, peer = %inner.peer, "connection dropped, reconnecting");
                match reconnect(&inner).await {
                    Some(new_read) => {
                        read = new_read;
                        builder = PacketBuilder::new();
                        envelopes = EnvelopeReader::new();
                        continue;
                    },
                    None => break,
                }
            }
            break;
        }

        if let Err(err) =
            process_chunk(&inner, &mut builder, &mut envelopes, &mut read, &buf[..received]).await
        {
            if !inner.is_shutdown() {
                tracing::error!(connection = inner.id, error = %err, "terminating connection");
            }
            break;
        }
    }

    inner.mark_disconnected();
    inner.writer.lock().await.take();
    inner.teardown();
}

/// Re-dial the peer with a fixed backoff until it answers or shutdown.
async fn reconnect(inner: &Arc<Inner>) -> Option<OwnedReadHalf> {
    loop {
        if inner.is_shutdown() {
            return None;
        }
        match TcpStream::connect(inner.peer).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                *inner.writer.lock().await = Some(write_half);
                inner.connected.store(true, Ordering::SeqCst);
                tracing::info!(connection = inner.id, peer = %inner.peer, "reconnected");
                return Some(read_half);
            },
            Err(err) => {
                tracing::debug!(connection = inner.id, error = %err, "reconnect attempt failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
            },
        }
    }
}

async fn process_chunk(
    inner: &Arc<Inner>,
    builder: &mut PacketBuilder,
    envelopes: &mut EnvelopeReader,
    read: &mut OwnedReadHalf,
    chunk: &[u8],
) -> Result<()> {
    ingest(inner, builder, envelopes, chunk)?;

    loop {
        match builder.try_next() {
            Ok(Some(packet)) => {
                route_packet(inner, builder, envelopes, read, packet).await?;
            },
            Ok(None) => return Ok(()),
            Err(err) if err.is_recoverable() => {
                tracing::warn!(connection = inner.id, error = %err, "dropping malformed frame");
            },
            Err(err) => return Err(err.into()),
        }
    }
}

async fn route_packet(
    inner: &Arc<Inner>,
    builder: &mut PacketBuilder,
    envelopes: &mut EnvelopeReader,
    read: &mut OwnedReadHalf,
    mut packet: Packet,
) -> Result<()> {
    tracing::trace!(
        connection = inner.id,
        function_id = packet.ids.function_id,
        global_id = packet.ids.global_id,
        kind = ?packet.kind(),
        "received packet"
    );

    if matches!(packet.body, PacketBody::FileMeta(_)) {
        receive_file(inner, builder, envelopes, read, &mut packet).await?;
        inner.deliver(packet);
        return Ok(());
    }

    if inner.config.auto_execute && matches!(packet.body, PacketBody::FunctionCall(_)) {
        inner.apply_inbound(&packet);
        if let PacketBody::FunctionCall(call) = packet.body {
            let conn = Connection { inner: inner.clone() };
            tokio::spawn(async move {
                if let Err(err) = dispatch::execute_inbound(conn.clone(), call).await {
                    tracing::error!(
                        connection = conn.id(),
                        error = %err,
                        "inbound handler could not respond"
                    );
                    conn.close().await;
                }
            });
        }
        return Ok(());
    }

    inner.deliver(packet);
    Ok(())
}

/// Stream the raw body following a `FileMeta` frame to its destination.
///
/// Runs on the reader task: no other frame is parsed until the byte count
/// is satisfied. Write errors and shutdown both terminate the connection,
/// because resuming mid-body would leave the stream misaligned.
async fn receive_file(
    inner: &Arc<Inner>,
    builder: &mut PacketBuilder,
    envelopes: &mut EnvelopeReader,
    read: &mut OwnedReadHalf,
    packet: &mut Packet,
) -> Result<()> {
    let PacketBody::FileMeta(meta) = &mut packet.body else {
        return Ok(());
    };

    let dst: PathBuf = meta.dst_path.as_ref().map_or_else(
        || temp_destination(inner.id, packet.ids.global_id, &meta.src_path),
        PathBuf::from,
    );

    let mut file = tokio::fs::File::create(&dst)
        .await
        .map_err(|e| RpcError::File(format!("create {}: {e}", dst.display())))?;

    let mut remaining = meta.size.max(0) as usize;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let chunk = builder.take_buffered(remaining);
        if !chunk.is_empty() {
            file.write_all(&chunk)
                .await
                .map_err(|e| RpcError::File(format!("write {}: {e}", dst.display())))?;
            remaining -= chunk.len();
            continue;
        }

        if inner.is_shutdown() {
            return Err(RpcError::Cancelled);
        }
        let received = read.read(&mut buf).await.map_err(|_| RpcError::ConnectionLost)?;
        if received == 0 {
            inner.mark_disconnected();
            return Err(RpcError::ConnectionLost);
        }
        ingest(inner, builder, envelopes, &buf[..received])?;
    }

    file.flush().await.map_err(|e| RpcError::File(e.to_string()))?;
    meta.dst_path = Some(dst.to_string_lossy().into_owned());
    tracing::debug!(
        connection = inner.id,
        path = %dst.display(),
        size = meta.size,
        "file body received"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_reader_reassembles_tokens() {
        let mut reader = EnvelopeReader::new();

        let mut wire = Vec::new();
        for token in [b"first".as_slice(), b"second-token".as_slice()] {
            wire.extend_from_slice(&(token.len() as u32).to_be_bytes());
            wire.extend_from_slice(token);
        }

        // Deliver in awkward splits.
        reader.push(&wire[..3]);
        assert_eq!(reader.next_token().unwrap(), None);
        reader.push(&wire[3..10]);
        assert_eq!(reader.next_token().unwrap(), Some(b"first".to_vec()));
        reader.push(&wire[10..]);
        assert_eq!(reader.next_token().unwrap(), Some(b"second-token".to_vec()));
        assert_eq!(reader.next_token().unwrap(), None);
    }

    #[test]
    fn envelope_reader_rejects_absurd_length() {
        let mut reader = EnvelopeReader::new();
        reader.push(&(u32::MAX).to_be_bytes());
        assert!(reader.next_token().is_err());
    }
}
