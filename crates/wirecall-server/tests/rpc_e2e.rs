//! End-to-end scenarios over real loopback connections: acceptor + client
//! registry + engines, plaintext and encrypted.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};
use wirecall_client::{ConnectorRegistry, EngineConfig};
use wirecall_core::config::ACCEPTED_ID_OFFSET;
use wirecall_server::{
    Acceptor, AcceptorConfig, CallContext, FileSentinel, HandlerError, HandlerRegistry,
    HandlerValue, RpcError, Value,
};

fn server_handlers() -> Arc<HandlerRegistry> {
    let handlers = HandlerRegistry::new();

    handlers.register_fn("add", |ctx: CallContext| async move {
        let a = ctx.int_arg(0)?;
        let b = ctx.int_arg(1)?;
        Ok(HandlerValue::Value(Value::Int(a + b)))
    });

    handlers.register_fn("raise_type_error", |_ctx: CallContext| async move {
        Err::<HandlerValue, _>(HandlerError::type_error("x"))
    });

    handlers.register_fn("greet", |ctx: CallContext| async move {
        let name = ctx.str_arg(0)?.to_string();
        // Call back into the peer that invoked us, while it waits.
        let echoed = ctx
            .connection()
            .call("echo", vec![Value::Str(name)])
            .await
            .map_err(|e| HandlerError::new("RuntimeError", e.to_string()))?;
        let Some(Value::Str(echoed)) = echoed.into_value() else {
            return Err(HandlerError::type_error("echo must return a string"));
        };
        Ok(HandlerValue::Value(Value::Str(format!("hi {echoed}"))))
    });

    handlers.register_fn("sleep_ms", |ctx: CallContext| async move {
        let ms = ctx.int_arg(0)?;
        tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)).await;
        Ok(HandlerValue::Value(Value::Int(ms)))
    });

    handlers
        .register_fn("stall", |_ctx: CallContext| async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(HandlerValue::Value(Value::Null))
        });

    Arc::new(handlers)
}

async fn start_server(encrypted: bool) -> Arc<Acceptor> {
    Acceptor::bind(
        "127.0.0.1:0".parse().unwrap(),
        server_handlers(),
        AcceptorConfig { encrypted, ..AcceptorConfig::default() },
    )
    .await
    .unwrap()
}

fn client_registry(encrypted: bool) -> ConnectorRegistry {
    ConnectorRegistry::new(EngineConfig {
        auto_reconnect: false,
        ..EngineConfig::outbound(encrypted)
    })
}

/// S1: `add(2, 3)` returns `5`.
#[tokio::test]
async fn add_two_numbers() {
    let server = start_server(false).await;
    let registry = client_registry(false);

    let client = registry.single("calc", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    let result = client
        .connector()
        .unwrap()
        .remote()
        .call("add", vec![Value::Int(2), Value::Int(3)])
        .await
        .unwrap();
    assert_eq!(result.into_value(), Some(Value::Int(5)));

    registry.close_all().await;
    server.shutdown().await;
}

/// S2: a handler raising `TypeError("x")` re-raises on the caller and the
/// connection survives.
#[tokio::test]
async fn remote_exception_re_raised() {
    let server = start_server(false).await;
    let registry = client_registry(false);

    let client = registry.single("calc", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();
    let connector = client.connector().unwrap();

    let err = connector.remote().call("raise_type_error", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote { kind, message } => {
            assert_eq!(kind, "TypeError");
            assert_eq!(message, "x");
        },
        other => panic!("expected remote TypeError, got {other:?}"),
    }

    assert!(connector.is_connected());
    let result = connector.remote().call("add", vec![Value::Int(1), Value::Int(2)]).await.unwrap();
    assert_eq!(result.into_value(), Some(Value::Int(3)));

    registry.close_all().await;
    server.shutdown().await;
}

/// S3: a server handler calls back into its caller; the correlation stack
/// reaches depth 2 inside the callback.
#[tokio::test]
async fn nested_callback_terminates() {
    let server = start_server(false).await;
    let registry = client_registry(false);

    let observed_depth = Arc::new(AtomicUsize::new(0));
    let depth_probe = observed_depth.clone();

    let client_handlers = HandlerRegistry::new();
    client_handlers.register_fn("echo", move |ctx: CallContext| {
        let depth_probe = depth_probe.clone();
        async move {
            depth_probe.store(ctx.connection().call_stack_depth(), Ordering::SeqCst);
            Ok(HandlerValue::Value(ctx.arg(0)?.clone()))
        }
    });

    let client = registry.single("calc", Arc::new(client_handlers)).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    let result =
        client.connector().unwrap().remote().call("greet", vec![Value::Str("Ana".into())]).await.unwrap();
    assert_eq!(result.into_value(), Some(Value::Str("hi Ana".into())));

    // greet outstanding + echo outstanding while the callback executes.
    assert_eq!(observed_depth.load(Ordering::SeqCst), 2);
    // Fully unwound afterwards.
    assert_eq!(client.connection().unwrap().call_stack_depth(), 0);

    registry.close_all().await;
    server.shutdown().await;
}

/// Two-level mutual recursion (A calls B calls A calls B) terminates with
/// the right values.
#[tokio::test]
async fn mutual_recursion_terminates() {
    let handlers = HandlerRegistry::new();
    handlers.register_fn("countdown", |ctx: CallContext| async move {
        let n = ctx.int_arg(0)?;
        if n <= 0 {
            return Ok(HandlerValue::Value(Value::Int(0)));
        }
        let below = ctx
            .connection()
            .call("countdown", vec![Value::Int(n - 1)])
            .await
            .map_err(|e| HandlerError::new("RuntimeError", e.to_string()))?;
        let Some(Value::Int(below)) = below.into_value() else {
            return Err(HandlerError::type_error("countdown must return an int"));
        };
        Ok(HandlerValue::Value(Value::Int(n + below)))
    });
    let server = Acceptor::bind(
        "127.0.0.1:0".parse().unwrap(),
        {
            let server_side = HandlerRegistry::new();
            server_side.register_fn("countdown", |ctx: CallContext| async move {
                let n = ctx.int_arg(0)?;
                if n <= 0 {
                    return Ok(HandlerValue::Value(Value::Int(0)));
                }
                let below = ctx
                    .connection()
                    .call("countdown", vec![Value::Int(n - 1)])
                    .await
                    .map_err(|e| HandlerError::new("RuntimeError", e.to_string()))?;
                let Some(Value::Int(below)) = below.into_value() else {
                    return Err(HandlerError::type_error("countdown must return an int"));
                };
                Ok(HandlerValue::Value(Value::Int(n + below)))
            });
            Arc::new(server_side)
        },
        AcceptorConfig::default(),
    )
    .await
    .unwrap();

    let registry = client_registry(false);
    let client = registry.single("recursive", Arc::new(handlers)).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    // 4 + 3 + 2 + 1 + 0, alternating sides on every level.
    let result =
        client.connector().unwrap().remote().call("countdown", vec![Value::Int(4)]).await.unwrap();
    assert_eq!(result.into_value(), Some(Value::Int(10)));

    registry.close_all().await;
    server.shutdown().await;
}

/// S4: a handler returns a file; the body streams to a temp path and the
/// digest matches the source exactly.
#[tokio::test]
async fn file_transfer_preserves_contents() {
    use rand::RngCore;

    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("payload.bin");

    // Deliberately not a multiple of the chunk size.
    let mut contents = vec![0u8; 3 * 4096 + 1234];
    rand::thread_rng().fill_bytes(&mut contents);
    std::fs::write(&src_path, &contents).unwrap();
    let expected_digest = hex::encode(Sha256::digest(&contents));

    let handlers = HandlerRegistry::new();
    let served = src_path.clone();
    handlers.register_fn("get_file", move |_ctx: CallContext| {
        let served = served.clone();
        async move { Ok(HandlerValue::File(FileSentinel::new(served))) }
    });
    let server = Acceptor::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(handlers),
        AcceptorConfig::default(),
    )
    .await
    .unwrap();

    let registry = client_registry(false);
    let client = registry.single("files", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    let result = client.connector().unwrap().remote().call("get_file", vec![]).await.unwrap();
    let received = result.into_file().expect("expected a file result");

    assert_eq!(received.size, contents.len() as u64);
    assert_ne!(received.path, src_path);
    let saved = std::fs::read(&received.path).unwrap();
    assert_eq!(hex::encode(Sha256::digest(&saved)), expected_digest);

    std::fs::remove_file(&received.path).ok();
    registry.close_all().await;
    server.shutdown().await;
}

/// S5 (scaled): many clients, many sequential calls each, all paired and
/// ordered with no dropped frames.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_clients_many_calls() {
    const CLIENTS: i32 = 10;
    const CALLS: i32 = 50;

    let server = start_server(false).await;
    let registry = Arc::new(client_registry(false));

    let mut tasks = Vec::new();
    for key in 0..CLIENTS {
        let registry = registry.clone();
        let addr = server.local_addr();
        tasks.push(tokio::spawn(async move {
            let client = registry.multi(key, Arc::new(HandlerRegistry::new())).unwrap();
            client.connect(addr, Some(Duration::from_secs(5))).await.unwrap();
            let connector = client.connector().unwrap();

            for i in 0..CALLS {
                let result = connector
                    .remote()
                    .call("add", vec![Value::Int(key), Value::Int(i)])
                    .await
                    .unwrap();
                assert_eq!(result.into_value(), Some(Value::Int(key + i)));
            }

            // Every call paired: nothing left outstanding, and the shared
            // global sequence advanced exactly two frames per call.
            let connection = client.connection().unwrap();
            assert_eq!(connection.call_stack_depth(), 0);
            assert_eq!(connection.next_ids().1, 2 * CALLS);
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(server.client_count(), CLIENTS as usize);
    registry.close_all().await;
    server.shutdown().await;
}

/// S6: killing the connection mid-call surfaces `ConnectionLost` to the
/// caller and the server forgets the peer within a second.
#[tokio::test]
async fn mid_call_disconnect_cleans_up() {
    let server = start_server(false).await;
    let registry = client_registry(false);

    let client = registry.single("doomed", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    // Wait for the acceptor to register the peer.
    let deadline = Instant::now() + Duration::from_secs(1);
    while server.client_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.client_count(), 1);

    let connection = client.connection().unwrap();
    let caller = connection.clone();
    let call = tokio::spawn(async move { caller.call("stall", vec![]).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Kill from the server side while the call is in flight.
    let id = server.client_ids()[0];
    assert!(id >= ACCEPTED_ID_OFFSET);
    server.get(id).unwrap().close().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(
        matches!(err, RpcError::ConnectionLost | RpcError::Cancelled),
        "unexpected error: {err:?}"
    );

    let deadline = Instant::now() + Duration::from_secs(1);
    while server.client_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.client_count(), 0, "peer state not removed within 1s");

    registry.close_all().await;
    server.shutdown().await;
}

/// Property 7: `timeout=T` raises within `T ± 0.3 s` when the handler
/// sleeps longer.
#[tokio::test]
async fn call_timeout_is_honored() {
    let server = start_server(false).await;
    let registry = client_registry(false);

    let client = registry.single("slow", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    let limit = Duration::from_millis(500);
    let started = Instant::now();
    let err = client
        .connector()
        .unwrap()
        .remote()
        .timeout(limit)
        .call("sleep_ms", vec![Value::Int(5_000)])
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, RpcError::Timeout { .. }), "unexpected error: {err:?}");
    assert!(waited >= limit, "returned early: {waited:?}");
    assert!(waited <= limit + Duration::from_millis(300), "returned late: {waited:?}");

    registry.close_all().await;
    server.shutdown().await;
}

/// Named arguments travel intact.
#[tokio::test]
async fn named_arguments_round_trip() {
    let handlers = HandlerRegistry::new();
    handlers.register_fn("describe", |ctx: CallContext| async move {
        let label = match ctx.named().get("label") {
            Some(Value::Str(label)) => label.clone(),
            _ => "unnamed".to_string(),
        };
        let count = ctx.int_arg(0)?;
        Ok(HandlerValue::Value(Value::Str(format!("{label}:{count}"))))
    });
    let server = Acceptor::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(handlers),
        AcceptorConfig::default(),
    )
    .await
    .unwrap();

    let registry = client_registry(false);
    let client = registry.single("kw", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    let mut named = BTreeMap::new();
    named.insert("label".to_string(), Value::Str("widgets".into()));
    let result = client
        .connector()
        .unwrap()
        .remote()
        .call_kw("describe", vec![Value::Int(7)], named)
        .await
        .unwrap();
    assert_eq!(result.into_value(), Some(Value::Str("widgets:7".into())));

    registry.close_all().await;
    server.shutdown().await;
}

/// `get_current` resolves the connector whose handler is executing, via the
/// task-local connection id.
#[tokio::test]
async fn get_current_resolves_calling_peer() {
    use std::sync::OnceLock;

    let slot: Arc<OnceLock<Arc<Acceptor>>> = Arc::new(OnceLock::new());

    let handlers = HandlerRegistry::new();
    let probe = slot.clone();
    handlers.register_fn("whoami", move |ctx: CallContext| {
        let probe = probe.clone();
        async move {
            let acceptor = probe
                .get()
                .cloned()
                .ok_or_else(|| HandlerError::new("RuntimeError", "acceptor not ready"))?;
            let current = acceptor
                .get_current()
                .ok_or_else(|| HandlerError::new("RuntimeError", "no current connection"))?;
            if current.id() != ctx.connection().id() {
                return Err(HandlerError::new("RuntimeError", "resolved the wrong peer"));
            }
            Ok(HandlerValue::Value(Value::Int(current.id())))
        }
    });

    let server = Acceptor::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(handlers),
        AcceptorConfig::default(),
    )
    .await
    .unwrap();
    slot.set(server.clone()).ok();

    let registry = client_registry(false);
    let client = registry.single("who", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(5))).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while server.client_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = client.connector().unwrap().remote().call("whoami", vec![]).await.unwrap();
    let Some(Value::Int(id)) = result.into_value() else { panic!("expected an id") };
    assert!(id >= ACCEPTED_ID_OFFSET);
    assert_eq!(server.client_ids(), vec![id]);

    // Outside any handler there is no current connection.
    assert!(server.get_current().is_none());

    registry.close_all().await;
    server.shutdown().await;
}

/// Encrypted S1: the handshake completes, traffic is encrypted, and calls
/// behave exactly as in plaintext.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypted_call_round_trip() {
    let server = start_server(true).await;
    let registry = client_registry(true);

    let client = registry.single("secure", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(30))).await.unwrap();

    let connection = client.connection().unwrap();
    assert!(connection.is_encrypted());
    // Two handshake slots consumed on the way in.
    assert_eq!(connection.next_ids().0, 2);

    let result = client
        .connector()
        .unwrap()
        .remote()
        .call("add", vec![Value::Int(20), Value::Int(22)])
        .await
        .unwrap();
    assert_eq!(result.into_value(), Some(Value::Int(42)));

    let err =
        client.connector().unwrap().remote().call("raise_type_error", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote { kind, .. } if kind == "TypeError"));

    registry.close_all().await;
    server.shutdown().await;
}

/// Encrypted file transfer: the body crosses the wire in Fernet envelopes
/// and still reassembles bit-exactly.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypted_file_transfer() {
    use rand::RngCore;

    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("secret.bin");
    let mut contents = vec![0u8; 2 * 4096 + 77];
    rand::thread_rng().fill_bytes(&mut contents);
    std::fs::write(&src_path, &contents).unwrap();

    let handlers = HandlerRegistry::new();
    let served = src_path.clone();
    handlers.register_fn("get_file", move |_ctx: CallContext| {
        let served = served.clone();
        async move { Ok(HandlerValue::File(FileSentinel::new(served))) }
    });
    let server = Acceptor::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(handlers),
        AcceptorConfig { encrypted: true, ..AcceptorConfig::default() },
    )
    .await
    .unwrap();

    let registry = client_registry(true);
    let client = registry.single("secure-files", Arc::new(HandlerRegistry::new())).unwrap();
    client.connect(server.local_addr(), Some(Duration::from_secs(30))).await.unwrap();

    let result = client.connector().unwrap().remote().call("get_file", vec![]).await.unwrap();
    let received = result.into_file().expect("expected a file result");
    let saved = std::fs::read(&received.path).unwrap();
    assert_eq!(saved, contents);

    std::fs::remove_file(&received.path).ok();
    registry.close_all().await;
    server.shutdown().await;
}
