//! End-to-end RPC scenarios over the socket transport.
//!
//! Most scenarios run over Unix domain sockets with unique paths; one
//! covers TCP and one covers TCP with a self-signed TLS certificate.

use std::sync::Arc;
use std::time::Duration;

use wirecall::method::{Method, Shape};
use wirecall::rpc;
use wirecall::stream::{
    bidi_stream_handler, client_stream_handler, server_stream_handler, BidiStream,
    BidiStreamCtx, ClientStream, ClientStreamCtx, ServerStream, ServerStreamCtx,
};
use wirecall::transport::{Protocol, SocketTransport, Transport, TransportOptions};
use wirecall::{Error, Result};

#[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug, Clone)]
struct Value {
    v: i64,
}

/// Unique socket path per test run.
fn socket_path(tag: &str) -> String {
    format!(
        "/tmp/wirecall-{}-{}-{tag}.sock",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

fn unix_transport(path: &str) -> SocketTransport {
    SocketTransport::new(
        TransportOptions::new()
            .protocol(Protocol::Unix)
            .address(path),
    )
    .unwrap()
}

/// Register the full handler set used across scenarios.
fn register_test_service(server: &SocketTransport) {
    server.register_handler(
        Method::new("svc/echo", Shape::Unary),
        rpc::unary_handler(|req: Value| async move { Ok(req) }),
    );

    server.register_handler(
        Method::new("svc/fail", Shape::Unary),
        rpc::unary_handler(|_req: Value| async move {
            Err::<Value, _>(Error::Remote("intentional failure".into()))
        }),
    );

    server.register_handler(
        Method::new("svc/slow", Shape::Unary),
        rpc::unary_handler(|req: Value| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(req)
        }),
    );

    server.register_handler(
        Method::new("svc/panic", Shape::Unary),
        rpc::unary_handler::<Value, Value, _, _>(|_req| async move {
            panic!("handler exploded")
        }),
    );

    server.register_handler(
        Method::new("svc/stream", Shape::ServerStream),
        server_stream_handler(|req: Value, ctx: ServerStreamCtx<Value>| async move {
            for v in 1..=req.v {
                ctx.send(&Value { v }).await?;
            }
            Ok(())
        }),
    );

    server.register_handler(
        Method::new("svc/sum", Shape::ClientStream),
        client_stream_handler(|mut ctx: ClientStreamCtx<Value, Value>| async move {
            let mut total = 0;
            while let Some(value) = ctx.recv().await? {
                total += value.v;
            }
            ctx.send_and_close(&Value { v: total }).await
        }),
    );

    server.register_handler(
        Method::new("svc/incr", Shape::BidiStream),
        bidi_stream_handler(|mut ctx: BidiStreamCtx<Value, Value>| async move {
            while let Some(value) = ctx.recv().await? {
                ctx.send(&Value { v: value.v + 1 }).await?;
            }
            Ok(())
        }),
    );
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Start a served Unix transport and a client talking to it.
async fn unix_pair(tag: &str) -> (Arc<SocketTransport>, SocketTransport) {
    init_tracing();
    let path = socket_path(tag);
    let server = Arc::new(unix_transport(&path));
    register_test_service(&server);

    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = unix_transport(&path);
    (server, client)
}

#[tokio::test]
async fn unary_echo_over_unix() {
    let (_server, client) = unix_pair("unary").await;

    let res: Value = rpc::unary(&client, &Method::new("svc/echo", Shape::Unary), &Value { v: 42 })
        .await
        .unwrap();
    assert_eq!(res, Value { v: 42 });
}

#[tokio::test]
async fn unary_echo_over_tcp() {
    // Grab a free port, then serve on it.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap().to_string();
    drop(probe);

    let server =
        Arc::new(SocketTransport::new(TransportOptions::new().address(&addr)).unwrap());
    register_test_service(&server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SocketTransport::new(TransportOptions::new().address(&addr)).unwrap();
    let res: Value = rpc::unary(&client, &Method::new("svc/echo", Shape::Unary), &Value { v: 7 })
        .await
        .unwrap();
    assert_eq!(res, Value { v: 7 });
}

#[tokio::test]
async fn unary_echo_over_tls() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap().to_string();
    drop(probe);

    let server = Arc::new(
        SocketTransport::new(
            TransportOptions::new()
                .address(&addr)
                .self_signed_cert()
                .unwrap(),
        )
        .unwrap(),
    );
    register_test_service(&server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = SocketTransport::new(
        TransportOptions::new()
            .address(&addr)
            .self_signed_cert()
            .unwrap(),
    )
    .unwrap();

    let res: Value = rpc::unary(&client, &Method::new("svc/echo", Shape::Unary), &Value { v: 9 })
        .await
        .unwrap();
    assert_eq!(res, Value { v: 9 });
}

#[tokio::test]
async fn server_stream_delivers_then_ends() {
    let (_server, client) = unix_pair("sstream").await;

    let mut stream: ServerStream<Value> = ServerStream::connect(
        &client,
        &Method::new("svc/stream", Shape::ServerStream),
        &Value { v: 3 },
    )
    .await
    .unwrap();

    let mut seen = Vec::new();
    while let Some(value) = stream.recv().await.unwrap() {
        seen.push(value.v);
    }
    assert_eq!(seen, vec![1, 2, 3]);
    stream.close().await.unwrap();
}

#[tokio::test]
async fn client_stream_sums() {
    let (_server, client) = unix_pair("cstream").await;

    let stream: ClientStream<Value, Value> =
        ClientStream::connect(&client, &Method::new("svc/sum", Shape::ClientStream))
            .await
            .unwrap();
    for v in [1, 2, 3] {
        stream.send(&Value { v }).await.unwrap();
    }
    let total = stream.close_and_recv().await.unwrap();
    assert_eq!(total, Value { v: 6 });
    stream.close().await.unwrap();
}

#[tokio::test]
async fn bidi_stream_increments_then_eof() {
    let (_server, client) = unix_pair("bidi").await;

    let mut stream: BidiStream<Value, Value> =
        BidiStream::connect(&client, &Method::new("svc/incr", Shape::BidiStream))
            .await
            .unwrap();

    for v in [1, 2, 3] {
        stream.send(&Value { v }).await.unwrap();
        let reply = stream.recv().await.unwrap().unwrap();
        assert_eq!(reply.v, v + 1);
    }

    stream.close_send().await.unwrap();
    assert!(stream.recv().await.unwrap().is_none());
    stream.close().await.unwrap();
}

#[tokio::test]
async fn handler_error_reaches_caller() {
    let (_server, client) = unix_pair("fail").await;

    let err = rpc::unary::<_, Value>(
        &client,
        &Method::new("svc/fail", Shape::Unary),
        &Value { v: 1 },
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "intentional failure");
}

#[tokio::test]
async fn handler_panic_does_not_kill_transport() {
    let (_server, client) = unix_pair("panic").await;

    let err = rpc::unary::<_, Value>(
        &client,
        &Method::new("svc/panic", Shape::Unary),
        &Value { v: 1 },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("internal handler error"));

    // The transport keeps serving after the panic.
    let res: Value = rpc::unary(&client, &Method::new("svc/echo", Shape::Unary), &Value { v: 5 })
        .await
        .unwrap();
    assert_eq!(res, Value { v: 5 });
}

#[tokio::test]
async fn deadline_exceeded_then_fresh_invoke() {
    let (_server, client) = unix_pair("deadline").await;

    let method = Method::new("svc/slow", Shape::Unary);
    let err: Error = tokio::time::timeout(
        Duration::from_millis(100),
        rpc::unary::<_, Value>(&client, &method, &Value { v: 1 }),
    )
    .await
    .map_err(Error::from)
    .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));

    // The same transport issues a fresh call without reconnecting.
    let res: Value = rpc::unary(&client, &Method::new("svc/echo", Shape::Unary), &Value { v: 2 })
        .await
        .unwrap();
    assert_eq!(res, Value { v: 2 });
}

#[tokio::test]
async fn closed_call_latches_errors() {
    let (_server, client) = unix_pair("closed").await;

    let call = client
        .invoke(&Method::new("svc/incr", Shape::BidiStream))
        .await
        .unwrap();
    call.close().await.unwrap();

    assert!(call.send(bytes::Bytes::from_static(b"x")).await.is_err());
    assert!(call.recv().await.is_err());
    // Closing twice errors at most once.
    assert!(call.close().await.is_ok());
}

#[tokio::test]
async fn pre_cancelled_deadline_returns_immediately() {
    let (_server, client) = unix_pair("precancel").await;

    let started = std::time::Instant::now();
    let r: std::result::Result<Result<Value>, _> = tokio::time::timeout(
        Duration::ZERO,
        rpc::unary(&client, &Method::new("svc/slow", Shape::Unary), &Value { v: 1 }),
    )
    .await;
    assert!(r.is_err());
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn transport_without_address_fails_at_construction() {
    let r = SocketTransport::new(TransportOptions::new());
    assert!(matches!(r, Err(Error::NoAddress)));
}

#[tokio::test]
async fn nil_request_is_rejected_before_dialing() {
    // No server behind this address: the nil check fires first.
    let client = unix_transport("/tmp/wirecall-nowhere.sock");
    let err = rpc::unary::<_, Value>(
        &client,
        &Method::new("svc/echo", Shape::Unary),
        &None::<Value>,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NilRequest));
}

#[tokio::test]
async fn on_connect_fires_for_both_roles() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let path = socket_path("events");
    let server_hits = Arc::new(AtomicUsize::new(0));
    let client_hits = Arc::new(AtomicUsize::new(0));

    let hits = Arc::clone(&server_hits);
    let server = Arc::new(
        SocketTransport::new(
            TransportOptions::new()
                .protocol(Protocol::Unix)
                .address(&path)
                .on_connect(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap(),
    );
    register_test_service(&server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let hits = Arc::clone(&client_hits);
    let client = SocketTransport::new(
        TransportOptions::new()
            .protocol(Protocol::Unix)
            .address(&path)
            .on_connect(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .unwrap();

    let _: Value = rpc::unary(&client, &Method::new("svc/echo", Shape::Unary), &Value { v: 1 })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client_hits.load(Ordering::SeqCst), 1);
    assert_eq!(server_hits.load(Ordering::SeqCst), 1);
}
