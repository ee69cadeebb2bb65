// ABOUTME: End-to-end tests for the four call shapes plus cancellation and unbound-method handling
// ABOUTME: Each test spawns a real client/server pair over an in-memory duplex pipe

use std::sync::Arc;
use std::time::Duration;

use framed_rpc::client::CallInvoker;
use framed_rpc::config::ConnectionOptions;
use framed_rpc::marshal::identity_marshaller;
use framed_rpc::multiplexer::spawn;
use framed_rpc::server::{MethodDescriptor, ServiceBinder};
use framed_rpc::status::StatusCode;
use framed_rpc::Error;
use tokio::io::duplex;

fn i64_marshaller() -> framed_rpc::marshal::Marshaller<i64> {
    framed_rpc::marshal::Marshaller::new(|n: &i64| n.to_le_bytes().to_vec(), |b: &[u8]| {
        Ok(i64::from_le_bytes(b.try_into().map_err(|_| framed_rpc::error::CodecError::InvalidHeader)?))
    })
}

#[tokio::test]
async fn client_streaming_sum_of_ten_thousand_matches_expected_total() {
    let mut binder = ServiceBinder::new();
    binder.register(MethodDescriptor::client_streaming(
        "/svc/sum",
        i64_marshaller(),
        i64_marshaller(),
        |_ctx, mut reqs| async move {
            let mut total: i64 = 0;
            while let Some(next) = reqs.next().await {
                total += next.map_err(|e| framed_rpc::status::Status::new(StatusCode::InvalidArgument, e.to_string()))?;
            }
            Ok(total)
        },
    ));
    let binder = Arc::new(binder);

    let (client_io, server_io) = duplex(1 << 20);
    let server = spawn(server_io, ConnectionOptions::default(), false, Some(binder));
    let client = spawn(client_io, ConnectionOptions::default(), true, None);
    let invoker = CallInvoker::new(client.connection.clone());

    let marshaller = i64_marshaller();
    let (sink, mut stream) = invoker.client_streaming("/svc/sum", marshaller.clone(), marshaller).await.unwrap();
    let n = 10_000i64;
    for i in 0..n {
        sink.send(i).await.unwrap();
    }
    sink.finish().await.unwrap();

    let sum = stream.next().await.unwrap().unwrap();
    assert_eq!(sum, 49_995_000);
    assert!(stream.status().await.is_ok());

    server.writer.abort();
    server.reader.abort();
    client.writer.abort();
    client.reader.abort();
}

#[tokio::test]
async fn server_streaming_count_down_delivers_messages_in_order() {
    let mut binder = ServiceBinder::new();
    binder.register(MethodDescriptor::server_streaming(
        "/svc/countup",
        i64_marshaller(),
        i64_marshaller(),
        |_ctx, count: i64, sink| async move {
            for i in 0..count {
                sink.send(i).await.map_err(|e| framed_rpc::status::Status::new(StatusCode::Internal, e.to_string()))?;
            }
            Ok(())
        },
    ));
    let binder = Arc::new(binder);

    let (client_io, server_io) = duplex(1 << 16);
    let server = spawn(server_io, ConnectionOptions::default(), false, Some(binder));
    let client = spawn(client_io, ConnectionOptions::default(), true, None);
    let invoker = CallInvoker::new(client.connection.clone());

    let marshaller = i64_marshaller();
    let req_marshaller = marshaller.clone();
    let c = 20i64;
    let mut stream = invoker.server_streaming("/svc/countup", &req_marshaller, marshaller, c).await.unwrap();

    let mut received = Vec::new();
    while let Some(msg) = stream.next().await {
        received.push(msg.unwrap());
    }
    assert_eq!(received, (0..c).collect::<Vec<_>>());
    assert!(stream.status().await.is_ok());

    server.writer.abort();
    server.reader.abort();
    client.writer.abort();
    client.reader.abort();
}

#[tokio::test]
async fn duplex_echo_returns_each_pushed_value_in_turn() {
    let mut binder = ServiceBinder::new();
    binder.register(MethodDescriptor::duplex(
        "/svc/echo_stream",
        i64_marshaller(),
        i64_marshaller(),
        |_ctx, mut reqs, sink| async move {
            while let Some(next) = reqs.next().await {
                let value = next.map_err(|e| framed_rpc::status::Status::new(StatusCode::InvalidArgument, e.to_string()))?;
                sink.send(value).await.map_err(|e| framed_rpc::status::Status::new(StatusCode::Internal, e.to_string()))?;
            }
            Ok(())
        },
    ));
    let binder = Arc::new(binder);

    let (client_io, server_io) = duplex(1 << 16);
    let server = spawn(server_io, ConnectionOptions::default(), false, Some(binder));
    let client = spawn(client_io, ConnectionOptions::default(), true, None);
    let invoker = CallInvoker::new(client.connection.clone());

    let marshaller = i64_marshaller();
    let (sink, mut stream) = invoker.duplex("/svc/echo_stream", marshaller.clone(), marshaller).await.unwrap();

    for i in 0..10i64 {
        sink.send(i).await.unwrap();
        let echoed = stream.next().await.unwrap().unwrap();
        assert_eq!(echoed, i);
    }
    sink.finish().await.unwrap();
    assert!(stream.status().await.is_ok());

    server.writer.abort();
    server.reader.abort();
    client.writer.abort();
    client.reader.abort();
}

#[tokio::test]
async fn cancelling_an_in_flight_call_fires_the_servers_cancellation_token() {
    let cancelled = Arc::new(tokio::sync::Notify::new());
    let cancelled_on_server = cancelled.clone();

    let mut binder = ServiceBinder::new();
    binder.register(MethodDescriptor::server_streaming(
        "/svc/slow_count",
        i64_marshaller(),
        i64_marshaller(),
        move |ctx, _count: i64, _sink| {
            let cancelled_on_server = cancelled_on_server.clone();
            async move {
                ctx.cancellation.cancelled().await;
                cancelled_on_server.notify_one();
                Err(framed_rpc::status::Status::cancelled())
            }
        },
    ));
    let binder = Arc::new(binder);

    let (client_io, server_io) = duplex(1 << 16);
    let server = spawn(server_io, ConnectionOptions::default(), false, Some(binder));
    let client = spawn(client_io, ConnectionOptions::default(), true, None);
    let invoker = CallInvoker::new(client.connection.clone());

    let marshaller = i64_marshaller();
    let req_marshaller = marshaller.clone();
    let stream = invoker.server_streaming("/svc/slow_count", &req_marshaller, marshaller, 1_000_000i64).await.unwrap();

    stream.cancel(&invoker).await;
    assert_eq!(stream.status().await.code, StatusCode::Cancelled);

    tokio::time::timeout(Duration::from_secs(1), cancelled.notified()).await.expect("server observed the cancellation");

    server.writer.abort();
    server.reader.abort();
    client.writer.abort();
    client.reader.abort();
}

#[tokio::test]
async fn unary_call_to_an_unbound_method_resolves_unimplemented() {
    let binder = Arc::new(ServiceBinder::new());
    let (client_io, server_io) = duplex(8192);
    let server = spawn(server_io, ConnectionOptions::default(), false, Some(binder));
    let client = spawn(client_io, ConnectionOptions::default(), true, None);
    let invoker = CallInvoker::new(client.connection.clone());

    let marshaller = identity_marshaller();
    let err = invoker.unary("/nope", &marshaller, &marshaller, Vec::new()).await.unwrap_err();
    match err {
        Error::Call(status) => assert_eq!(status.code, StatusCode::Unimplemented),
        other => panic!("expected a call status error, got {other:?}"),
    }

    server.writer.abort();
    server.reader.abort();
    client.writer.abort();
    client.reader.abort();
}
