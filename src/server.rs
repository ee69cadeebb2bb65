// ABOUTME: Server-side method registry and handler-invocation glue (C6 server half)
// ABOUTME: MethodDescriptor erases (Req, Resp) behind Marshaller<M>; the binder stores it by name

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::LogEvent;
use crate::error::Error;
use crate::marshal::Marshaller;
use crate::multiplexer::{send_payload, send_trailer, ConnectionHandle, StreamEntry};
use crate::status::{Status, StatusCode};
use crate::stream::MethodType;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handed to a bound method handler: identity of the call plus the
/// composed cancellation signal (user token + deadline + connection
/// shutdown, per the concurrency model's cancellation composition).
#[derive(Clone)]
pub struct ServerContext {
    pub stream_id: u16,
    pub method_name: Arc<str>,
    pub cancellation: CancellationToken,
}

/// Inbound request messages for a client-streaming or duplex method,
/// decoded lazily as they arrive.
pub struct RequestSource<Req> {
    rx: mpsc::UnboundedReceiver<BytesMut>,
    marshaller: Marshaller<Req>,
}

impl<Req> RequestSource<Req> {
    pub async fn next(&mut self) -> Option<Result<Req, Error>> {
        let bytes = self.rx.recv().await?;
        Some(self.marshaller.decode(&bytes).map_err(Error::from))
    }
}

/// Outbound response messages for a server-streaming or duplex method.
#[derive(Clone)]
pub struct ResponseSink<Resp> {
    conn: ConnectionHandle,
    entry: Arc<StreamEntry>,
    marshaller: Marshaller<Resp>,
}

impl<Resp> ResponseSink<Resp> {
    pub async fn send(&self, message: Resp) -> Result<(), Error> {
        let encoded = self.marshaller.encode(&message);
        send_payload(&self.conn, &self.entry, &encoded, false).await.map_err(Error::from)
    }
}

/// One bound RPC method: name, call shape, and the type-erased glue that
/// drives a registered handler against a stream's inbound channel and the
/// connection's writer (§4.6; §9's reflection-to-builder redesign).
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: Arc<str>,
    pub method_type: MethodType,
    invoke_fn: Arc<dyn Fn(ConnectionHandle, Arc<StreamEntry>) -> BoxFuture<()> + Send + Sync>,
}

impl MethodDescriptor {
    pub fn invoke(&self, conn: ConnectionHandle, entry: Arc<StreamEntry>) -> BoxFuture<()> {
        (self.invoke_fn)(conn, entry)
    }

    /// Exactly one request message, exactly one response message.
    pub fn unary<Req, Resp, F, Fut>(name: impl Into<Arc<str>>, req: Marshaller<Req>, resp: Marshaller<Resp>, handler: F) -> MethodDescriptor
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(ServerContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let name: Arc<str> = name.into();
        let handler = Arc::new(handler);
        MethodDescriptor {
            name: name.clone(),
            method_type: MethodType::Unary,
            invoke_fn: Arc::new(move |conn, entry| {
                let name = name.clone();
                let req = req.clone();
                let resp = resp.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let Some(ctx) = make_context(&entry, name).await else { return };
                    let Some(mut rx) = take_inbound(&entry).await else { return };
                    let Some(bytes) = rx.recv().await else {
                        finish(&conn, &entry, no_request_received()).await;
                        return;
                    };
                    let request = match req.decode(&bytes) {
                        Ok(r) => r,
                        Err(e) => {
                            finish(&conn, &entry, Status::new(StatusCode::InvalidArgument, e.to_string())).await;
                            return;
                        }
                    };
                    match handler(ctx, request).await {
                        Ok(response) => {
                            let encoded = resp.encode(&response);
                            // the trailer (not this message) closes the local half, so a
                            // StreamTrailer can still be admitted after it (see stream.rs)
                            if send_payload(&conn, &entry, &encoded, false).await.is_err() {
                                return;
                            }
                            finish(&conn, &entry, Status::ok()).await;
                        }
                        Err(status) => finish(&conn, &entry, Status::from_user_error(status.code, status.detail)).await,
                    }
                })
            }),
        }
    }

    /// Any number of request messages, exactly one response message.
    pub fn client_streaming<Req, Resp, F, Fut>(
        name: impl Into<Arc<str>>,
        req: Marshaller<Req>,
        resp: Marshaller<Resp>,
        handler: F,
    ) -> MethodDescriptor
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(ServerContext, RequestSource<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let name: Arc<str> = name.into();
        let handler = Arc::new(handler);
        MethodDescriptor {
            name: name.clone(),
            method_type: MethodType::ClientStreaming,
            invoke_fn: Arc::new(move |conn, entry| {
                let name = name.clone();
                let req = req.clone();
                let resp = resp.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let Some(ctx) = make_context(&entry, name).await else { return };
                    let Some(rx) = take_inbound(&entry).await else { return };
                    let source = RequestSource { rx, marshaller: req };
                    match handler(ctx, source).await {
                        Ok(response) => {
                            let encoded = resp.encode(&response);
                            // the trailer (not this message) closes the local half, so a
                            // StreamTrailer can still be admitted after it (see stream.rs)
                            if send_payload(&conn, &entry, &encoded, false).await.is_err() {
                                return;
                            }
                            finish(&conn, &entry, Status::ok()).await;
                        }
                        Err(status) => finish(&conn, &entry, Status::from_user_error(status.code, status.detail)).await,
                    }
                })
            }),
        }
    }

    /// Exactly one request message, any number of response messages.
    pub fn server_streaming<Req, Resp, F, Fut>(
        name: impl Into<Arc<str>>,
        req: Marshaller<Req>,
        resp: Marshaller<Resp>,
        handler: F,
    ) -> MethodDescriptor
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(ServerContext, Req, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let name: Arc<str> = name.into();
        let handler = Arc::new(handler);
        MethodDescriptor {
            name: name.clone(),
            method_type: MethodType::ServerStreaming,
            invoke_fn: Arc::new(move |conn, entry| {
                let name = name.clone();
                let req = req.clone();
                let resp = resp.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let Some(ctx) = make_context(&entry, name).await else { return };
                    let Some(mut rx) = take_inbound(&entry).await else { return };
                    let Some(bytes) = rx.recv().await else {
                        finish(&conn, &entry, no_request_received()).await;
                        return;
                    };
                    let request = match req.decode(&bytes) {
                        Ok(r) => r,
                        Err(e) => {
                            finish(&conn, &entry, Status::new(StatusCode::InvalidArgument, e.to_string())).await;
                            return;
                        }
                    };
                    let sink = ResponseSink {
                        conn: conn.clone(),
                        entry: entry.clone(),
                        marshaller: resp,
                    };
                    match handler(ctx, request, sink).await {
                        Ok(()) => finish(&conn, &entry, Status::ok()).await,
                        Err(status) => finish(&conn, &entry, Status::from_user_error(status.code, status.detail)).await,
                    }
                })
            }),
        }
    }

    /// Independent request/response half-streams.
    pub fn duplex<Req, Resp, F, Fut>(name: impl Into<Arc<str>>, req: Marshaller<Req>, resp: Marshaller<Resp>, handler: F) -> MethodDescriptor
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(ServerContext, RequestSource<Req>, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let name: Arc<str> = name.into();
        let handler = Arc::new(handler);
        MethodDescriptor {
            name: name.clone(),
            method_type: MethodType::Duplex,
            invoke_fn: Arc::new(move |conn, entry| {
                let name = name.clone();
                let req = req.clone();
                let resp = resp.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let Some(ctx) = make_context(&entry, name).await else { return };
                    let Some(rx) = take_inbound(&entry).await else { return };
                    let source = RequestSource { rx, marshaller: req };
                    let sink = ResponseSink {
                        conn: conn.clone(),
                        entry: entry.clone(),
                        marshaller: resp,
                    };
                    match handler(ctx, source, sink).await {
                        Ok(()) => finish(&conn, &entry, Status::ok()).await,
                        Err(status) => finish(&conn, &entry, Status::from_user_error(status.code, status.detail)).await,
                    }
                })
            }),
        }
    }
}

fn no_request_received() -> Status {
    Status::new(StatusCode::Internal, "stream closed before a request arrived")
}

async fn make_context(entry: &Arc<StreamEntry>, method_name: Arc<str>) -> Option<ServerContext> {
    let handle = entry.handle.lock().await;
    Some(ServerContext {
        stream_id: handle.id,
        method_name,
        cancellation: handle.cancellation.clone(),
    })
}

async fn take_inbound(entry: &Arc<StreamEntry>) -> Option<mpsc::UnboundedReceiver<BytesMut>> {
    entry.inbound_rx.lock().await.take()
}

async fn finish(conn: &ConnectionHandle, entry: &Arc<StreamEntry>, status: Status) {
    let stream_id = entry.handle.lock().await.id;
    if let Err(err) = send_trailer(conn, entry, &status).await {
        warn!(error = %err, stream_id, "failed to write trailer");
    }
    conn.streams.remove(&stream_id);
    conn.options.emit(LogEvent::StreamClosed { stream_id, code: status.code });
}

/// Name -> method map populated by explicit registration (§9's redesign of
/// reflection-based binding into builder calls). Method full-names follow
/// `"/{package.Service}/{Method}"` (§4.6).
#[derive(Default)]
pub struct ServiceBinder {
    methods: HashMap<Arc<str>, MethodDescriptor>,
}

impl ServiceBinder {
    pub fn new() -> Self {
        ServiceBinder { methods: HashMap::new() }
    }

    pub fn register(&mut self, descriptor: MethodDescriptor) -> &mut Self {
        self.methods.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn resolve(&self, method_name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method_name)
    }
}
