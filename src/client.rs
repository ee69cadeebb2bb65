// ABOUTME: Client-side stream-id allocation and per-call-shape invocation glue (C6 client half)
// ABOUTME: Mirrors server.rs's type erasure: generic only at the call boundary, byte-oriented beneath

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::frame::{kind_flags, new_frame_header, FrameKind, KindFlags};
use crate::marshal::Marshaller;
use crate::multiplexer::{await_status, send_payload, ConnectionHandle, StreamEntry};
use crate::status::Status;
use crate::stream::{MethodType, Role, StreamHandle, StreamState};
use crate::transport::WriteFlags;
use crate::writer;

/// Allocates stream ids and starts calls of all four shapes against a live
/// connection (§4.6 "client invoker"). Cheap to clone.
#[derive(Clone)]
pub struct CallInvoker {
    conn: ConnectionHandle,
    next_id: Arc<Mutex<u16>>,
}

/// Sends request messages for a client-streaming or duplex call.
#[derive(Clone)]
pub struct RequestSink<Req> {
    conn: ConnectionHandle,
    entry: Arc<StreamEntry>,
    marshaller: Marshaller<Req>,
}

impl<Req> RequestSink<Req> {
    pub async fn send(&self, message: Req) -> Result<()> {
        let encoded = self.marshaller.encode(&message);
        send_payload(&self.conn, &self.entry, &encoded, false).await.map_err(Error::from)
    }

    /// Sends `EndAllItems` with no further payload, closing this side's half.
    pub async fn finish(&self) -> Result<()> {
        send_payload(&self.conn, &self.entry, &[], true).await.map_err(Error::from)
    }
}

/// Reads response messages for a server-streaming or duplex call, and the
/// call's terminal status once the server's half closes.
pub struct ResponseStream<Resp> {
    entry: Arc<StreamEntry>,
    rx: mpsc::UnboundedReceiver<BytesMut>,
    marshaller: Marshaller<Resp>,
}

impl<Resp> ResponseStream<Resp> {
    pub async fn next(&mut self) -> Option<Result<Resp>> {
        let bytes = self.rx.recv().await?;
        Some(self.marshaller.decode(&bytes).map_err(Error::from))
    }

    /// Resolves once the server has sent its trailer (or the connection/
    /// stream has otherwise reached a terminal state).
    pub async fn status(&self) -> Status {
        await_status(&self.entry).await
    }

    /// Cancels the call: sends `StreamCancel` and resolves this stream's
    /// status as `Cancelled` without waiting for a server reply (§8 seed
    /// scenario 5).
    pub async fn cancel(&self, invoker: &CallInvoker) {
        invoker.cancel(&self.entry).await;
    }
}

impl CallInvoker {
    pub fn new(conn: ConnectionHandle) -> Self {
        CallInvoker {
            conn,
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Searches for a free id, wrapping past `u16::MAX` and skipping `0`
    /// (reserved for connection control frames), bounded by
    /// `max_concurrent_streams` attempts (§4.6).
    async fn alloc_stream_id(&self) -> Result<u16> {
        let attempts = self.conn.options.max_concurrent_streams.max(1);
        let mut next = self.next_id.lock().await;
        for _ in 0..attempts {
            let candidate = *next;
            *next = next.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            if !self.conn.streams.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::StreamIdsExhausted { attempts })
    }

    async fn open_stream(&self, method_name: &str, method_type: MethodType) -> Result<(Arc<StreamEntry>, mpsc::UnboundedReceiver<BytesMut>)> {
        let id = self.alloc_stream_id().await?;
        let (mut handle, rx) = StreamHandle::new(id, method_name.to_string(), method_type, Role::Client, self.conn.shutdown.clone(), self.conn.pool.clone());
        handle.state = StreamState::Open;
        let entry = Arc::new(StreamEntry::new(handle, None));
        self.conn.streams.insert(id, entry.clone());

        let name_bytes = method_name.as_bytes();
        let header = new_frame_header(FrameKind::StreamHeader, KindFlags::default().with(kind_flags::IS_CLIENT_STREAM), id, 0, name_bytes.len())
            .map_err(Error::Codec)?;
        self.conn
            .writer
            .send(writer::Outbound {
                header,
                payload: self.conn.pool.lease(BytesMut::from(name_bytes)),
                flags: WriteFlags::immediate(),
            })
            .await
            .map_err(Error::Transport)?;
        Ok((entry, rx))
    }

    /// One request message, one response message (§4.4 "Unary").
    pub async fn unary<Req, Resp>(&self, method_name: &str, req: &Marshaller<Req>, resp: &Marshaller<Resp>, request: Req) -> Result<Resp> {
        let (entry, mut rx) = self.open_stream(method_name, MethodType::Unary).await?;
        let encoded = req.encode(&request);
        send_payload(&self.conn, &entry, &encoded, true).await.map_err(Error::from)?;

        let message = rx.recv().await;
        let status = await_status(&entry).await;
        if !status.is_ok() {
            return Err(Error::Call(status));
        }
        let bytes = message.ok_or_else(|| Error::Protocol("unary call completed OK with no response message".to_string()))?;
        resp.decode(&bytes).map_err(Error::from)
    }

    /// Any number of request messages, one response message. Returns a sink
    /// to push requests onto and a future that resolves with the response
    /// once `finish()` has been called on the sink and the server replies.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method_name: &str,
        req: Marshaller<Req>,
        resp: Marshaller<Resp>,
    ) -> Result<(RequestSink<Req>, ResponseStream<Resp>)> {
        let (entry, rx) = self.open_stream(method_name, MethodType::ClientStreaming).await?;
        let sink = RequestSink {
            conn: self.conn.clone(),
            entry: entry.clone(),
            marshaller: req,
        };
        let stream = ResponseStream { entry, rx, marshaller: resp };
        Ok((sink, stream))
    }

    /// One request message, any number of response messages.
    pub async fn server_streaming<Req, Resp>(&self, method_name: &str, req: &Marshaller<Req>, resp: Marshaller<Resp>, request: Req) -> Result<ResponseStream<Resp>> {
        let (entry, rx) = self.open_stream(method_name, MethodType::ServerStreaming).await?;
        let encoded = req.encode(&request);
        send_payload(&self.conn, &entry, &encoded, true).await.map_err(Error::from)?;
        Ok(ResponseStream { entry, rx, marshaller: resp })
    }

    /// Independent request/response half-streams.
    pub async fn duplex<Req, Resp>(&self, method_name: &str, req: Marshaller<Req>, resp: Marshaller<Resp>) -> Result<(RequestSink<Req>, ResponseStream<Resp>)> {
        let (entry, rx) = self.open_stream(method_name, MethodType::Duplex).await?;
        let sink = RequestSink {
            conn: self.conn.clone(),
            entry: entry.clone(),
            marshaller: req,
        };
        let stream = ResponseStream { entry, rx, marshaller: resp };
        Ok((sink, stream))
    }

    /// Best-effort `StreamCancel` for an in-flight call, per the
    /// cancellation composition in the concurrency model.
    pub async fn cancel(&self, entry: &Arc<StreamEntry>) {
        let id = entry.handle.lock().await.id;
        if self.conn.streams.remove(&id).is_some() {
            let header = new_frame_header(FrameKind::StreamCancel, KindFlags::default(), id, 0, 0).expect("control frames carry no payload");
            let _ = self
                .conn
                .writer
                .send(writer::Outbound {
                    header,
                    payload: self.conn.pool.lease(BytesMut::new()),
                    flags: WriteFlags::immediate(),
                })
                .await;
        }
        entry.handle.lock().await.cancel(Status::cancelled());
        entry.closed.notify_waiters();
    }
}
