// ABOUTME: Per-connection reader task dispatch loop: id -> stream table, control frames (C5)
// ABOUTME: Single reader task per connection; all stream-table mutation for inbound events happens here

use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{ConnectionOptions, LogEvent};
use crate::error::TransportError;
use crate::frame::{kind_flags, new_frame_header, Frame, FrameHeader, FrameKind, KindFlags};
use crate::pool::BufferPool;
use crate::server::ServiceBinder;
use crate::status::Status;
use crate::stream::{Admission, Role, StreamHandle, StreamState};
use crate::transport::{split_transport, WriteFlags};
use crate::writer::{self, WriterHandle};

/// Table entry for one live stream: the state machine plus the inbound
/// message receiver, handed off exactly once to whichever local task reads
/// messages for this stream (the call invoker on the client, the bound
/// handler on the server), plus a notifier so a task awaiting this stream's
/// terminal status doesn't have to poll.
pub struct StreamEntry {
    pub handle: Mutex<StreamHandle>,
    pub inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<BytesMut>>>,
    pub closed: Notify,
}

impl StreamEntry {
    pub fn new(handle: StreamHandle, inbound_rx: Option<mpsc::UnboundedReceiver<BytesMut>>) -> Self {
        StreamEntry {
            handle: Mutex::new(handle),
            inbound_rx: Mutex::new(inbound_rx),
            closed: Notify::new(),
        }
    }
}

/// Waits until `entry`'s stream has a terminal status, without busy-polling.
///
/// Registers interest in the next `notify_waiters()` *before* checking
/// `status`, so a trailer/cancel that lands in the gap between the check and
/// the await is never missed (`Notify::notified()` only wakes waiters
/// registered at the time it fires).
pub(crate) async fn await_status(entry: &Arc<StreamEntry>) -> Status {
    loop {
        let notified = entry.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(status) = entry.handle.lock().await.status.clone() {
            return status;
        }
        notified.await;
    }
}

/// Chunks `message` through the stream's sequence counter and enqueues each
/// resulting `Payload` frame on the writer, shared by the call invoker and
/// the service binder's response path.
pub(crate) async fn send_payload(
    conn: &ConnectionHandle,
    entry: &Arc<StreamEntry>,
    message: &[u8],
    end_stream: bool,
) -> Result<(), TransportError> {
    let frames = {
        let mut handle = entry.handle.lock().await;
        handle.chunk_outbound(message, end_stream)
    };
    for (header, slice) in frames {
        let lease = conn.pool.lease(BytesMut::from(slice));
        conn.writer
            .send(writer::Outbound {
                header,
                payload: lease,
                flags: WriteFlags::immediate(),
            })
            .await?;
    }
    Ok(())
}

/// Sends the `StreamTrailer` carrying `status`, closing this side's local
/// half. Server-only: the client side never originates a trailer.
pub(crate) async fn send_trailer(
    conn: &ConnectionHandle,
    entry: &Arc<StreamEntry>,
    status: &Status,
) -> Result<(), TransportError> {
    let encoded = status.encode();
    let header: FrameHeader = {
        let mut handle = entry.handle.lock().await;
        handle.prepare_trailer(encoded.len())
    };
    conn.writer
        .send(writer::Outbound {
            header,
            payload: conn.pool.lease(BytesMut::from(&encoded[..])),
            flags: WriteFlags::immediate(),
        })
        .await
}

/// Shared handle to a live connection's stream table, writer queue, and
/// shutdown signal. Cheap to clone; held by the reader task, the writer
/// task, the call invoker, and every spawned server handler.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub streams: Arc<DashMap<u16, Arc<StreamEntry>>>,
    pub writer: WriterHandle,
    pub is_client: bool,
    pub pool: BufferPool,
    pub shutdown: CancellationToken,
    pub options: Arc<ConnectionOptions>,
}

/// Join handles for the two background tasks a connection spawns.
pub struct Spawned {
    pub connection: ConnectionHandle,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Spawn the reader and writer tasks for one connection over `transport`.
/// `binder` is `Some` on the server side (method name -> handler), `None`
/// on the client (which never receives `NewStream`).
pub fn spawn<T>(
    transport: T,
    options: ConnectionOptions,
    is_client: bool,
    binder: Option<Arc<ServiceBinder>>,
) -> Spawned
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let pool = BufferPool::new(options.default_buffer_size);
    let (reader, writer_half) = split_transport(transport, pool.clone(), options.default_buffer_size, options.merge_writes);
    let (writer_handle, writer_rx) = writer::channel(options.outbound_queue_bound);
    let options = Arc::new(options);

    let connection = ConnectionHandle {
        streams: Arc::new(DashMap::new()),
        writer: writer_handle,
        is_client,
        pool,
        shutdown: CancellationToken::new(),
        options,
    };

    let writer_conn = connection.clone();
    let writer_join = tokio::spawn(async move {
        if let Err(err) = writer::run(writer_half, writer_rx).await {
            warn!(error = %err, "writer task terminated; failing all streams");
            writer_conn.fail_all(Status::unavailable(err.to_string())).await;
        }
    });

    let reader_conn = connection.clone();
    let reader_join = tokio::spawn(run_reader(reader, reader_conn, binder));

    Spawned {
        connection,
        reader: reader_join,
        writer: writer_join,
    }
}

impl ConnectionHandle {
    /// Resolve every live stream with `status` and clear the table (§7:
    /// transport errors are connection-fatal, every stream resolves
    /// `Unavailable`; the writer-task-failure path also routes here).
    pub async fn fail_all(&self, status: Status) {
        self.shutdown.cancel();
        let entries: Vec<_> = self.streams.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            entry.handle.lock().await.cancel(status.clone());
            entry.closed.notify_waiters();
        }
        self.streams.clear();
    }

    pub fn insert(&self, entry: Arc<StreamEntry>, id: u16) {
        self.streams.insert(id, entry);
    }

    async fn send_control(&self, kind: FrameKind, stream_id: u16, flags: KindFlags) -> Result<(), TransportError> {
        let header = new_frame_header(kind, flags, stream_id, 0, 0).expect("control frames carry no payload");
        self.writer
            .send(writer::Outbound {
                header,
                payload: self.pool.lease(BytesMut::new()),
                flags: WriteFlags::immediate(),
            })
            .await
    }
}

async fn run_reader<R>(
    mut reader: crate::transport::FrameReader<R>,
    conn: ConnectionHandle,
    binder: Option<Arc<ServiceBinder>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "malformed frame header, closing connection");
                conn.fail_all(Status::unavailable(err.to_string())).await;
                break;
            }
        };
        if conn.shutdown.is_cancelled() {
            frame.release();
            break;
        }
        dispatch(&conn, &binder, frame).await;
    }
    conn.shutdown.cancel();
}

#[instrument(skip(conn, binder, frame), fields(stream_id = frame.stream_id(), kind = ?frame.kind()))]
async fn dispatch(conn: &ConnectionHandle, binder: &Option<Arc<ServiceBinder>>, frame: Frame) {
    match frame.kind() {
        FrameKind::ConnectionClose => {
            frame.release();
            debug!("peer closed the connection");
            conn.shutdown.cancel();
        }
        FrameKind::ConnectionPing => {
            let is_response = frame.header.kind_flags.is_response();
            frame.release();
            if !is_response {
                let _ = conn
                    .send_control(FrameKind::ConnectionPing, 0, KindFlags::default().with(kind_flags::IS_RESPONSE))
                    .await;
            }
        }
        FrameKind::StreamHeader => handle_new_stream(conn, binder, frame).await,
        FrameKind::Payload | FrameKind::StreamTrailer => handle_payload_or_trailer(conn, frame).await,
        FrameKind::StreamCancel => {
            let id = frame.stream_id();
            frame.release();
            if let Some((_, entry)) = conn.streams.remove(&id) {
                entry.handle.lock().await.cancel(Status::cancelled());
                entry.closed.notify_waiters();
            }
        }
        FrameKind::StreamMethodNotFound => {
            let id = frame.stream_id();
            frame.release();
            if let Some((_, entry)) = conn.streams.remove(&id) {
                let mut handle = entry.handle.lock().await;
                let method = handle.method_name.clone();
                handle.cancel(Status::unimplemented(method));
                drop(handle);
                entry.closed.notify_waiters();
            }
        }
    }
}

async fn handle_new_stream(conn: &ConnectionHandle, binder: &Option<Arc<ServiceBinder>>, frame: Frame) {
    let id = frame.stream_id();
    if conn.is_client {
        warn!("received NewStream on a client connection; protocol violation");
        frame.release();
        return;
    }
    if conn.streams.contains_key(&id) {
        frame.release();
        let _ = conn.send_control(FrameKind::StreamCancel, id, KindFlags::default()).await;
        return;
    }
    let method_name = String::from_utf8_lossy(frame.payload_bytes()).into_owned();
    frame.release();

    let Some(binder) = binder.as_ref() else {
        let _ = conn.send_control(FrameKind::StreamMethodNotFound, id, KindFlags::default()).await;
        return;
    };
    let Some(descriptor) = binder.resolve(&method_name) else {
        let _ = conn.send_control(FrameKind::StreamMethodNotFound, id, KindFlags::default()).await;
        return;
    };

    let (mut handle, rx) = StreamHandle::new(id, method_name.clone(), descriptor.method_type, Role::Server, conn.shutdown.clone(), conn.pool.clone());
    handle.state = StreamState::Open;
    let entry = Arc::new(StreamEntry::new(handle, Some(rx)));
    conn.streams.insert(id, entry.clone());
    conn.options.emit(LogEvent::StreamOpened { stream_id: id, method: method_name });

    let conn2 = conn.clone();
    let descriptor = descriptor.clone();
    tokio::spawn(async move {
        descriptor.invoke(conn2, entry).await;
    });
}

/// Admits one `Payload`/`StreamTrailer` frame into its stream's state
/// machine. Awaited directly from `dispatch` rather than spawned: frames
/// for a given `stream_id` must be admitted in receive order (§4.5), and a
/// per-frame `tokio::spawn` gives no such guarantee across frames.
async fn handle_payload_or_trailer(conn: &ConnectionHandle, frame: Frame) {
    let id = frame.stream_id();
    let entry = match conn.streams.get(&id) {
        Some(guard) => guard.value().clone(),
        None => {
            debug!(stream_id = id, "dropping frame for unknown stream (straggler)");
            frame.release();
            return;
        }
    };
    let mut handle = entry.handle.lock().await;
    let admission = handle.try_accept_frame(&frame);
    frame.release();
    let closed = handle.state.is_closed();
    let status = handle.status.clone();
    drop(handle);
    entry.closed.notify_waiters();
    if matches!(admission, Admission::Rejected(_)) {
        conn.options.emit(LogEvent::ProtocolViolation {
            stream_id: id,
            detail: "sequence or state mismatch".to_string(),
        });
    }
    if closed {
        conn.streams.remove(&id);
        conn.options.emit(LogEvent::StreamClosed {
            stream_id: id,
            code: status.map(|s| s.code).unwrap_or(crate::status::StatusCode::Ok),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::identity_marshaller;
    use crate::server::{MethodDescriptor, ServiceBinder};
    use tokio::io::duplex;

    #[tokio::test]
    async fn unbound_method_receives_method_not_found() {
        let binder = Arc::new(ServiceBinder::new());
        let (client_io, server_io) = duplex(8192);

        let server = spawn(server_io, ConnectionOptions::default(), false, Some(binder));
        let client = spawn(client_io, ConnectionOptions::default(), true, None);

        let header = new_frame_header(FrameKind::StreamHeader, KindFlags::default(), 11, 0, 5).unwrap();
        client
            .connection
            .writer
            .send(writer::Outbound {
                header,
                payload: client.connection.pool.lease(BytesMut::from(&b"/nope"[..])),
                flags: WriteFlags::immediate(),
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server.writer.abort();
        server.reader.abort();
        client.writer.abort();
        client.reader.abort();

        let _ = identity_marshaller();
        let _ = MethodDescriptor::unary("/unused", identity_marshaller(), identity_marshaller(), |_ctx, _req| {
            Box::pin(async { Ok(Vec::new()) })
        });
    }
}
