// ABOUTME: Single-consumer outbound queue draining (Frame, WriteFlags) pairs to the transport (C7)
// ABOUTME: Multi-producer senders come from stream handlers and the multiplexer loop

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::frame::FrameHeader;
use crate::pool::Lease;
use crate::transport::{FrameWriter, WriteFlags};

/// One outbound unit: a header plus its payload lease and write hints.
pub struct Outbound {
    pub header: FrameHeader,
    pub payload: Lease,
    pub flags: WriteFlags,
}

/// Producer handle for the writer queue. Cheap to clone; every stream
/// handler and the multiplexer's dispatch loop holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Outbound>,
}

impl WriterHandle {
    pub async fn send(&self, outbound: Outbound) -> Result<(), TransportError> {
        self.tx.send(outbound).await.map_err(|_| TransportError::Closed)
    }

    pub fn try_send(&self, outbound: Outbound) -> Result<(), TransportError> {
        self.tx.try_send(outbound).map_err(|_| TransportError::Closed)
    }
}

/// Construct a bounded or unbounded writer queue, per
/// `ConnectionOptions::outbound_queue_bound`.
pub fn channel(bound: Option<usize>) -> (WriterHandle, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(bound.unwrap_or(usize::MAX).max(1));
    (WriterHandle { tx }, rx)
}

/// Drains `rx` to `writer` until the channel closes or the transport fails.
/// On transport failure, returns the error so the caller can propagate a
/// terminal status to every live stream (per §7's propagation policy:
/// "errors inside the writer task terminate the connection").
pub async fn run<W>(mut writer: FrameWriter<W>, mut rx: mpsc::Receiver<Outbound>) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        let result = writer
            .write_frame(&outbound.header, outbound.payload.memory(), outbound.flags)
            .await;
        outbound.payload.dispose();
        if let Err(err) = result {
            warn!(error = %err, "writer task: transport write failed, terminating connection");
            return Err(err);
        }
        debug!(stream_id = outbound.header.stream_id, kind = ?outbound.header.kind, "frame written");
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{new_frame_header, FrameKind, KindFlags};
    use crate::pool::BufferPool;
    use crate::transport::split_transport;
    use bytes::BytesMut;
    use tokio::io::duplex;

    #[tokio::test]
    async fn drains_queue_to_transport_until_closed() {
        let (client, server) = duplex(4096);
        let pool = BufferPool::new(256);
        let (_unused_reader, client_writer) = split_transport(client, pool.clone(), 128, true);
        let (handle, rx) = channel(None);

        let writer_task = tokio::spawn(run(client_writer, rx));

        let header = new_frame_header(FrameKind::Payload, KindFlags::default(), 1, 0, 3).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"abc");
        let lease = pool.lease(buf);
        handle
            .send(Outbound { header, payload: lease, flags: WriteFlags::immediate() })
            .await
            .unwrap();
        drop(handle);

        writer_task.await.unwrap().unwrap();

        let (mut server_reader, _unused_writer) = split_transport(server, pool, 128, true);
        let frame = server_reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload_bytes(), b"abc");
    }
}
