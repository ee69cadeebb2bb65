// ABOUTME: Adapts a duplex byte transport into an async frame source/sink (C3)
// ABOUTME: Optional write-coalescing driven by WriteFlags and ConnectionOptions

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};

use crate::error::{CodecError, TransportError};
use crate::frame::{encode_frame, Frame, FrameBuilder, FrameHeader};
use crate::pool::BufferPool;

const MIN_READ_CHUNK: usize = 8;

/// Per-outbound-frame write hints (§4.3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Permit coalescing with subsequently queued frames before flushing.
    pub buffer_hint: bool,
    /// Force an immediate flush after this frame regardless of `buffer_hint`.
    pub flush_after: bool,
    /// The payload buffer was already built with the 8 header bytes
    /// prepended, so the transport can write it in one call with no copy.
    pub header_reserved: bool,
}

impl WriteFlags {
    pub fn immediate() -> Self {
        WriteFlags {
            buffer_hint: false,
            flush_after: true,
            header_reserved: false,
        }
    }

    pub fn coalesced() -> Self {
        WriteFlags {
            buffer_hint: true,
            flush_after: false,
            header_reserved: false,
        }
    }
}

/// Read half of a duplex transport, feeding bytes into a [`FrameBuilder`].
/// Owned exclusively by the connection's reader task (§5: "sole reader of
/// the transport").
pub struct FrameReader<R> {
    stream: R,
    builder: FrameBuilder,
    read_chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R, pool: BufferPool, read_chunk_size: usize) -> Self {
        FrameReader {
            stream,
            builder: FrameBuilder::new(pool),
            read_chunk: vec![0u8; read_chunk_size.max(MIN_READ_CHUNK)],
        }
    }

    /// Read and assemble the next frame, returning `Ok(None)` on a clean
    /// peer shutdown that doesn't break a frame in half.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            let want = self.builder.request_bytes();
            let chunk_cap = self.read_chunk.len().min(want.max(1));
            let n = self
                .stream
                .read(&mut self.read_chunk[..chunk_cap])
                .await
                .map_err(CodecError::Io)?;
            if n == 0 {
                return if self.builder.at_frame_boundary() {
                    Ok(None)
                } else {
                    Err(CodecError::InvalidHeader)
                };
            }
            let dst = self.builder.get_buffer();
            let take = n.min(dst.len());
            dst[..take].copy_from_slice(&self.read_chunk[..take]);
            if let Some(frame) = self.builder.try_read(take)? {
                return Ok(Some(frame));
            }
        }
    }
}

/// Write half of a duplex transport. Owned exclusively by the writer
/// coordinator task (C7).
pub struct FrameWriter<W> {
    stream: BufWriter<W>,
    merge_writes: bool,
    pending_flush: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W, merge_writes: bool) -> Self {
        FrameWriter {
            stream: BufWriter::new(stream),
            merge_writes,
            pending_flush: false,
        }
    }

    /// Write one outbound frame, honoring `flags` for coalescing.
    pub async fn write_frame(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        flags: WriteFlags,
    ) -> Result<(), TransportError> {
        let wire = encode_frame(header, payload);
        self.stream.write_all(&wire).await?;
        self.pending_flush = true;

        let should_flush = flags.flush_after || !(self.merge_writes && flags.buffer_hint);
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        if self.pending_flush {
            self.stream.flush().await?;
            self.pending_flush = false;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Split a duplex transport into an independent reader and writer, each
/// owned by its own task per the connection's concurrency model (§5).
pub fn split_transport<T>(
    stream: T,
    pool: BufferPool,
    read_chunk_size: usize,
    merge_writes: bool,
) -> (FrameReader<ReadHalf<T>>, FrameWriter<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = split(stream);
    (
        FrameReader::new(read_half, pool, read_chunk_size),
        FrameWriter::new(write_half, merge_writes),
    )
}
