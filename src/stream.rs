// ABOUTME: Per-call state machine: lifecycle, call-shape contracts, cancellation (C4)
// ABOUTME: FSM transitions grounded on HTTP/2-style stream state tables from the example pack

use std::time::Instant;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CodecError;
use crate::frame::{kind_flags, new_frame_header, Frame, FrameHeader, FrameKind, KindFlags, MAX_PAYLOAD_LEN};
use crate::pool::BufferPool;
use crate::status::Status;

/// One of the four gRPC call shapes (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Duplex,
}

impl MethodType {
    /// Whether more than one outbound message is permitted from this side.
    pub fn allows_outbound_stream(self) -> bool {
        matches!(self, MethodType::ClientStreaming | MethodType::Duplex)
    }

    /// Whether more than one inbound message is permitted to this side.
    pub fn allows_inbound_stream(self) -> bool {
        matches!(self, MethodType::ServerStreaming | MethodType::Duplex)
    }
}

/// Which side of the call this `StreamHandle` represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Stream FSM (§3 "Stream state"), grounded on `other_examples`'
/// `ymesika-h2::proto::state::StreamState` transition table, trimmed to this
/// protocol's simpler header → payload → trailer shape (no flow-control
/// windows).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Apply the effect of sending our own `EndAllItems`/trailer.
    pub fn on_local_end(self) -> StreamState {
        match self {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    /// Apply the effect of receiving the peer's `EndAllItems`/trailer.
    pub fn on_remote_end(self) -> StreamState {
        match self {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, StreamState::Closed)
    }

    pub fn can_accept_inbound(self) -> bool {
        matches!(self, StreamState::Idle | StreamState::Open | StreamState::HalfClosedLocal)
    }
}

/// Result of offering a frame to a stream's admission logic.
pub enum Admission {
    /// The stream adopted ownership of the frame's payload; the caller must
    /// not release it.
    Adopted,
    /// A complete message was assembled and delivered to the stream's
    /// inbound channel.
    MessageReady,
    /// The frame was rejected (sequence mismatch or closed stream); caller
    /// releases it and should treat this as a non-fatal protocol anomaly.
    Rejected(CodecError),
}

/// One live logical call (§3 "Stream").
pub struct StreamHandle {
    pub id: u16,
    pub method_name: String,
    pub method_type: MethodType,
    pub role: Role,
    pub state: StreamState,
    pub peer_sequence_expected: u16,
    pub my_sequence_next: u16,
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
    pub status: Option<Status>,

    accumulator: BytesMut,
    /// Dropped (set to `None`) once the peer's `EndAllItems` arrives, so a
    /// waiting `Receiver::recv` wakes with `None` instead of blocking past
    /// the end of this side's inbound half.
    ///
    /// Unbounded (§4.4 allows "unbounded… depending on call shape"): the
    /// single reader task that calls `try_accept_frame` has no way to apply
    /// back-pressure to the remote peer, so a bounded channel here would
    /// mean silently dropping messages once a slow consumer falls behind
    /// rather than ever blocking the frame that carries them.
    inbound_tx: Option<mpsc::UnboundedSender<BytesMut>>,
    pool: BufferPool,
}

impl StreamHandle {
    pub fn new(
        id: u16,
        method_name: String,
        method_type: MethodType,
        role: Role,
        parent_cancellation: CancellationToken,
        pool: BufferPool,
    ) -> (StreamHandle, mpsc::UnboundedReceiver<BytesMut>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = StreamHandle {
            id,
            method_name,
            method_type,
            role,
            state: StreamState::Idle,
            peer_sequence_expected: 0,
            my_sequence_next: 0,
            deadline: None,
            cancellation: parent_cancellation.child_token(),
            status: None,
            accumulator: BytesMut::new(),
            inbound_tx: Some(tx),
            pool,
        };
        (handle, rx)
    }

    /// Admission logic for an inbound `Payload` or `StreamTrailer` frame
    /// (§4.4/§4.5 `try_accept_frame`).
    pub fn try_accept_frame(&mut self, frame: &Frame) -> Admission {
        if !self.state.can_accept_inbound() {
            return Admission::Rejected(CodecError::InvalidHeader);
        }
        if frame.header.sequence_id != self.peer_sequence_expected {
            return Admission::Rejected(CodecError::InvalidHeader);
        }
        self.peer_sequence_expected = self.peer_sequence_expected.wrapping_add(1);

        match frame.kind() {
            FrameKind::Payload => {
                self.accumulator.extend_from_slice(frame.payload_bytes());
                let flags = frame.header.kind_flags;
                let mut message_ready = false;
                if flags.end_item() {
                    let msg = std::mem::take(&mut self.accumulator);
                    if let Some(tx) = &self.inbound_tx {
                        // An unbounded send only fails if the receiver was
                        // dropped, which means nothing is reading this
                        // stream's messages anymore; nothing to propagate.
                        let _ = tx.send(msg);
                    }
                    message_ready = true;
                }
                if flags.end_all_items() {
                    self.state = self.state.on_remote_end();
                    self.inbound_tx = None;
                }
                if message_ready {
                    Admission::MessageReady
                } else {
                    Admission::Adopted
                }
            }
            FrameKind::StreamTrailer => {
                self.status = Status::decode(frame.payload_bytes()).ok();
                self.state = self.state.on_remote_end();
                Admission::Adopted
            }
            _ => Admission::Rejected(CodecError::InvalidHeader),
        }
    }

    pub fn cancel(&mut self, status: Status) {
        self.cancellation.cancel();
        self.status = Some(status);
        self.state = StreamState::Closed;
    }

    /// Split `message` into one or more `Payload` frame headers, the last
    /// carrying `EndItem` (and `EndAllItems` if `end_stream` is set),
    /// returning `(header, payload_slice)` pairs in wire order. Grounded on
    /// §4.4's chunking rule: flush at 65535 bytes, continue into a fresh
    /// buffer.
    pub fn chunk_outbound<'a>(&mut self, message: &'a [u8], end_stream: bool) -> Vec<(FrameHeader, &'a [u8])> {
        let mut frames = Vec::new();
        if message.is_empty() {
            let mut flags = KindFlags::default().with(kind_flags::END_ITEM);
            if end_stream {
                flags = flags.with(kind_flags::END_ALL_ITEMS);
            }
            let header = new_frame_header(FrameKind::Payload, flags, self.id, self.next_sequence(), 0).unwrap();
            frames.push((header, &message[..0]));
            if end_stream {
                self.state = self.state.on_local_end();
            }
            return frames;
        }
        let mut offset = 0;
        while offset < message.len() {
            let end = (offset + MAX_PAYLOAD_LEN).min(message.len());
            let is_last_chunk = end == message.len();
            let mut flags = KindFlags::default();
            if is_last_chunk {
                flags = flags.with(kind_flags::END_ITEM);
                if end_stream {
                    flags = flags.with(kind_flags::END_ALL_ITEMS);
                }
            }
            let slice = &message[offset..end];
            let header =
                new_frame_header(FrameKind::Payload, flags, self.id, self.next_sequence(), slice.len()).unwrap();
            frames.push((header, slice));
            offset = end;
        }
        if end_stream {
            self.state = self.state.on_local_end();
        }
        frames
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.my_sequence_next;
        self.my_sequence_next = self.my_sequence_next.wrapping_add(1);
        seq
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Header for a `StreamTrailer` frame carrying `payload_len` bytes of
    /// encoded status, closing this side's local half (§4.4: "implies
    /// EndAllItems").
    pub fn prepare_trailer(&mut self, payload_len: usize) -> FrameHeader {
        let seq = self.next_sequence();
        self.state = self.state.on_local_end();
        new_frame_header(
            FrameKind::StreamTrailer,
            KindFlags::default().with(kind_flags::END_ALL_ITEMS),
            self.id,
            seq,
            payload_len,
        )
        .expect("status payloads stay well under the 65535 byte cap")
    }
}
