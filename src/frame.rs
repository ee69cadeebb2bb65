// ABOUTME: Fixed 8-byte frame header, frame kinds, and the incremental frame builder (C2)
// ABOUTME: Encodes/decodes the wire-critical header; payload bytes are owned via pool::Lease

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::CodecError;
use crate::pool::{BufferPool, Lease};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Maximum payload size for a single frame.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Frame kind byte values, fixed per the canonical scheme this crate picked
/// (the source left two overlapping numbering schemes; see `DESIGN.md`'s
/// Open Question resolutions).
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    StreamHeader = 0x01,
    ConnectionPing = 0x02,
    ConnectionClose = 0x03,
    Payload = 0x05,
    StreamTrailer = 0x06,
    StreamCancel = 0x07,
    StreamMethodNotFound = 0x08,
}

/// `kind_flags` bits, per the external interfaces section.
pub mod kind_flags {
    pub const END_ITEM: u8 = 0x01;
    pub const END_ALL_ITEMS: u8 = 0x02;
    pub const IS_RESPONSE: u8 = 0x04;
    pub const IS_CLIENT_STREAM: u8 = 0x08;
}

/// A small bitflag wrapper over the raw `kind_flags` byte, kept as a plain
/// newtype rather than a generated bitflags type since only four bits are
/// meaningful here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindFlags(pub u8);

impl KindFlags {
    pub fn new(raw: u8) -> Self {
        KindFlags(raw)
    }

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u8) -> Self {
        self.0 |= bit;
        self
    }

    pub fn end_item(self) -> bool {
        self.has(kind_flags::END_ITEM)
    }

    pub fn end_all_items(self) -> bool {
        self.has(kind_flags::END_ALL_ITEMS)
    }

    pub fn is_response(self) -> bool {
        self.has(kind_flags::IS_RESPONSE)
    }

    pub fn is_client_stream(self) -> bool {
        self.has(kind_flags::IS_CLIENT_STREAM)
    }
}

/// The fixed 8-byte frame header (§3), little-endian throughout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub kind_flags: KindFlags,
    pub stream_id: u16,
    pub sequence_id: u16,
    pub payload_length: u16,
}

impl FrameHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.into());
        buf.put_u8(self.kind_flags.0);
        buf.put_u16_le(self.stream_id);
        buf.put_u16_le(self.sequence_id);
        buf.put_u16_le(self.payload_length);
    }

    /// Decode a header from exactly `HEADER_LEN` bytes.
    pub fn decode(buf: &[u8]) -> Result<FrameHeader, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::InvalidHeader);
        }
        let mut cursor = buf;
        let kind_byte = cursor.get_u8();
        let kind = FrameKind::try_from(kind_byte).map_err(|_| CodecError::InvalidKind(kind_byte))?;
        let kind_flags = KindFlags::new(cursor.get_u8());
        let stream_id = cursor.get_u16_le();
        let sequence_id = cursor.get_u16_le();
        let payload_length = cursor.get_u16_le();
        Ok(FrameHeader {
            kind,
            kind_flags,
            stream_id,
            sequence_id,
            payload_length,
        })
    }
}

/// A complete frame: header plus an owned payload lease (§3).
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Lease,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    pub fn stream_id(&self) -> u16 {
        self.header.stream_id
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.memory()
    }

    /// Forward this frame to another consumer without copying: the returned
    /// frame shares the payload's refcounted lease.
    pub fn forward(&self) -> Frame {
        Frame {
            header: self.header,
            payload: self.payload.preserve(),
        }
    }

    pub fn release(self) {
        self.payload.dispose();
    }
}

/// Incremental frame parser fed by a transport (C2).
///
/// Call `request_bytes()` to learn how many more bytes are needed, fill the
/// region returned by `get_buffer()`, then call `try_read(n)` after an
/// external read writes `n` bytes into that region. When a complete frame
/// has been assembled, `try_read` returns it and the builder rotates to a
/// fresh region for the next one.
pub struct FrameBuilder {
    pool: BufferPool,
    header_buf: BytesMut,
    header_filled: usize,
    header: Option<FrameHeader>,
    payload_buf: BytesMut,
    payload_filled: usize,
}

impl FrameBuilder {
    pub fn new(pool: BufferPool) -> Self {
        FrameBuilder {
            pool,
            header_buf: BytesMut::zeroed(HEADER_LEN),
            header_filled: 0,
            header: None,
            payload_buf: BytesMut::new(),
            payload_filled: 0,
        }
    }

    /// True when no partial header or payload has been accumulated, i.e. a
    /// peer shutdown at this point is a clean boundary rather than a frame
    /// broken in half.
    pub fn at_frame_boundary(&self) -> bool {
        self.header.is_none() && self.header_filled == 0
    }

    /// Bytes needed to complete the current header or current payload.
    pub fn request_bytes(&self) -> usize {
        match &self.header {
            None => HEADER_LEN - self.header_filled,
            Some(h) => h.payload_length as usize - self.payload_filled,
        }
    }

    /// A writable region sized for the current need. Callers must write at
    /// most `request_bytes()` bytes starting at offset 0 of the returned
    /// slice before calling `try_read`.
    pub fn get_buffer(&mut self) -> &mut [u8] {
        match &self.header {
            None => {
                let start = self.header_filled;
                &mut self.header_buf[start..HEADER_LEN]
            }
            Some(h) => {
                let needed = h.payload_length as usize;
                if self.payload_buf.len() < needed {
                    if self.payload_buf.capacity() < needed {
                        let mut fresh = self.pool.acquire(needed);
                        fresh.resize(needed, 0);
                        self.payload_buf = fresh;
                    } else {
                        self.payload_buf.resize(needed, 0);
                    }
                }
                let start = self.payload_filled;
                &mut self.payload_buf[start..needed]
            }
        }
    }

    /// Record that `n` bytes have been written into the region from
    /// `get_buffer()`. Returns `Some(frame)` once a complete frame is
    /// assembled.
    pub fn try_read(&mut self, n: usize) -> Result<Option<Frame>, CodecError> {
        match self.header {
            None => {
                self.header_filled += n;
                if self.header_filled < HEADER_LEN {
                    return Ok(None);
                }
                let header = FrameHeader::decode(&self.header_buf)?;
                if header.payload_length as usize > MAX_PAYLOAD_LEN {
                    return Err(CodecError::PayloadTooLarge(header.payload_length as usize));
                }
                if header.payload_length == 0 {
                    self.header_filled = 0;
                    let empty = self.pool.lease(BytesMut::new());
                    return Ok(Some(Frame { header, payload: empty }));
                }
                self.header = Some(header);
                Ok(None)
            }
            Some(header) => {
                self.payload_filled += n;
                if self.payload_filled < header.payload_length as usize {
                    return Ok(None);
                }
                let payload = std::mem::take(&mut self.payload_buf);
                let lease = self.pool.lease(payload);
                self.header = None;
                self.header_filled = 0;
                self.payload_filled = 0;
                Ok(Some(Frame { header, payload: lease }))
            }
        }
    }
}

/// Construct an outbound frame header, rejecting oversized payloads (the
/// builder's authoritative length check applies symmetrically on encode).
pub fn new_frame_header(
    kind: FrameKind,
    kind_flags: KindFlags,
    stream_id: u16,
    sequence_id: u16,
    payload_len: usize,
) -> Result<FrameHeader, CodecError> {
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload_len));
    }
    Ok(FrameHeader {
        kind,
        kind_flags,
        stream_id,
        sequence_id,
        payload_length: payload_len as u16,
    })
}

pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(256)
    }

    #[test]
    fn header_round_trips_byte_exact() {
        let header = FrameHeader {
            kind: FrameKind::Payload,
            kind_flags: KindFlags::new(kind_flags::END_ITEM | kind_flags::END_ALL_ITEMS),
            stream_id: 7,
            sequence_id: 300,
            payload_length: 13,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn seed_scenario_1_new_stream_header_bytes() {
        let header = new_frame_header(FrameKind::StreamHeader, KindFlags::default(), 1, 0, 9).unwrap();
        let encoded = encode_frame(&header, b"/svc/echo");
        assert_eq!(
            &encoded[..],
            &[
                0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x00, b'/', b's', b'v', b'c', b'/', b'e', b'c', b'h', b'o'
            ][..]
        );
    }

    #[test]
    fn seed_scenario_1_payload_frame_bytes() {
        let flags = KindFlags::default()
            .with(kind_flags::END_ITEM)
            .with(kind_flags::END_ALL_ITEMS);
        let header = new_frame_header(FrameKind::Payload, flags, 1, 0, 13).unwrap();
        let encoded = encode_frame(&header, b"hello, world!");
        assert_eq!(encoded[0], 0x05);
        assert_eq!(encoded[1], 0x03);
        assert_eq!(&encoded[2..4], &[0x01, 0x00]);
        assert_eq!(&encoded[6..8], &[0x0D, 0x00]);
        assert_eq!(&encoded[8..], b"hello, world!");
    }

    #[test]
    fn payload_over_max_is_rejected() {
        let err = new_frame_header(FrameKind::Payload, KindFlags::default(), 1, 0, MAX_PAYLOAD_LEN + 1);
        assert!(matches!(err, Err(CodecError::PayloadTooLarge(_))));
    }

    fn feed(builder: &mut FrameBuilder, wire: &[u8], chunk_size: usize) -> Vec<Frame> {
        let mut produced = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            let mut remaining = chunk;
            while !remaining.is_empty() {
                let want = builder.request_bytes().min(remaining.len());
                let dst = builder.get_buffer();
                dst[..want].copy_from_slice(&remaining[..want]);
                if let Some(frame) = builder.try_read(want).unwrap() {
                    produced.push(frame);
                }
                remaining = &remaining[want..];
            }
        }
        produced
    }

    #[test]
    fn builder_assembles_frame_split_across_arbitrary_chunks() {
        let mut builder = FrameBuilder::new(pool());
        let header = new_frame_header(FrameKind::Payload, KindFlags::default(), 2, 5, 4).unwrap();
        let wire = encode_frame(&header, b"abcd");

        let mut produced = feed(&mut builder, &wire, 3);
        let frame = produced.pop().expect("frame should be fully assembled");
        assert_eq!(frame.stream_id(), 2);
        assert_eq!(frame.payload_bytes(), b"abcd");
    }

    #[test]
    fn builder_yields_exactly_f_in_order_for_back_to_back_frames() {
        let mut builder = FrameBuilder::new(pool());
        let mut wire = BytesMut::new();
        for i in 0..5u16 {
            let header = new_frame_header(FrameKind::Payload, KindFlags::default(), 1, i, 2).unwrap();
            wire.extend_from_slice(&encode_frame(&header, &i.to_le_bytes()));
        }
        let produced = feed(&mut builder, &wire, 7);
        assert_eq!(produced.len(), 5);
        for (i, frame) in produced.iter().enumerate() {
            assert_eq!(frame.header.sequence_id, i as u16);
            assert_eq!(frame.payload_bytes(), (i as u16).to_le_bytes());
        }
    }

    #[test]
    fn empty_payload_frame_is_emitted_immediately() {
        let mut builder = FrameBuilder::new(pool());
        let flags = KindFlags::default()
            .with(kind_flags::END_ITEM)
            .with(kind_flags::END_ALL_ITEMS);
        let header = new_frame_header(FrameKind::Payload, flags, 9, 0, 0).unwrap();
        let wire = encode_frame(&header, b"");

        let mut produced = feed(&mut builder, &wire, 4);
        let frame = produced.pop().unwrap();
        assert!(frame.payload_bytes().is_empty());
        assert!(frame.header.kind_flags.end_item());
        assert!(frame.header.kind_flags.end_all_items());
    }

    #[test]
    fn message_of_exactly_65535_bytes_is_one_frame() {
        let mut builder = FrameBuilder::new(pool());
        let flags = KindFlags::default().with(kind_flags::END_ITEM);
        let header = new_frame_header(FrameKind::Payload, flags, 3, 0, MAX_PAYLOAD_LEN).unwrap();
        let payload = vec![0xAB; MAX_PAYLOAD_LEN];
        let wire = encode_frame(&header, &payload);

        let produced = feed(&mut builder, &wire, 4096);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].payload_bytes().len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn malformed_kind_byte_is_rejected() {
        let mut builder = FrameBuilder::new(pool());
        let mut bad = BytesMut::from(&[0xFFu8, 0, 0, 0, 0, 0, 0, 0][..]);
        let want = builder.request_bytes();
        let dst = builder.get_buffer();
        dst[..want].copy_from_slice(&bad.split_to(want));
        let err = builder.try_read(want).unwrap_err();
        assert!(matches!(err, CodecError::InvalidKind(0xFF)));
    }
}
