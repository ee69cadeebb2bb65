// ABOUTME: Error taxonomy for the runtime: codec, transport, and call-level errors
// ABOUTME: Mirrors the protocol/transport/user split in the error handling design

use crate::status::Status;
use std::io;
use thiserror::Error;

/// Errors raised while decoding or encoding frames. These are non-fatal to
/// the connection unless the header itself is unparseable (see
/// [`crate::multiplexer`]'s treatment of `CodecError::InvalidHeader`).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame payload length {0} exceeds the 65535 byte maximum")]
    PayloadTooLarge(usize),

    #[error("malformed frame header")]
    InvalidHeader,

    #[error("unknown frame kind byte {0:#04x}")]
    InvalidKind(u8),

    #[error("method name is not valid UTF-8")]
    InvalidMethodName,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// I/O failures on the underlying duplex transport. Connection-fatal: every
/// live stream resolves with `Status::unavailable`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    Closed,
}

/// Top-level error returned by the call invoker and service binder APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("call terminated: {0:?}")]
    Call(Status),

    #[error("no free stream ids available after {attempts} attempts")]
    StreamIdsExhausted { attempts: u32 },

    #[error("method not bound: {0}")]
    MethodNotFound(String),

    #[error("stream id {0} already in use")]
    DuplicateStreamId(u16),
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Call(status)
    }
}

/// Crate-wide `Result` alias, matching the convenience alias the teacher
/// defines at crate root.
pub type Result<T> = std::result::Result<T, Error>;
