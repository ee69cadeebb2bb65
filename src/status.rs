// ABOUTME: Terminal call disposition shared by client and server sides
// ABOUTME: Wire-coded as a u16 in StreamTrailer payloads

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::CodecError;

/// gRPC-compatible status codes (terminal disposition of a stream).
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

/// `{code, detail, cause?}` as described in the glossary.
///
/// `cause` is not carried across the wire; it is attached locally when a
/// status originates from a `std::error::Error` (e.g. a transport failure)
/// so the caller can inspect the underlying error without losing the
/// wire-visible code and detail.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: StatusCode,
    pub detail: String,
    pub metadata: Vec<(String, Vec<u8>)>,
}

impl Status {
    pub fn ok() -> Self {
        Status {
            code: StatusCode::Ok,
            detail: String::new(),
            metadata: Vec::new(),
        }
    }

    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        Status {
            code,
            detail: detail.into(),
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn cancelled() -> Self {
        Status::new(StatusCode::Cancelled, "call cancelled")
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Status::new(StatusCode::Unavailable, detail)
    }

    pub fn deadline_exceeded() -> Self {
        Status::new(StatusCode::DeadlineExceeded, "deadline exceeded")
    }

    pub fn unimplemented(method: impl std::fmt::Display) -> Self {
        Status::new(StatusCode::Unimplemented, format!("method not found: {method}"))
    }

    /// A status raised by user code with `Ok` is coerced to `Unknown`
    /// (a handler cannot signal success through an error path).
    pub fn from_user_error(code: StatusCode, detail: impl Into<String>) -> Self {
        if code == StatusCode::Ok {
            Status::new(StatusCode::Unknown, detail)
        } else {
            Status::new(code, detail)
        }
    }

    /// `StreamTrailer` payload wire encoding: code, detail, optional
    /// metadata (§6: "status code + detail + optional metadata").
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let code: u16 = self.code.into();
        buf.put_u16_le(code);
        let detail = self.detail.as_bytes();
        buf.put_u16_le(detail.len() as u16);
        buf.put_slice(detail);
        buf.put_u16_le(self.metadata.len() as u16);
        for (key, value) in &self.metadata {
            let key = key.as_bytes();
            buf.put_u16_le(key.len() as u16);
            buf.put_slice(key);
            buf.put_u16_le(value.len() as u16);
            buf.put_slice(value);
        }
        buf.to_vec()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Status, CodecError> {
        if bytes.len() < 4 {
            return Err(CodecError::InvalidHeader);
        }
        let raw_code = bytes.get_u16_le();
        let code = StatusCode::try_from(raw_code).map_err(|_| CodecError::InvalidHeader)?;
        let detail_len = bytes.get_u16_le() as usize;
        if bytes.len() < detail_len {
            return Err(CodecError::InvalidHeader);
        }
        let detail = String::from_utf8(bytes[..detail_len].to_vec()).map_err(|_| CodecError::InvalidMethodName)?;
        bytes.advance(detail_len);

        let mut metadata = Vec::new();
        if bytes.len() >= 2 {
            let count = bytes.get_u16_le();
            for _ in 0..count {
                if bytes.len() < 2 {
                    break;
                }
                let key_len = bytes.get_u16_le() as usize;
                let key = String::from_utf8_lossy(&bytes[..key_len]).into_owned();
                bytes.advance(key_len);
                let val_len = bytes.get_u16_le() as usize;
                let value = bytes[..val_len].to_vec();
                bytes.advance(val_len);
                metadata.push((key, value));
            }
        }
        Ok(Status { code, detail, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status_is_ok() {
        assert!(Status::ok().is_ok());
    }

    #[test]
    fn user_error_with_ok_code_is_coerced_to_unknown() {
        let s = Status::from_user_error(StatusCode::Ok, "should not happen");
        assert_eq!(s.code, StatusCode::Unknown);
    }

    #[test]
    fn status_code_round_trips_through_wire_value() {
        for code in [
            StatusCode::Ok,
            StatusCode::Cancelled,
            StatusCode::DeadlineExceeded,
            StatusCode::Unimplemented,
            StatusCode::Unavailable,
        ] {
            let raw: u16 = code.into();
            assert_eq!(StatusCode::try_from(raw).unwrap(), code);
        }
    }

    #[test]
    fn status_with_metadata_round_trips_through_wire_encoding() {
        let status = Status::new(StatusCode::NotFound, "no such widget").with_metadata("trace-id", b"abc123".to_vec());
        let encoded = status.encode();
        let decoded = Status::decode(&encoded).unwrap();
        assert_eq!(decoded.code, StatusCode::NotFound);
        assert_eq!(decoded.detail, "no such widget");
        assert_eq!(decoded.metadata, vec![("trace-id".to_string(), b"abc123".to_vec())]);
    }

    #[test]
    fn ok_status_with_no_metadata_round_trips() {
        let encoded = Status::ok().encode();
        let decoded = Status::decode(&encoded).unwrap();
        assert!(decoded.is_ok());
        assert!(decoded.detail.is_empty());
        assert!(decoded.metadata.is_empty());
    }
}
