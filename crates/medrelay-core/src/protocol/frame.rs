//! Fixed-header binary frame codec (panic-free).
//!
//! Wire layout, big-endian:
//!
//! ```text
//! magic:4 | version:1 | type:2 | payload_len:4 | payload:payload_len
//! ```
//!
//! Parsing rules:
//! - Never index (`buf[0]`); always go through `Buf` and `remaining()` checks.
//! - The codec itself never fails; bounds and constant checks belong to the
//!   reassembler, which owns the stream position.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{RelayError, Result};

/// Frame magic, rejected on mismatch.
pub const MAGIC: u32 = 0x1A2B_3C4D;
/// Wire format version.
pub const VERSION: u8 = 1;
/// magic(4) + version(1) + type(2) + payload_len(4).
pub const HEADER_LEN: usize = 11;
/// Upper bound for a declared payload length (4 MiB).
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;
/// Download chunk size (64 KiB).
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Frame type tag. Unrecognized codes are kept so the receiver can reply with
/// an `ErrorResponse` instead of tearing the stream down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    JsonRequest,
    JsonResponse,
    ErrorResponse,
    HeartbeatPing,
    HeartbeatPong,
    /// payload: JSON `{ name, size }`
    FileUploadMeta,
    /// payload: opaque bytes
    FileUploadChunk,
    /// payload: JSON `{ name, size }`
    FileUploadComplete,
    /// payload: JSON `{ name }`
    FileDownloadRequest,
    /// payload: opaque bytes
    FileDownloadChunk,
    /// payload: JSON `{ name, size }`
    FileDownloadComplete,
    /// payload: JSON `{ code, message }`
    FileTransferError,
    /// A code with no assigned type, as produced by `from_code`. Holding an
    /// assigned code here does not round-trip: `Unknown(1)` encodes as 1 and
    /// decodes as `JsonRequest`. Code 6 is unassigned; a client leaving is
    /// seen as the socket closing, not as a frame.
    Unknown(u16),
}

impl MessageType {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => MessageType::JsonRequest,
            2 => MessageType::JsonResponse,
            3 => MessageType::ErrorResponse,
            4 => MessageType::HeartbeatPing,
            5 => MessageType::HeartbeatPong,
            100 => MessageType::FileUploadMeta,
            101 => MessageType::FileUploadChunk,
            102 => MessageType::FileUploadComplete,
            110 => MessageType::FileDownloadRequest,
            111 => MessageType::FileDownloadChunk,
            112 => MessageType::FileDownloadComplete,
            199 => MessageType::FileTransferError,
            other => MessageType::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            MessageType::JsonRequest => 1,
            MessageType::JsonResponse => 2,
            MessageType::ErrorResponse => 3,
            MessageType::HeartbeatPing => 4,
            MessageType::HeartbeatPong => 5,
            MessageType::FileUploadMeta => 100,
            MessageType::FileUploadChunk => 101,
            MessageType::FileUploadComplete => 102,
            MessageType::FileDownloadRequest => 110,
            MessageType::FileDownloadChunk => 111,
            MessageType::FileDownloadComplete => 112,
            MessageType::FileTransferError => 199,
            MessageType::Unknown(code) => code,
        }
    }

    /// Whether the payload of this type is a JSON object.
    pub fn carries_json(self) -> bool {
        matches!(
            self,
            MessageType::JsonRequest
                | MessageType::JsonResponse
                | MessageType::ErrorResponse
                | MessageType::FileUploadMeta
                | MessageType::FileUploadComplete
                | MessageType::FileDownloadRequest
                | MessageType::FileDownloadComplete
                | MessageType::FileTransferError
        )
    }

    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::JsonRequest => "json_request",
            MessageType::JsonResponse => "json_response",
            MessageType::ErrorResponse => "error_response",
            MessageType::HeartbeatPing => "heartbeat_ping",
            MessageType::HeartbeatPong => "heartbeat_pong",
            MessageType::FileUploadMeta => "file_upload_meta",
            MessageType::FileUploadChunk => "file_upload_chunk",
            MessageType::FileUploadComplete => "file_upload_complete",
            MessageType::FileDownloadRequest => "file_download_request",
            MessageType::FileDownloadChunk => "file_download_chunk",
            MessageType::FileDownloadComplete => "file_download_complete",
            MessageType::FileTransferError => "file_transfer_error",
            MessageType::Unknown(_) => "unknown",
        }
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u8,
    pub msg_type: MessageType,
    pub payload_len: u32,
}

impl Header {
    /// Total frame length (header + declared payload).
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

/// One complete header+payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    /// Opaque payload (zero-copy slice of the receive buffer).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Parse the payload as a JSON object.
    pub fn json_object(&self) -> Result<Map<String, Value>> {
        match serde_json::from_slice::<Value>(&self.payload)? {
            Value::Object(map) => Ok(map),
            _ => Err(RelayError::BadRequest("payload is not a json object".into())),
        }
    }

    /// Deserialize the payload into a typed value.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode back to wire bytes.
    pub fn encode(&self) -> Bytes {
        encode(self.msg_type, &self.payload)
    }
}

/// Decode the fixed header from the front of `buf` without consuming it.
/// Returns `None` when fewer than `HEADER_LEN` bytes are available.
pub fn decode_header(buf: &[u8]) -> Option<Header> {
    let mut buf = buf;
    if buf.remaining() < HEADER_LEN {
        return None;
    }
    let magic = buf.get_u32();
    let version = buf.get_u8();
    let msg_type = MessageType::from_code(buf.get_u16());
    let payload_len = buf.get_u32();
    Some(Header {
        magic,
        version,
        msg_type,
        payload_len,
    })
}

/// Prepend the fixed header to `payload`.
pub fn encode(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32(MAGIC);
    out.put_u8(VERSION);
    out.put_u16(msg_type.code());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}

/// Serialize `body` as compact JSON and frame it.
pub fn encode_json<T: Serialize + ?Sized>(msg_type: MessageType, body: &T) -> Result<Bytes> {
    let payload = serde_json::to_vec(body)
        .map_err(|e| RelayError::Internal(format!("json encode failed: {e}")))?;
    Ok(encode(msg_type, &payload))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let bytes = encode(MessageType::FileTransferError, b"{}");
        assert_eq!(&bytes[..4], &[0x1A, 0x2B, 0x3C, 0x4D]);
        assert_eq!(bytes[4], VERSION);
        assert_eq!(&bytes[5..7], &[0x00, 199]);
        assert_eq!(&bytes[7..11], &[0, 0, 0, 2]);
        assert_eq!(&bytes[11..], b"{}");
    }

    #[test]
    fn decode_header_needs_full_header() {
        let bytes = encode(MessageType::HeartbeatPing, b"");
        assert!(decode_header(&bytes[..HEADER_LEN - 1]).is_none());
        let h = decode_header(&bytes).unwrap();
        assert_eq!(h.msg_type, MessageType::HeartbeatPing);
        assert_eq!(h.payload_len, 0);
        assert_eq!(h.frame_len(), HEADER_LEN);
    }

    #[test]
    fn unknown_codes_survive() {
        assert_eq!(MessageType::from_code(6), MessageType::Unknown(6));
        assert_eq!(MessageType::Unknown(6).code(), 6);
        assert!(!MessageType::Unknown(6).carries_json());
    }

    #[test]
    fn every_code_maps_back_to_itself() {
        for code in 0..=u16::MAX {
            let t = MessageType::from_code(code);
            assert_eq!(t.code(), code);
            assert_eq!(MessageType::from_code(t.code()), t);
            let assigned = !matches!(t, MessageType::Unknown(_));
            assert_eq!(
                assigned,
                matches!(code, 1..=5 | 100..=102 | 110..=112 | 199),
                "code {code}"
            );
        }
    }

    #[test]
    fn non_object_json_is_rejected() {
        let frame = Frame::new(MessageType::JsonRequest, Bytes::from_static(b"[1,2]"));
        let err = frame.json_object().unwrap_err();
        assert_eq!(err.client_code().as_str(), "BAD_REQUEST");
    }
}
