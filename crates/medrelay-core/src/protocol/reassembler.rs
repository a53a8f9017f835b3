//! Incremental stream reassembler.
//!
//! Socket reads arrive in arbitrary fragments. `StreamReassembler` buffers them
//! and yields every complete frame, in arrival order, before returning. At most
//! one partial frame stays buffered between calls.
//!
//! A header with the wrong magic/version or an oversized declared length is a
//! protocol violation: the buffer is discarded, exactly one `ProtocolError`
//! event is emitted and the reassembler refuses further input until `reset`.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::frame::{decode_header, Frame, MAGIC, MAX_PACKET_SIZE, VERSION};

/// Transport-tier framing violation. Always fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("invalid header: magic {found:#010x}")]
    BadMagic { found: u32 },
    #[error("invalid header: unsupported version {found}")]
    UnsupportedVersion { found: u8 },
    #[error("payload too large: {declared} > {max}")]
    PayloadTooLarge { declared: u32, max: usize },
}

/// Output of one `append` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Frame(Frame),
    ProtocolError(ProtocolViolation),
}

#[derive(Debug)]
pub struct StreamReassembler {
    buf: BytesMut,
    max_packet: usize,
    failed: bool,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::with_max_packet(MAX_PACKET_SIZE)
    }

    /// Reassembler with a tighter payload bound. Values above
    /// `MAX_PACKET_SIZE` are clamped.
    pub fn with_max_packet(max_packet: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_packet: max_packet.min(MAX_PACKET_SIZE),
            failed: false,
        }
    }

    /// Bytes currently buffered (at most one partial frame).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True once a protocol violation was reported.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.failed = false;
    }

    /// Append a chunk and extract as many complete frames as possible.
    pub fn append(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.failed {
            return events;
        }
        self.buf.extend_from_slice(chunk);

        loop {
            let Some(header) = decode_header(&self.buf) else {
                break;
            };

            if let Some(violation) = self.check(header.magic, header.version, header.payload_len) {
                self.buf.clear();
                self.failed = true;
                events.push(StreamEvent::ProtocolError(violation));
                break;
            }

            let total = header.frame_len();
            if self.buf.len() < total {
                break;
            }

            let mut raw: Bytes = self.buf.split_to(total).freeze();
            let payload = raw.split_off(super::frame::HEADER_LEN);
            events.push(StreamEvent::Frame(Frame {
                msg_type: header.msg_type,
                payload,
            }));
        }

        events
    }

    fn check(&self, magic: u32, version: u8, payload_len: u32) -> Option<ProtocolViolation> {
        if magic != MAGIC {
            return Some(ProtocolViolation::BadMagic { found: magic });
        }
        if version != VERSION {
            return Some(ProtocolViolation::UnsupportedVersion { found: version });
        }
        if payload_len as usize > self.max_packet {
            return Some(ProtocolViolation::PayloadTooLarge {
                declared: payload_len,
                max: self.max_packet,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::protocol::frame::{encode, MessageType, HEADER_LEN};

    fn frames(events: Vec<StreamEvent>) -> Vec<Frame> {
        events
            .into_iter()
            .map(|e| match e {
                StreamEvent::Frame(f) => f,
                StreamEvent::ProtocolError(v) => panic!("unexpected violation: {v}"),
            })
            .collect()
    }

    #[test]
    fn partial_header_waits() {
        let mut r = StreamReassembler::new();
        let bytes = encode(MessageType::JsonRequest, br#"{"action":"x"}"#);
        assert!(r.append(&bytes[..5]).is_empty());
        assert_eq!(r.buffered(), 5);
        let out = frames(r.append(&bytes[5..]));
        assert_eq!(out.len(), 1);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn trailing_partial_frame_stays_buffered() {
        let mut r = StreamReassembler::new();
        let a = encode(MessageType::HeartbeatPing, b"");
        let b = encode(MessageType::FileUploadChunk, b"abcdef");
        let mut wire = a.to_vec();
        wire.extend_from_slice(&b[..HEADER_LEN + 2]);

        let out = frames(r.append(&wire));
        assert_eq!(out.len(), 1);
        assert_eq!(r.buffered(), HEADER_LEN + 2);

        let out = frames(r.append(&b[HEADER_LEN + 2..]));
        assert_eq!(out[0].payload.as_ref(), b"abcdef");
    }

    #[test]
    fn configured_bound_is_clamped() {
        let r = StreamReassembler::with_max_packet(usize::MAX);
        assert_eq!(r.max_packet, MAX_PACKET_SIZE);
    }

    #[test]
    fn reset_clears_failure() {
        let mut r = StreamReassembler::new();
        let events = r.append(&[0u8; HEADER_LEN]);
        assert!(matches!(events[0], StreamEvent::ProtocolError(ProtocolViolation::BadMagic { found: 0 })));
        assert!(r.is_failed());

        r.reset();
        let out = frames(r.append(&encode(MessageType::HeartbeatPong, b"")));
        assert_eq!(out[0].msg_type, MessageType::HeartbeatPong);
    }
}
