//! Wire protocol: fixed-header binary frames carrying JSON envelopes or opaque
//! file chunks.
//!
//! - `frame`: constants, `MessageType`, header encode/decode.
//! - `reassembler`: turns a fragmented byte stream into complete frames.
//! - `envelope`: the business request/response JSON shapes.
//!
//! All parsers are panic-free: malformed input is reported as a value
//! (`ProtocolViolation` / `RelayError`) instead of panicking or indexing raw
//! buffers.

pub mod envelope;
pub mod frame;
pub mod reassembler;

pub use envelope::{request_uuid_of, Request, Response};
pub use frame::{
    decode_header, encode, encode_json, Frame, Header, MessageType, FILE_CHUNK_SIZE, HEADER_LEN,
    MAGIC, MAX_PACKET_SIZE, VERSION,
};
pub use reassembler::{ProtocolViolation, StreamEvent, StreamReassembler};
