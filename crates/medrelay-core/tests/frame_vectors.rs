//! Wire vector tests for the frame codec and reassembler.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use medrelay_core::error::RelayError;
use medrelay_core::protocol::{Request, StreamEvent, StreamReassembler};

mod vector_loader;
use vector_loader::load;

#[test]
fn frame_vectors() {
    let files = [
        "heartbeat_ping.json",
        "json_request.json",
        "unknown_type.json",
        "upload_chunk.json",
        "bad_magic.json",
        "bad_version.json",
        "payload_too_large.json",
    ];

    for f in files {
        let v = load(f);
        let raw = v.frame.bytes();
        let mut r = StreamReassembler::new();
        let events = r.append(&raw);
        assert_eq!(events.len(), 1, "vector={}", v.description);

        if let Some(err) = v.expect_error {
            let StreamEvent::ProtocolError(violation) = &events[0] else {
                panic!("expected protocol error, vector={}", v.description);
            };
            let e = RelayError::from(violation.clone());
            assert_eq!(e.client_code().as_str(), err.code, "vector={}", v.description);
            assert!(e.is_fatal(), "vector={}", v.description);
            assert_eq!(r.buffered(), 0, "vector={}", v.description);
            continue;
        }

        let StreamEvent::Frame(frame) = &events[0] else {
            panic!("expected frame, vector={}", v.description);
        };
        let ex = v.expect.expect("missing expect block");

        assert_eq!(frame.msg_type.code() as u64, ex["msg_type"].as_u64().unwrap(), "vector={}", v.description);
        assert_eq!(frame.payload.len() as u64, ex["payload_len"].as_u64().unwrap(), "vector={}", v.description);

        if let Some(action) = ex.get("action").and_then(|a| a.as_str()) {
            let req = Request::from_slice(&frame.payload).unwrap();
            assert_eq!(req.action, action, "vector={}", v.description);
            assert_eq!(req.uuid(), ex["uuid"].as_str(), "vector={}", v.description);
        }

        // Re-encoding reproduces the vector byte for byte.
        assert_eq!(frame.encode().as_ref(), raw.as_slice(), "vector={}", v.description);
    }
}
