#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use medrelay_core::error::{RelayError, Result};
use medrelay_core::protocol::{
    encode, encode_json, Frame, MessageType, Request, StreamEvent, StreamReassembler,
};
use medrelay_gateway::config::GatewayConfig;
use medrelay_gateway::dispatch::BusinessHandler;
use medrelay_gateway::routing::Responder;

pub fn test_config(base_dir: &Path) -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.files.base_dir = base_dir.to_string_lossy().into_owned();
    cfg.gateway.idle_timeout_ms = 10_000;
    cfg
}

/// Handler that never answers by itself: it hands every request and its
/// responder to the test, which replies whenever it wants.
pub struct HoldHandler {
    tx: mpsc::UnboundedSender<(Request, Responder)>,
}

impl HoldHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Request, Responder)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl BusinessHandler for HoldHandler {
    fn name(&self) -> &'static str {
        "hold"
    }

    fn actions(&self) -> &'static [&'static str] {
        &["hold"]
    }

    async fn handle(&self, req: Request, responder: Responder) -> Result<()> {
        self.tx
            .send((req, responder))
            .map_err(|_| RelayError::Internal("test receiver gone".into()))
    }
}

/// Handler that always fails.
pub struct FailingHandler;

#[async_trait]
impl BusinessHandler for FailingHandler {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn actions(&self) -> &'static [&'static str] {
        &["explode"]
    }

    async fn handle(&self, _req: Request, _responder: Responder) -> Result<()> {
        Err(RelayError::BadRequest("boom".into()))
    }
}

/// Client side of a framed stream.
pub struct Wire<S> {
    io: S,
    reasm: StreamReassembler,
    ready: std::collections::VecDeque<Frame>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            reasm: StreamReassembler::new(),
            ready: Default::default(),
        }
    }

    pub async fn send(&mut self, msg_type: MessageType, payload: &[u8]) {
        self.io.write_all(&encode(msg_type, payload)).await.unwrap();
    }

    pub async fn send_json(&mut self, msg_type: MessageType, body: &Value) {
        self.io
            .write_all(&encode_json(msg_type, body).unwrap())
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    /// Next frame, or `None` once the peer closed.
    pub async fn next(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(f) = self.ready.pop_front() {
                return Some(f);
            }
            let n = tokio::time::timeout(Duration::from_secs(30), self.io.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            for ev in self.reasm.append(&buf[..n]) {
                match ev {
                    StreamEvent::Frame(f) => self.ready.push_back(f),
                    StreamEvent::ProtocolError(v) => panic!("gateway sent bad frame: {v}"),
                }
            }
        }
    }

    pub async fn expect(&mut self, msg_type: MessageType) -> Frame {
        let f = self.next().await.expect("connection closed");
        assert_eq!(f.msg_type, msg_type, "payload: {:?}", String::from_utf8_lossy(&f.payload));
        f
    }

    pub async fn expect_json(&mut self, msg_type: MessageType) -> Value {
        let f = self.expect(msg_type).await;
        serde_json::from_slice(&f.payload).unwrap()
    }
}
