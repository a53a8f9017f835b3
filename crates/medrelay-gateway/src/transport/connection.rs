//! Connection actor.
//!
//! One task per accepted socket. Frames of a connection are handled strictly
//! in arrival order; router deliveries arrive through the connection's own
//! queue and are written by the same task, so the write half has exactly one
//! owner.
//!
//! Lifecycle:
//! - register the delivery queue with the router
//! - loop: deliveries / socket reads / idle deadline
//! - teardown: abort open upload, purge routes, unregister

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use medrelay_core::error::Result;
use medrelay_core::protocol::{Frame, MessageType, Request, StreamEvent, StreamReassembler};

use crate::app_state::AppState;
use crate::obs::GatewayMetrics;
use crate::routing::{ConnectionId, RequestRouter};
use crate::transport::file_transfer::{error_body, FileTransfer};
use crate::transport::writer::FrameWriter;

const READ_BUF: usize = 64 * 1024;

/// Why a connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    IdleTimeout,
    ProtocolError,
    QueueClosed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::QueueClosed => "queue_closed",
        }
    }
}

/// Per-connection state owned by the actor task.
struct Session<W> {
    id: ConnectionId,
    writer: FrameWriter<W>,
    transfer: FileTransfer,
    router: Arc<RequestRouter>,
    metrics: Arc<GatewayMetrics>,
}

/// Drive one connection until it closes. Teardown always runs.
pub async fn run_connection<S>(app: AppState, stream: S, peer: Option<SocketAddr>) -> Result<CloseReason>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cfg = app.cfg();
    let metrics = app.metrics();
    let router = app.router();

    let (mut rd, wr) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Value>(cfg.gateway.outbound_queue);
    let id = router.connect(tx, peer);

    metrics.connections_accepted.inc(&[]);
    metrics.connections_active.inc(&[]);
    info!(conn = id, ?peer, "connection opened");

    let mut sess = Session {
        id,
        writer: FrameWriter::new(wr, Arc::clone(&metrics)),
        transfer: FileTransfer::new(&cfg.files.base_dir, cfg.protocol.file_chunk_bytes),
        router: Arc::clone(&router),
        metrics: Arc::clone(&metrics),
    };
    let mut reasm = StreamReassembler::with_max_packet(cfg.protocol.max_packet_bytes);
    let idle = Duration::from_millis(cfg.gateway.idle_timeout_ms);

    let result = session_loop(&mut sess, &mut rd, &mut rx, &mut reasm, idle).await;

    // teardown
    sess.transfer.abort().await;
    let purged = router.disconnect(id);
    let _ = sess.writer.shutdown().await;
    metrics.connections_active.dec(&[]);

    match &result {
        Ok(reason) => info!(conn = id, reason = reason.as_str(), purged, "connection closed"),
        Err(e) => info!(conn = id, error = %e, purged, "connection closed with error"),
    }
    result
}

async fn session_loop<R, W>(
    sess: &mut Session<W>,
    rd: &mut R,
    rx: &mut mpsc::Receiver<Value>,
    reasm: &mut StreamReassembler,
    idle: Duration,
) -> Result<CloseReason>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; READ_BUF];
    let mut deadline = Instant::now() + idle;

    loop {
        tokio::select! {
            delivered = rx.recv() => {
                let Some(payload) = delivered else {
                    return Ok(CloseReason::QueueClosed);
                };
                sess.writer.send_json(MessageType::JsonResponse, &payload).await?;
            }

            n = rd.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(CloseReason::PeerClosed);
                }
                deadline = Instant::now() + idle;

                for ev in reasm.append(&buf[..n]) {
                    match ev {
                        StreamEvent::Frame(frame) => sess.handle_frame(frame).await?,
                        StreamEvent::ProtocolError(v) => {
                            warn!(conn = sess.id, error = %v, "protocol error, closing");
                            sess.metrics.protocol_errors.inc(&[("kind", violation_kind(&v))]);
                            return Ok(CloseReason::ProtocolError);
                        }
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                debug!(conn = sess.id, "idle timeout");
                return Ok(CloseReason::IdleTimeout);
            }
        }
    }
}

fn violation_kind(v: &medrelay_core::protocol::ProtocolViolation) -> &'static str {
    use medrelay_core::protocol::ProtocolViolation as V;
    match v {
        V::BadMagic { .. } => "bad_magic",
        V::UnsupportedVersion { .. } => "bad_version",
        V::PayloadTooLarge { .. } => "too_large",
    }
}

impl<W: AsyncWrite + Unpin + Send> Session<W> {
    /// Handle one frame. Only socket write failures are returned as errors;
    /// everything else is answered on the wire.
    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        self.metrics
            .frames_in
            .inc(&[("type", frame.msg_type.as_str())]);
        debug!(conn = self.id, msg_type = frame.msg_type.as_str(), bytes = frame.payload.len(), "frame");

        match frame.msg_type {
            MessageType::HeartbeatPing => {
                self.writer.send_raw(MessageType::HeartbeatPong, b"{}").await
            }

            MessageType::JsonRequest => match Request::from_slice(&frame.payload) {
                Ok(req) => {
                    self.router.submit(self.id, req);
                    Ok(())
                }
                Err(e) => {
                    debug!(conn = self.id, error = %e, "undecodable request");
                    self.send_error_response(400, &e.to_string()).await
                }
            },

            MessageType::FileUploadMeta => {
                let out = match frame.json_object() {
                    Ok(meta) => self.transfer.begin_upload(&meta).await,
                    Err(e) => Err(e),
                };
                self.reply_transfer(out).await
            }

            MessageType::FileUploadChunk => {
                self.metrics
                    .file_bytes
                    .add(&[("direction", "in")], frame.payload.len() as u64);
                match self.transfer.append_chunk(&frame.payload).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.writer
                            .send_json(MessageType::FileTransferError, &error_body(&e))
                            .await
                    }
                }
            }

            MessageType::FileUploadComplete => {
                let out = self.transfer.finish_upload().await;
                self.reply_transfer(out).await
            }

            MessageType::FileDownloadRequest => {
                let req = match frame.json_object() {
                    Ok(req) => req,
                    Err(e) => {
                        return self
                            .writer
                            .send_json(MessageType::FileTransferError, &error_body(&e))
                            .await;
                    }
                };
                match self.transfer.download_whole(&req, &mut self.writer).await {
                    Ok(done) => {
                        self.writer
                            .send_json(MessageType::FileDownloadComplete, &done)
                            .await
                    }
                    Err(e) => {
                        self.writer
                            .send_json(MessageType::FileTransferError, &error_body(&e))
                            .await
                    }
                }
            }

            other => {
                debug!(conn = self.id, code = other.code(), "unsupported message type");
                self.send_error_response(400, "Unsupported message type").await
            }
        }
    }

    async fn reply_transfer(&mut self, out: Result<Value>) -> Result<()> {
        match out {
            Ok(body) => self.writer.send_json(MessageType::JsonResponse, &body).await,
            Err(e) => {
                self.writer
                    .send_json(MessageType::FileTransferError, &error_body(&e))
                    .await
            }
        }
    }

    async fn send_error_response(&mut self, code: u16, error: &str) -> Result<()> {
        let body = json!({
            "type": "error",
            "success": false,
            "code": code,
            "error": error,
        });
        self.writer.send_json(MessageType::ErrorResponse, &body).await
    }
}
