//! Async relay client.
//!
//! A background driver task owns the socket: it writes queued frames, feeds
//! reads through a `StreamReassembler`, sends heartbeats and reconnects with
//! backoff when the connection dies. Handles talk to it through a frame queue.
//!
//! Queued frames carry the session generation they were meant for. When a
//! session dies the generation moves on, and frames still queued for the
//! dead session are dropped instead of being written to the next one.
//!
//! Frame routing on the client side:
//! - `JsonResponse` with `request_uuid` -> the waiting `request` call
//! - `HeartbeatPong` -> disarms the pong timeout
//! - upload acks, download chunks, transfer errors -> the active transfer

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use medrelay_core::error::RelayError;
use medrelay_core::protocol::{
    encode, encode_json, request_uuid_of, Frame, MessageType, Request, StreamEvent,
    StreamReassembler, FILE_CHUNK_SIZE,
};

use crate::backoff::Backoff;
use crate::error::{ClientError, Result};

const READ_BUF: usize = 64 * 1024;
const OUTBOUND_QUEUE: usize = 1024;
const PING_PAYLOAD: &[u8] = br#"{"ping":true}"#;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: String,
    pub heartbeat_interval: Duration,
    /// Connection is considered dead when no pong arrives within this window.
    pub heartbeat_timeout: Duration,
    pub request_timeout: Duration,
    /// Max wait for any single transfer step (ack, chunk, complete).
    pub transfer_timeout: Duration,
    pub chunk_size: usize,
    pub reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(30),
            chunk_size: FILE_CHUNK_SIZE,
            reconnect: true,
            initial_backoff: crate::backoff::DEFAULT_INITIAL_BACKOFF,
            max_backoff: crate::backoff::DEFAULT_MAX_BACKOFF,
        }
    }
}

/// A frame queued for the session of `generation`.
struct Outbound {
    generation: u64,
    frame: Bytes,
}

enum TransferEvent {
    Frame(Frame),
    Disconnected,
}

struct Shared {
    pending: DashMap<String, oneshot::Sender<Value>>,
    transfer_sink: StdMutex<Option<mpsc::UnboundedSender<TransferEvent>>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    generation: AtomicU64,
}

impl Shared {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn sink(&self) -> StdMutexGuard<'_, Option<mpsc::UnboundedSender<TransferEvent>>> {
        self.transfer_sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, frame: Frame) {
        match frame.msg_type {
            MessageType::JsonResponse => {
                let value: Value = match serde_json::from_slice(&frame.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "undecodable response dropped");
                        return;
                    }
                };
                match request_uuid_of(&value).map(str::to_string) {
                    Some(uuid) => match self.pending.remove(&uuid) {
                        Some((_, tx)) => {
                            let _ = tx.send(value);
                        }
                        None => debug!(%uuid, "response for unknown request dropped"),
                    },
                    None => self.to_transfer(frame),
                }
            }
            MessageType::ErrorResponse
            | MessageType::FileTransferError
            | MessageType::FileDownloadChunk
            | MessageType::FileDownloadComplete => self.to_transfer(frame),
            other => debug!(msg_type = other.as_str(), "unexpected frame ignored"),
        }
    }

    fn to_transfer(&self, frame: Frame) {
        match self.sink().as_ref() {
            Some(tx) => {
                let _ = tx.send(TransferEvent::Frame(frame));
            }
            None if frame.msg_type == MessageType::ErrorResponse => {
                warn!(body = %String::from_utf8_lossy(&frame.payload), "gateway error response");
            }
            None => debug!(msg_type = frame.msg_type.as_str(), "no transfer active, frame dropped"),
        }
    }

    /// Connection lost: every waiter learns about it now, and frames still
    /// queued for the lost session become stale.
    fn fail_in_flight(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
        if let Some(tx) = self.sink().as_ref() {
            let _ = tx.send(TransferEvent::Disconnected);
        }
    }
}

/// Cloneable handle to one logical client connection.
#[derive(Clone)]
pub struct RelayClient {
    cfg: Arc<ClientConfig>,
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<Outbound>,
    transfer_lock: Arc<Mutex<()>>,
}

impl RelayClient {
    /// Connect once (failing fast), then keep the connection alive in the
    /// background.
    pub async fn connect(cfg: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(&cfg.addr).await?;
        info!(addr = %cfg.addr, "connected");

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (connected, _) = watch::channel(true);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            transfer_sink: StdMutex::new(None),
            connected,
            shutdown,
            generation: AtomicU64::new(0),
        });
        let cfg = Arc::new(cfg);

        tokio::spawn(drive(
            Arc::clone(&cfg),
            Arc::clone(&shared),
            Some(stream),
            out_rx,
        ));

        Ok(Self {
            cfg,
            shared,
            out_tx,
            transfer_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Wait until the driver reports a live connection.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.connected.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|up| *up))
            .await
            .map_err(|_| ClientError::Timeout("connection"))?
            .map_err(|_| ClientError::Closed)?;
        Ok(())
    }

    /// Stop the driver. In-flight requests fail with `Disconnected`.
    pub fn close(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Send `action` with `fields` and wait for the correlated response.
    pub async fn call(&self, action: &str, fields: Map<String, Value>) -> Result<Value> {
        let mut req = Request::new(action);
        req.fields = fields;
        self.request(req).await
    }

    pub async fn request(&self, req: Request) -> Result<Value> {
        self.request_with_timeout(req, self.cfg.request_timeout).await
    }

    /// Like `request` with an explicit deadline (long polls need more than the
    /// default).
    pub async fn request_with_timeout(&self, mut req: Request, timeout: Duration) -> Result<Value> {
        let uuid = req
            .uuid()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        req.uuid = Some(uuid.clone());
        let frame = encode_json(MessageType::JsonRequest, &req)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(uuid.clone(), tx);
        if let Err(e) = self.send_frame(frame).await {
            self.shared.pending.remove(&uuid);
            return Err(e);
        }
        debug!(%uuid, action = %req.action, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.shared.pending.remove(&uuid);
                Err(ClientError::Timeout("response"))
            }
        }
    }

    /// Upload a local file under `name`. Returns the gateway's result body.
    pub async fn upload_file(&self, local: impl AsRef<Path>, name: &str) -> Result<Value> {
        let file = tokio::fs::File::open(local.as_ref()).await?;
        let size = file.metadata().await?.len();
        self.upload_reader(name, size, file).await
    }

    pub async fn upload_bytes(&self, name: &str, data: &[u8]) -> Result<Value> {
        self.upload_reader(name, data.len() as u64, data).await
    }

    async fn upload_reader<R: AsyncRead + Unpin>(&self, name: &str, size: u64, mut reader: R) -> Result<Value> {
        let mut t = self.begin_transfer().await;
        let step = self.cfg.transfer_timeout;

        let meta = json!({ "name": name, "size": size });
        self.send_transfer_frame(&t, encode_json(MessageType::FileUploadMeta, &meta)?).await?;
        expect_json(t.next(step).await?)?;

        let mut sent: u64 = 0;
        loop {
            let block = read_block(&mut reader, self.cfg.chunk_size).await?;
            if block.is_empty() {
                break;
            }
            sent += block.len() as u64;
            let last = block.len() < self.cfg.chunk_size;
            self.send_transfer_frame(&t, encode(MessageType::FileUploadChunk, &block)).await?;
            if last {
                break;
            }
        }

        let complete = json!({ "name": name, "size": sent });
        self.send_transfer_frame(&t, encode_json(MessageType::FileUploadComplete, &complete)?).await?;
        let result = expect_json(t.next(step).await?)?;
        info!(file = name, size = sent, "upload finished");
        Ok(result)
    }

    /// Download `name` into a local file. Returns the byte count.
    pub async fn download_file(&self, name: &str, local: impl AsRef<Path>) -> Result<u64> {
        let mut file = tokio::fs::File::create(local.as_ref()).await?;
        self.download_into(name, &mut file).await
    }

    pub async fn download_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.download_into(name, &mut out).await?;
        Ok(out)
    }

    async fn download_into<W: AsyncWrite + Unpin>(&self, name: &str, sink: &mut W) -> Result<u64> {
        let mut t = self.begin_transfer().await;
        let step = self.cfg.transfer_timeout;

        let req = json!({ "name": name });
        self.send_transfer_frame(&t, encode_json(MessageType::FileDownloadRequest, &req)?).await?;

        let mut received: u64 = 0;
        loop {
            let frame = t.next(step).await?;
            match frame.msg_type {
                MessageType::FileDownloadChunk => {
                    sink.write_all(&frame.payload).await?;
                    received += frame.payload.len() as u64;
                }
                MessageType::FileDownloadComplete => {
                    let done: Value = serde_json::from_slice(&frame.payload).map_err(RelayError::from)?;
                    let expected = done.get("size").and_then(Value::as_u64).unwrap_or(received);
                    if expected != received {
                        return Err(RelayError::SizeMismatch { expected, received }.into());
                    }
                    sink.flush().await?;
                    info!(file = name, size = received, "download finished");
                    return Ok(received);
                }
                _ => return Err(transfer_error(&frame)),
            }
        }
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let generation = self.shared.generation();
        self.enqueue(generation, frame).await
    }

    /// Send on the session the transfer started on. Fails once that session
    /// is gone, so no part of a transfer reaches a later connection.
    async fn send_transfer_frame(&self, t: &Transfer<'_>, frame: Bytes) -> Result<()> {
        if self.shared.generation() != t.generation {
            return Err(ClientError::Disconnected);
        }
        self.enqueue(t.generation, frame).await
    }

    async fn enqueue(&self, generation: u64, frame: Bytes) -> Result<()> {
        self.out_tx
            .send(Outbound { generation, frame })
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// One transfer at a time per client; the sink is installed until the
    /// guard drops.
    async fn begin_transfer(&self) -> Transfer<'_> {
        let lock = self.transfer_lock.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.sink() = Some(tx);
        Transfer {
            _lock: lock,
            shared: &self.shared,
            generation: self.shared.generation(),
            rx,
        }
    }
}

struct Transfer<'a> {
    _lock: MutexGuard<'a, ()>,
    shared: &'a Shared,
    generation: u64,
    rx: mpsc::UnboundedReceiver<TransferEvent>,
}

impl Transfer<'_> {
    async fn next(&mut self, timeout: Duration) -> Result<Frame> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(TransferEvent::Frame(f))) => Ok(f),
            Ok(Some(TransferEvent::Disconnected)) | Ok(None) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout("transfer")),
        }
    }
}

impl Drop for Transfer<'_> {
    fn drop(&mut self) {
        *self.shared.sink() = None;
    }
}

fn expect_json(frame: Frame) -> Result<Value> {
    match frame.msg_type {
        MessageType::JsonResponse => Ok(serde_json::from_slice(&frame.payload).map_err(RelayError::from)?),
        _ => Err(transfer_error(&frame)),
    }
}

fn transfer_error(frame: &Frame) -> ClientError {
    let body: Value = serde_json::from_slice(&frame.payload).unwrap_or(Value::Null);
    match frame.msg_type {
        MessageType::FileTransferError => ClientError::Transfer {
            code: body
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(0),
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        MessageType::ErrorResponse => ClientError::Gateway(
            body.get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        ),
        other => ClientError::Relay(RelayError::BadRequest(format!(
            "unexpected frame during transfer: {}",
            other.as_str()
        ))),
    }
}

async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

enum SessionEnd {
    Shutdown,
    Lost(&'static str),
}

async fn drive(
    cfg: Arc<ClientConfig>,
    shared: Arc<Shared>,
    mut stream: Option<TcpStream>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    let mut backoff = Backoff::new(cfg.initial_backoff, cfg.max_backoff);
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        let s = match stream.take() {
            Some(s) => s,
            None => match TcpStream::connect(&cfg.addr).await {
                Ok(s) => {
                    info!(addr = %cfg.addr, "reconnected");
                    s
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(addr = %cfg.addr, error = %e, delay_ms = delay.as_millis() as u64, "connect failed");
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };
        if let Err(e) = s.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        backoff.reset();
        shared.connected.send_replace(true);

        let generation = shared.generation();
        let end = run_session(&cfg, &shared, s, generation, &mut out_rx, &mut shutdown).await;
        shared.connected.send_replace(false);
        shared.fail_in_flight();

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost(reason) => {
                if !cfg.reconnect {
                    warn!(reason, "connection lost");
                    break;
                }
                let delay = backoff.next_delay();
                warn!(reason, delay_ms = delay.as_millis() as u64, "connection lost, reconnecting");
                if wait_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    shared.connected.send_replace(false);
    debug!("client driver stopped");
}

/// Sleep for `delay`; true if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow_and_update() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

async fn run_session(
    cfg: &ClientConfig,
    shared: &Shared,
    stream: TcpStream,
    generation: u64,
    out_rx: &mut mpsc::Receiver<Outbound>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut rd, mut wr) = stream.into_split();
    let mut reasm = StreamReassembler::new();
    let mut buf = vec![0u8; READ_BUF];

    let mut ping = tokio::time::interval_at(
        Instant::now() + cfg.heartbeat_interval,
        cfg.heartbeat_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_wait = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            out = out_rx.recv() => {
                let Some(out) = out else {
                    return SessionEnd::Shutdown;
                };
                if out.generation != generation {
                    debug!(stale = out.generation, generation, "frame of a lost session dropped");
                    continue;
                }
                if wr.write_all(&out.frame).await.is_err() {
                    return SessionEnd::Lost("write failed");
                }
            }

            n = rd.read(&mut buf) => {
                let n = match n {
                    Ok(0) => return SessionEnd::Lost("closed by peer"),
                    Ok(n) => n,
                    Err(_) => return SessionEnd::Lost("read failed"),
                };
                for ev in reasm.append(&buf[..n]) {
                    match ev {
                        StreamEvent::Frame(f) if f.msg_type == MessageType::HeartbeatPong => {
                            pong_deadline = None;
                        }
                        StreamEvent::Frame(f) => shared.route(f),
                        StreamEvent::ProtocolError(v) => {
                            warn!(error = %v, "protocol error from gateway");
                            return SessionEnd::Lost("protocol error");
                        }
                    }
                }
            }

            _ = ping.tick() => {
                if wr.write_all(&encode(MessageType::HeartbeatPing, PING_PAYLOAD)).await.is_err() {
                    return SessionEnd::Lost("write failed");
                }
                pong_deadline = Some(Instant::now() + cfg.heartbeat_timeout);
            }

            _ = pong_wait => {
                warn!("heartbeat timeout");
                return SessionEnd::Lost("heartbeat timeout");
            }

            _ = shutdown.changed() => {
                return SessionEnd::Shutdown;
            }
        }
    }
}
