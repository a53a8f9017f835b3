//! Per-connection file transfer state machine.
//!
//! Upload:   Meta{name,size} -> N x Chunk -> Complete
//! Download: Request{name}   -> N x Chunk -> Complete{name,size}
//!
//! At most one upload is open per connection. Upload bytes are staged in
//! `<name>.<transfer id>.part`, private to that upload, and renamed into
//! place only when the received byte count matches the declared size.
//! No routing or business logic lives here.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use medrelay_core::error::{RelayError, Result};

/// Receiver of download blocks, in file order.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()>;
}

#[async_trait]
impl ChunkSink for Vec<Bytes> {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.push(chunk);
        Ok(())
    }
}

#[derive(Debug)]
struct UploadState {
    name: String,
    final_path: PathBuf,
    part_path: PathBuf,
    expected: u64,
    received: u64,
    file: File,
}

#[derive(Debug)]
pub struct FileTransfer {
    base_dir: PathBuf,
    chunk_size: usize,
    upload: Option<UploadState>,
}

impl FileTransfer {
    pub fn new(base_dir: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            chunk_size: chunk_size.max(1),
            upload: None,
        }
    }

    pub fn is_uploading(&self) -> bool {
        self.upload.is_some()
    }

    /// Open a new upload. The returned ack is sent as a `JsonResponse`.
    pub async fn begin_upload(&mut self, meta: &Map<String, Value>) -> Result<Value> {
        if let Some(open) = &self.upload {
            return Err(RelayError::Conflict(format!(
                "upload of {} already in progress",
                open.name
            )));
        }

        let name = meta.get("name").and_then(Value::as_str).unwrap_or_default();
        let expected = meta.get("size").and_then(size_of);
        let Some(expected) = expected.filter(|_| !name.is_empty()) else {
            return Err(RelayError::BadRequest("invalid meta".into()));
        };

        let final_path = resolve(&self.base_dir, name)?;
        let part_path = part_path_of(&final_path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&part_path).await?;

        info!(file = name, size = expected, "upload started");
        self.upload = Some(UploadState {
            name: name.to_string(),
            final_path,
            part_path,
            expected,
            received: 0,
            file,
        });
        Ok(json!({ "file": name, "ready": true }))
    }

    /// Append one chunk to the open upload.
    pub async fn append_chunk(&mut self, data: &[u8]) -> Result<()> {
        let Some(up) = self.upload.as_mut() else {
            return Err(RelayError::Conflict("no meta".into()));
        };
        up.file.write_all(data).await?;
        up.received += data.len() as u64;
        debug!(file = %up.name, received = up.received, "upload chunk");
        Ok(())
    }

    /// Close the open upload. State is cleared whether or not it succeeds.
    pub async fn finish_upload(&mut self) -> Result<Value> {
        let Some(mut up) = self.upload.take() else {
            return Err(RelayError::Conflict("no upload in progress".into()));
        };

        if let Err(e) = up.file.flush().await {
            discard(&up.part_path).await;
            return Err(e.into());
        }
        drop(up.file);

        if up.received != up.expected {
            warn!(file = %up.name, expected = up.expected, received = up.received, "upload size mismatch");
            discard(&up.part_path).await;
            return Err(RelayError::SizeMismatch {
                expected: up.expected,
                received: up.received,
            });
        }

        if let Err(e) = fs::rename(&up.part_path, &up.final_path).await {
            discard(&up.part_path).await;
            return Err(e.into());
        }

        info!(file = %up.name, size = up.received, "upload finished");
        Ok(json!({ "uploaded": true, "file": up.name, "size": up.received }))
    }

    /// Drop any open upload and its staged bytes.
    pub async fn abort(&mut self) {
        if let Some(up) = self.upload.take() {
            drop(up.file);
            discard(&up.part_path).await;
            info!(file = %up.name, received = up.received, "upload aborted");
        }
    }

    /// Stream the named file into `sink` in `chunk_size` blocks. Every block
    /// but the last is full. Returns the body of the `FileDownloadComplete`.
    pub async fn download_whole<S: ChunkSink + ?Sized>(
        &self,
        req: &Map<String, Value>,
        sink: &mut S,
    ) -> Result<Value> {
        let name = req.get("name").and_then(Value::as_str).unwrap_or_default();
        if name.is_empty() {
            return Err(RelayError::BadRequest("invalid name".into()));
        }
        let path = resolve(&self.base_dir, name)?;
        let mut file = File::open(&path)
            .await
            .map_err(|_| RelayError::NotFound("not found".into()))?;

        let mut total: u64 = 0;
        loop {
            let block = read_block(&mut file, self.chunk_size).await?;
            if block.is_empty() {
                break;
            }
            total += block.len() as u64;
            let last = block.len() < self.chunk_size;
            sink.send_chunk(Bytes::from(block)).await?;
            if last {
                break;
            }
        }

        info!(file = name, size = total, "download finished");
        Ok(json!({ "name": name, "size": total }))
    }
}

/// `FileTransferError` body for `err`.
pub fn error_body(err: &RelayError) -> Value {
    let message = match err {
        RelayError::BadRequest(m)
        | RelayError::NotFound(m)
        | RelayError::Conflict(m)
        | RelayError::Internal(m) => m.clone(),
        RelayError::SizeMismatch { .. } => "size mismatch".to_string(),
        RelayError::Io(_) => "io failure".to_string(),
        other => other.to_string(),
    };
    json!({ "code": err.client_code().status(), "message": message })
}

async fn read_block(file: &mut File, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn size_of(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Resolve `name` under `base`. Only plain relative components are allowed.
fn resolve(base: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    let mut saw_normal = false;
    for c in rel.components() {
        match c {
            Component::Normal(_) => saw_normal = true,
            _ => return Err(RelayError::BadRequest("invalid name".into())),
        }
    }
    if !saw_normal {
        return Err(RelayError::BadRequest("invalid name".into()));
    }
    Ok(base.join(rel))
}

/// Staging path next to `path`, unique per upload so concurrent uploads of
/// one name never share a file.
fn part_path_of(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(format!(".{}.part", uuid::Uuid::new_v4().simple()));
    PathBuf::from(s)
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "partial file not removed");
    }
}
