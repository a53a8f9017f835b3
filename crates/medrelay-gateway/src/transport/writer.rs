//! Frame writer: the single owner of a connection's write half.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use medrelay_core::error::Result;
use medrelay_core::protocol::{encode, encode_json, MessageType};

use crate::obs::GatewayMetrics;
use crate::transport::file_transfer::ChunkSink;

pub struct FrameWriter<W> {
    inner: W,
    metrics: Arc<GatewayMetrics>,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W, metrics: Arc<GatewayMetrics>) -> Self {
        Self { inner, metrics }
    }

    pub async fn send_raw(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        let frame = encode(msg_type, payload);
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    pub async fn send_json<T: Serialize + ?Sized>(
        &mut self,
        msg_type: MessageType,
        body: &T,
    ) -> Result<()> {
        let frame = encode_json(msg_type, body)?;
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for FrameWriter<W> {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.metrics
            .file_bytes
            .add(&[("direction", "out")], chunk.len() as u64);
        self.send_raw(MessageType::FileDownloadChunk, &chunk).await
    }
}
