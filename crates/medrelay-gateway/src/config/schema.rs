use serde::Deserialize;
use medrelay_core::error::{RelayError, Result};
use medrelay_core::protocol::MAX_PACKET_SIZE;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub version: u32,

    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub protocol: ProtocolSection,

    #[serde(default)]
    pub files: FilesSection,

    #[serde(default)]
    pub chat: ChatSection,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RelayError::UnsupportedVersion);
        }

        self.gateway.validate()?;
        self.protocol.validate()?;
        self.files.validate()?;
        self.chat.validate()?;

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: 1,
            gateway: GatewaySection::default(),
            protocol: ProtocolSection::default(),
            files: FilesSection::default(),
            chat: ChatSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Ops HTTP listener (`/healthz`, `/readyz`, `/metrics`). Disabled when absent.
    #[serde(default)]
    pub ops_listen: Option<String>,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ops_listen: None,
            idle_timeout_ms: default_idle_timeout_ms(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl GatewaySection {
    pub fn validate(&self) -> Result<()> {
        if !(10000..=600000).contains(&self.idle_timeout_ms) {
            return Err(RelayError::BadRequest(
                "gateway.idle_timeout_ms must be between 10000 and 600000".into(),
            ));
        }
        if !(16..=65536).contains(&self.outbound_queue) {
            return Err(RelayError::BadRequest(
                "gateway.outbound_queue must be between 16 and 65536".into(),
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8888".into()
}
fn default_idle_timeout_ms() -> u64 {
    90000
}
fn default_outbound_queue() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolSection {
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,

    #[serde(default = "default_file_chunk_bytes")]
    pub file_chunk_bytes: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            max_packet_bytes: default_max_packet_bytes(),
            file_chunk_bytes: default_file_chunk_bytes(),
        }
    }
}

impl ProtocolSection {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PACKET_SIZE).contains(&self.max_packet_bytes) {
            return Err(RelayError::BadRequest(format!(
                "protocol.max_packet_bytes must be between 1 and {MAX_PACKET_SIZE}"
            )));
        }
        if self.file_chunk_bytes < 1024 || self.file_chunk_bytes > self.max_packet_bytes {
            return Err(RelayError::BadRequest(
                "protocol.file_chunk_bytes must be between 1024 and max_packet_bytes".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_packet_bytes() -> usize {
    MAX_PACKET_SIZE
}
fn default_file_chunk_bytes() -> usize {
    medrelay_core::protocol::FILE_CHUNK_SIZE
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesSection {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

impl FilesSection {
    pub fn validate(&self) -> Result<()> {
        if self.base_dir.trim().is_empty() {
            return Err(RelayError::BadRequest("files.base_dir must not be empty".into()));
        }
        Ok(())
    }
}

fn default_base_dir() -> String {
    "files".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatSection {
    #[serde(default = "default_max_poll_timeout_sec")]
    pub max_poll_timeout_sec: u64,

    #[serde(default = "default_max_poll_timeout_sec")]
    pub default_poll_timeout_sec: u64,

    #[serde(default = "default_poll_limit")]
    pub default_poll_limit: usize,

    #[serde(default = "default_max_poll_limit")]
    pub max_poll_limit: usize,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            max_poll_timeout_sec: default_max_poll_timeout_sec(),
            default_poll_timeout_sec: default_max_poll_timeout_sec(),
            default_poll_limit: default_poll_limit(),
            max_poll_limit: default_max_poll_limit(),
        }
    }
}

impl ChatSection {
    pub fn validate(&self) -> Result<()> {
        if !(1..=1800).contains(&self.max_poll_timeout_sec) {
            return Err(RelayError::BadRequest(
                "chat.max_poll_timeout_sec must be between 1 and 1800".into(),
            ));
        }
        if !(1..=self.max_poll_timeout_sec).contains(&self.default_poll_timeout_sec) {
            return Err(RelayError::BadRequest(
                "chat.default_poll_timeout_sec must be between 1 and max_poll_timeout_sec".into(),
            ));
        }
        if self.max_poll_limit == 0 || !(1..=self.max_poll_limit).contains(&self.default_poll_limit) {
            return Err(RelayError::BadRequest(
                "chat.default_poll_limit must be between 1 and max_poll_limit".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_poll_timeout_sec() -> u64 {
    1800
}
fn default_poll_limit() -> usize {
    50
}
fn default_max_poll_limit() -> usize {
    200
}
