//! Gateway configuration: YAML file, strictly parsed and validated before use.

pub mod schema;

use std::path::Path;

use medrelay_core::error::{RelayError, Result};

pub use schema::{ChatSection, FilesSection, GatewayConfig, GatewaySection, ProtocolSection};

/// Read and validate the config at `path`.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<GatewayConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Internal(format!("cannot read {}: {e}", path.display())))?;
    load_from_str(&text)
}

/// Unknown keys and out-of-range values are rejected.
pub fn load_from_str(text: &str) -> Result<GatewayConfig> {
    let cfg = serde_yaml::from_str::<GatewayConfig>(text)
        .map_err(|e| RelayError::BadRequest(format!("invalid config: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
