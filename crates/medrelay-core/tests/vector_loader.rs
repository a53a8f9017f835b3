//! Wire vectors stored as JSON under `tests/vectors/`.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(dead_code)]

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

/// Raw bytes of a vector, tagged with how they are written down.
#[derive(Debug, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum RawBytes {
    Hex(String),
}

impl RawBytes {
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            RawBytes::Hex(s) => hex::decode(s).expect("vector hex"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Rejection {
    /// `ClientCode::as_str` of the resulting error.
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct WireVector {
    pub description: String,
    pub frame: RawBytes,
    #[serde(default)]
    pub expect: Option<Value>,
    #[serde(default)]
    pub expect_error: Option<Rejection>,
}

pub fn load(file: &str) -> WireVector {
    let path: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests", "vectors", file].iter().collect();
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("{}: {e}", path.display()));
    serde_json::from_str(&text).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}
