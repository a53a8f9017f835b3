//! Shared error type across medrelay crates.

use thiserror::Error;

use crate::protocol::ProtocolViolation;

/// Client-facing error codes (stable API).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCode {
    /// Invalid input / malformed message.
    BadRequest,
    /// Named resource does not exist.
    NotFound,
    /// Operation not valid in the current state (e.g. no upload open).
    Conflict,
    /// Declared and received sizes disagree.
    SizeMismatch,
    /// Framing violation; terminal for the connection.
    Protocol,
    /// Unsupported config or protocol version.
    UnsupportedVersion,
    /// Internal server error.
    Internal,
}

impl ClientCode {
    /// String representation used in JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            ClientCode::BadRequest => "BAD_REQUEST",
            ClientCode::NotFound => "NOT_FOUND",
            ClientCode::Conflict => "CONFLICT",
            ClientCode::SizeMismatch => "SIZE_MISMATCH",
            ClientCode::Protocol => "PROTOCOL",
            ClientCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ClientCode::Internal => "INTERNAL",
        }
    }

    /// Numeric status carried in `FileTransferError { code, message }` bodies.
    pub fn status(self) -> u16 {
        match self {
            ClientCode::BadRequest | ClientCode::Protocol | ClientCode::UnsupportedVersion => 400,
            ClientCode::NotFound => 404,
            ClientCode::Conflict => 409,
            ClientCode::SizeMismatch => 422,
            ClientCode::Internal => 500,
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Unified error type used by core, gateway and client.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported version")]
    UnsupportedVersion,
    #[error("internal: {0}")]
    Internal(String),
}

impl RelayError {
    /// Map internal error to a stable client-facing code.
    pub fn client_code(&self) -> ClientCode {
        match self {
            RelayError::BadRequest(_) => ClientCode::BadRequest,
            RelayError::NotFound(_) => ClientCode::NotFound,
            RelayError::Conflict(_) => ClientCode::Conflict,
            RelayError::SizeMismatch { .. } => ClientCode::SizeMismatch,
            RelayError::Protocol(_) => ClientCode::Protocol,
            RelayError::Io(_) => ClientCode::Internal,
            RelayError::UnsupportedVersion => ClientCode::UnsupportedVersion,
            RelayError::Internal(_) => ClientCode::Internal,
        }
    }

    /// Whether this error must tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Protocol(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::BadRequest(format!("invalid json: {e}"))
    }
}
