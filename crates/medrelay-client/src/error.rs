use thiserror::Error;

use medrelay_core::error::RelayError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection lost")]
    Disconnected,
    #[error("client closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// `FileTransferError { code, message }` from the gateway.
    #[error("file transfer failed ({code}): {message}")]
    Transfer { code: u16, message: String },
    /// `ErrorResponse` from the gateway.
    #[error("gateway error: {0}")]
    Gateway(String),
}
