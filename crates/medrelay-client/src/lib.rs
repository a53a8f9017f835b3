//! medrelay client.
//!
//! Speaks the framed TCP protocol to a gateway: correlated requests, heartbeat
//! with pong timeout, reconnect with bounded exponential backoff, and chunked
//! file upload/download.

pub mod backoff;
pub mod client;
pub mod error;

pub use backoff::Backoff;
pub use client::{ClientConfig, RelayClient};
pub use error::{ClientError, Result};
