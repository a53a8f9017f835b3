//! medrelay core: transport-agnostic protocol primitives and error types.
//!
//! This crate defines the wire-level contracts (frame header, message types,
//! stream reassembly, business envelopes) shared by the gateway and the client.
//! It intentionally carries no runtime dependencies so it can be reused in
//! blocking and async contexts alike.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here.
//! All fallible paths surface as `RelayError`/`ProtocolViolation` so a
//! malformed byte stream can never crash the process.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod protocol;

/// Shared result type.
pub use error::{ClientCode, RelayError, Result};
