//! Transport layer (framed TCP).
//!
//! Owns the socket side of the gateway: accept loop, per-connection actor,
//! frame writer, and the file transfer state machine that runs inside each
//! actor without touching the router.

pub mod connection;
pub mod file_transfer;
pub mod listener;
pub mod writer;

pub use connection::{run_connection, CloseReason};
pub use file_transfer::{ChunkSink, FileTransfer};
pub use listener::serve;
