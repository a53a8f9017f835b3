//! Dispatcher module exports.
//!
//! Re-exports the dispatcher and handler trait so business services can
//! depend on this module directly.

pub mod dispatcher;

pub use dispatcher::{BusinessHandler, Dispatcher};
