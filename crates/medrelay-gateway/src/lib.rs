//! medrelay gateway library entry.
//!
//! Wires the framed TCP transport, the request router, the action dispatcher
//! and the built-in business services into one gateway. Consumed by the
//! binary (`main.rs`) and by integration tests.

pub mod app_state;
pub mod config;
pub mod dispatch;
pub mod obs;
pub mod ops;
pub mod router;
pub mod routing;
pub mod services;
pub mod transport;

pub use app_state::AppState;
