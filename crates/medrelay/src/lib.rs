//! Top-level facade crate for medrelay.
//!
//! Re-exports the wire primitives, the gateway library, and the client so users
//! can depend on a single crate.

pub mod core {
    pub use medrelay_core::*;
}

pub mod gateway {
    pub use medrelay_gateway::*;
}

pub mod client {
    pub use medrelay_client::*;
}
