//! Correlation routing between connections and business handlers.

pub mod request_router;
pub mod session_registry;

pub use request_router::{DeliveryOutcome, RequestRouter, Responder};
pub use session_registry::{Connection, ConnectionId, SessionRegistry};
