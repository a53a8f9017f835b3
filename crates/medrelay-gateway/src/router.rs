//! Axum router wiring for the ops listener.
//!
//! The relay protocol itself runs on raw TCP (`transport::serve`); HTTP only
//! carries health, readiness and metrics.

use axum::{routing::get, Router};

use crate::{app_state::AppState, ops};

pub fn build_ops_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .route("/metrics", get(ops::metrics))
        .with_state(state)
}
