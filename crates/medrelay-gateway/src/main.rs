//! medrelay gateway binary.
//!
//! - Framed TCP listener (relay protocol)
//! - Optional ops HTTP listener (/healthz, /readyz, /metrics)
//! - Ctrl-C flips draining and stops the accept loop

use std::net::SocketAddr;

use tracing_subscriber::{fmt, EnvFilter};

use medrelay_gateway::{app_state::AppState, config, router, transport};

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "medrelay.yaml".to_string());
    let cfg = config::load_from_file(&path).expect("config load failed");
    let listen: SocketAddr = cfg
        .gateway
        .listen
        .parse()
        .expect("gateway.listen must be a valid SocketAddr");
    let ops_listen: Option<SocketAddr> = cfg
        .gateway
        .ops_listen
        .as_deref()
        .map(|s| s.parse().expect("gateway.ops_listen must be a valid SocketAddr"));

    let state = AppState::new(cfg).expect("app state init failed");

    if let Some(ops_listen) = ops_listen {
        let ops = router::build_ops_router(state.clone());
        let listener = tokio::net::TcpListener::bind(ops_listen)
            .await
            .expect("failed to bind ops listener");
        tracing::info!(%ops_listen, "ops endpoints listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, ops).await {
                tracing::error!(error = %e, "ops server failed");
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, draining");
                state.set_draining();
            }
        });
    }

    tracing::info!(%listen, config = %path, "medrelay-gateway starting");
    let listener = tokio::net::TcpListener::bind(listen).await.expect("failed to bind");
    transport::serve(state, listener).await.expect("server failed");
}
