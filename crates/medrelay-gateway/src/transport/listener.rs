//! TCP accept loop.

use tokio::net::TcpListener;
use tracing::{info, info_span, warn, Instrument};

use medrelay_core::error::Result;

use crate::app_state::AppState;
use crate::transport::connection::run_connection;

/// Accept connections until the gateway starts draining, spawning one actor
/// task per socket.
pub async fn serve(app: AppState, listener: TcpListener) -> Result<()> {
    let local = listener.local_addr()?;
    info!(%local, "accepting connections");

    let mut next_span_id: u64 = 0;
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = app.drained() => {
                info!("draining, listener stopped");
                return Ok(());
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, error = %e, "set_nodelay failed");
        }

        next_span_id += 1;
        let span = info_span!("conn", id = next_span_id, %peer);
        let app = app.clone();
        tokio::spawn(
            async move {
                if let Err(e) = run_connection(app, stream, Some(peer)).await {
                    warn!(error = %e, "connection ended with error");
                }
            }
            .instrument(span),
        );
    }
}
