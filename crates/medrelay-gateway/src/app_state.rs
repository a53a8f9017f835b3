//! Shared application state for the medrelay gateway.
//!
//! Owns the single request router (and through it the dispatcher and session
//! registry), the metrics registry, and the drain signal. Cloned into every
//! connection task and ops handler.

use std::sync::Arc;

use tokio::sync::watch;

use medrelay_core::error::Result;

use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::obs::GatewayMetrics;
use crate::routing::RequestRouter;
use crate::services::{ChatService, EchoService, MemoryMessageStore};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
    router: Arc<RequestRouter>,
    metrics: Arc<GatewayMetrics>,
}

struct AppStateInner {
    cfg: GatewayConfig,
    chat: Option<Arc<ChatService>>,
    drain_tx: watch::Sender<bool>,
}

impl AppState {
    /// Build application state with the built-in services registered.
    pub fn new(cfg: GatewayConfig) -> Result<Self> {
        cfg.validate()?;

        let metrics = Arc::new(GatewayMetrics::default());
        let dispatcher = Dispatcher::new();

        let store = Arc::new(MemoryMessageStore::new());
        let chat = Arc::new(ChatService::new(store, cfg.chat.clone(), Arc::clone(&metrics)));
        dispatcher.register(chat.clone());
        dispatcher.register(Arc::new(EchoService::new()));

        tracing::info!(actions = ?dispatcher.registered_actions(), "business handlers registered");
        Ok(Self::assemble(cfg, dispatcher, metrics, Some(chat)))
    }

    /// Build application state around a caller-supplied dispatcher.
    pub fn with_dispatcher(cfg: GatewayConfig, dispatcher: Dispatcher) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::assemble(
            cfg,
            dispatcher,
            Arc::new(GatewayMetrics::default()),
            None,
        ))
    }

    fn assemble(
        cfg: GatewayConfig,
        dispatcher: Dispatcher,
        metrics: Arc<GatewayMetrics>,
        chat: Option<Arc<ChatService>>,
    ) -> Self {
        let router = Arc::new(RequestRouter::new(Arc::new(dispatcher), Arc::clone(&metrics)));
        let (drain_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(AppStateInner { cfg, chat, drain_tx }),
            router,
            metrics,
        }
    }

    pub fn cfg(&self) -> &GatewayConfig {
        &self.inner.cfg
    }

    pub fn router(&self) -> Arc<RequestRouter> {
        Arc::clone(&self.router)
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Built-in chat service, when the default handler set is in use.
    pub fn chat(&self) -> Option<Arc<ChatService>> {
        self.inner.chat.clone()
    }

    /// Stop accepting connections; `/readyz` starts failing.
    pub fn set_draining(&self) {
        self.metrics.set_draining();
        self.inner.drain_tx.send_replace(true);
    }

    pub fn is_draining(&self) -> bool {
        self.metrics.is_draining()
    }

    /// Resolves once `set_draining` has been called.
    pub async fn drained(&self) {
        let mut rx = self.inner.drain_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Gauges computed on scrape.
    pub fn metrics_extra(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("medrelay_routes_pending", self.router.pending_routes() as u64),
            ("medrelay_sessions_registered", self.router.sessions().len() as u64),
        ]
    }
}
