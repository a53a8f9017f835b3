use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use medrelay_core::error::Result;
use medrelay_core::protocol::{Request, Response};

use crate::routing::Responder;

/// Business handler. Receives every request whose `action` it registered for
/// and answers through the `Responder`, possibly much later (long poll).
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn actions(&self) -> &'static [&'static str];
    async fn handle(&self, req: Request, responder: Responder) -> Result<()>;
}

/// Action registry. Each action belongs to exactly one handler; the last
/// registration wins.
#[derive(Default)]
pub struct Dispatcher {
    actions: DashMap<&'static str, Arc<dyn BusinessHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            actions: DashMap::new(),
        }
    }

    pub fn register(&self, handler: Arc<dyn BusinessHandler>) {
        for &action in handler.actions() {
            if let Some(prev) = self.actions.insert(action, Arc::clone(&handler)) {
                warn!(action, prev = prev.name(), next = handler.name(), "action re-registered");
            }
        }
    }

    pub fn registered_actions(&self) -> Vec<&'static str> {
        let mut v: Vec<_> = self.actions.iter().map(|e| *e.key()).collect();
        v.sort_unstable();
        v
    }

    /// Hand `req` to its handler. Unknown actions and handler errors are
    /// answered here so the client always gets a response.
    pub async fn dispatch(&self, req: Request, responder: Responder) {
        let handler = self
            .actions
            .get(req.action.as_str())
            .map(|e| Arc::clone(e.value()));

        let Some(handler) = handler else {
            debug!(action = %req.action, "unknown action");
            responder.reply(Response::unknown_action(&req.action)).await;
            return;
        };

        let kind = Response::kind_for(&req.action);
        if let Err(e) = handler.handle(req, responder.clone()).await {
            warn!(handler = handler.name(), error = %e, "handler failed");
            responder.reply(Response::fail(kind, e.to_string())).await;
        }
    }
}
