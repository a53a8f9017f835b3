//! Request router: correlation hub between connection actors and business
//! handlers.
//!
//! - `submit`: assign/keep the request `uuid`, record `uuid -> connection`,
//!   hand the request to the dispatcher on its own task. A uuid owned by
//!   another connection is refused.
//! - `deliver`: resolve `request_uuid` to the originating connection, remove
//!   the route, enqueue the payload on that connection's queue.
//! - `purge`: drop every route pointing at a torn-down connection.
//!
//! Connection actors are never touched directly; delivery always goes through
//! the actor's own queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use medrelay_core::protocol::{request_uuid_of, Request, Response};

use crate::dispatch::Dispatcher;
use crate::obs::GatewayMetrics;
use crate::routing::session_registry::{ConnectionId, SessionRegistry};

/// What happened to a response handed to `deliver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(ConnectionId),
    /// Handler bug: response without `request_uuid`.
    MissingRequestUuid,
    /// Unknown id, already delivered, or purged on teardown.
    NoRoute,
    /// Route existed but the connection queue is closed.
    ConnectionGone,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered(_) => "delivered",
            DeliveryOutcome::MissingRequestUuid => "missing_uuid",
            DeliveryOutcome::NoRoute => "no_route",
            DeliveryOutcome::ConnectionGone => "connection_gone",
        }
    }

    pub fn is_delivered(self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}

pub struct RequestRouter {
    sessions: SessionRegistry,
    routes: DashMap<String, ConnectionId>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<GatewayMetrics>,
}

impl RequestRouter {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            routes: DashMap::new(),
            dispatcher,
            metrics,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Number of requests still waiting for a response.
    pub fn pending_routes(&self) -> usize {
        self.routes.len()
    }

    /// Register a connection actor's delivery queue.
    pub fn connect(&self, tx: mpsc::Sender<Value>, peer: Option<SocketAddr>) -> ConnectionId {
        let id = self.sessions.register(tx, peer);
        debug!(conn = id, "connection registered");
        id
    }

    /// Unregister a connection and purge its outstanding routes.
    pub fn disconnect(&self, conn: ConnectionId) -> usize {
        self.sessions.remove(conn);
        self.purge(conn)
    }

    /// Accept a request from `conn` and broadcast it to the business layer.
    /// Returns the correlation id the response must carry.
    ///
    /// A client-chosen `uuid` already in flight for another connection is
    /// refused: the request is answered with a failure and never dispatched.
    pub fn submit(self: &Arc<Self>, conn: ConnectionId, mut req: Request) -> String {
        let uuid = match req.uuid() {
            Some(u) => u.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        req.uuid = Some(uuid.clone());

        match self.routes.entry(uuid.clone()) {
            Entry::Occupied(e) if *e.get() == conn => {
                warn!(%uuid, conn, "uuid reused while in flight on the same connection");
            }
            Entry::Occupied(e) => {
                let owner = *e.get();
                drop(e);
                warn!(%uuid, owner, conn, "uuid in flight for another connection, refused");
                self.refuse(conn, &req.action, uuid.clone());
                return uuid;
            }
            Entry::Vacant(e) => {
                e.insert(conn);
            }
        }
        info!(%uuid, action = %req.action, conn, "broadcast request");

        let responder = Responder {
            router: Arc::clone(self),
            request_uuid: uuid.clone(),
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let action = req.action.clone();
            let started = Instant::now();
            dispatcher.dispatch(req, responder).await;
            metrics
                .dispatch_duration
                .observe(&[("action", action.as_str())], started.elapsed());
        });

        uuid
    }

    /// Answer a refused request straight on the submitter's queue. No route
    /// is recorded, so the owner of the uuid keeps its response.
    fn refuse(&self, conn: ConnectionId, action: &str, uuid: String) {
        self.metrics
            .route_outcomes
            .inc(&[("outcome", "duplicate_uuid")]);
        let Some(target) = self.sessions.get(conn) else {
            return;
        };
        let payload = Response::fail(Response::kind_for(action), "request uuid already in flight")
            .correlated(uuid)
            .to_value();
        tokio::spawn(async move {
            if target.tx.send(payload).await.is_err() {
                debug!(conn, "connection queue closed, refusal dropped");
            }
        });
    }

    /// True while a response for `uuid` still has a live connection to go to.
    pub fn route_is_live(&self, uuid: &str) -> bool {
        self.routes
            .get(uuid)
            .is_some_and(|conn| self.sessions.contains(*conn))
    }

    /// Route a business response back to the connection that asked for it.
    pub async fn deliver(&self, payload: Value) -> DeliveryOutcome {
        let outcome = self.deliver_inner(payload).await;
        self.metrics
            .route_outcomes
            .inc(&[("outcome", outcome.as_str())]);
        outcome
    }

    async fn deliver_inner(&self, payload: Value) -> DeliveryOutcome {
        let Some(uuid) = request_uuid_of(&payload).map(str::to_string) else {
            warn!("response without request_uuid dropped");
            return DeliveryOutcome::MissingRequestUuid;
        };

        let Some((_, conn_id)) = self.routes.remove(&uuid) else {
            debug!(%uuid, "no route for response, dropped");
            return DeliveryOutcome::NoRoute;
        };

        let Some(conn) = self.sessions.get(conn_id) else {
            debug!(%uuid, conn = conn_id, "connection gone, response dropped");
            return DeliveryOutcome::ConnectionGone;
        };

        if conn.tx.send(payload).await.is_err() {
            debug!(%uuid, conn = conn_id, "connection queue closed, response dropped");
            return DeliveryOutcome::ConnectionGone;
        }

        info!(%uuid, conn = conn_id, "response routed");
        DeliveryOutcome::Delivered(conn_id)
    }

    /// Remove every outstanding route targeting `conn`.
    pub fn purge(&self, conn: ConnectionId) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, target| *target != conn);
        let purged = before.saturating_sub(self.routes.len());
        if purged > 0 {
            info!(conn, purged, "purged routes of closed connection");
        }
        purged
    }
}

/// Delivery capability handed to a business handler for one request.
#[derive(Clone)]
pub struct Responder {
    router: Arc<RequestRouter>,
    request_uuid: String,
}

impl Responder {
    pub fn request_uuid(&self) -> &str {
        &self.request_uuid
    }

    /// Whether a reply would still find its connection.
    pub fn is_live(&self) -> bool {
        self.router.route_is_live(&self.request_uuid)
    }

    /// Correlate `resp` with the originating request and deliver it.
    pub async fn reply(&self, resp: Response) -> DeliveryOutcome {
        let payload = resp.correlated(self.request_uuid.clone()).to_value();
        self.router.deliver(payload).await
    }

    /// Deliver a raw JSON object, stamping `request_uuid` onto it.
    pub async fn reply_value(&self, mut payload: Value) -> DeliveryOutcome {
        if let Value::Object(map) = &mut payload {
            map.insert("request_uuid".into(), Value::String(self.request_uuid.clone()));
        }
        self.router.deliver(payload).await
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("request_uuid", &self.request_uuid)
            .finish()
    }
}
