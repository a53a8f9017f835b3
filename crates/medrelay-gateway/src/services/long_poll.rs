//! Long-poll event coordinator.
//!
//! A poll either answers at once (instant events queued, or stored messages
//! newer than the cursor) or parks under its user with a timer. A parked poll
//! is fulfilled by exactly one of: new message for the user, instant event
//! for the user, or its timer. Whichever comes first removes the entry; the
//! others find nothing and do nothing.
//!
//! At most one poll is parked per user. A second poll while one is parked
//! gets an immediate empty answer and the parked one is left alone, unless
//! the parked poll's connection has closed, in which case it is replaced.
//!
//! The store check and the park happen under the same lock as the triggers,
//! so a message committed between the two cannot be missed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use medrelay_core::error::{RelayError, Result};
use medrelay_core::protocol::{Request, Response};

use crate::config::ChatSection;
use crate::obs::GatewayMetrics;
use crate::routing::Responder;
use crate::services::store::{ChatMessage, MessageStore};

pub const POLL_RESPONSE: &str = "poll_events_response";

/// Normalized `poll_events` request.
#[derive(Debug, Clone, PartialEq)]
pub struct PollParams {
    pub user: String,
    pub cursor: i64,
    pub timeout: Duration,
    pub limit: usize,
}

impl PollParams {
    pub fn from_request(req: &Request, cfg: &ChatSection) -> Result<Self> {
        let user = req.string("user");
        if user.is_empty() {
            return Err(RelayError::BadRequest("poll_events requires user".into()));
        }
        let cursor = req.i64_field("cursor").unwrap_or(0);
        let timeout_sec = req
            .i64_field("timeout_sec")
            .unwrap_or(cfg.default_poll_timeout_sec as i64)
            .clamp(1, cfg.max_poll_timeout_sec as i64);
        let limit = req
            .i64_field("limit")
            .unwrap_or(cfg.default_poll_limit as i64)
            .clamp(1, cfg.max_poll_limit as i64);

        Ok(Self {
            user,
            cursor,
            timeout: Duration::from_secs(timeout_sec as u64),
            limit: limit as usize,
        })
    }
}

/// `data` of a `poll_events_response`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollData {
    pub messages: Vec<ChatMessage>,
    pub instant_events: Vec<Value>,
    pub next_cursor: i64,
    pub has_more: bool,
}

impl PollData {
    pub fn empty(cursor: i64) -> Self {
        Self {
            messages: Vec::new(),
            instant_events: Vec::new(),
            next_cursor: cursor,
            has_more: false,
        }
    }

    pub fn into_response(self) -> Result<Response> {
        Ok(Response::ok(POLL_RESPONSE, serde_json::to_value(self)?))
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Data was available; answer now.
    Ready(PollData),
    /// Another poll of the same user is parked; answer now with nothing.
    Busy(PollData),
    /// Parked; the coordinator answers later through the responder.
    Parked,
}

struct PendingPoll {
    params: PollParams,
    responder: Responder,
    ticket: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct PollState {
    pending: HashMap<String, PendingPoll>,
    instant: HashMap<String, VecDeque<Value>>,
}

pub struct LongPollCoordinator {
    store: Arc<dyn MessageStore>,
    state: Mutex<PollState>,
    metrics: Arc<GatewayMetrics>,
    seq: AtomicU64,
}

impl LongPollCoordinator {
    pub fn new(store: Arc<dyn MessageStore>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            store,
            state: Mutex::new(PollState::default()),
            metrics,
            seq: AtomicU64::new(1),
        }
    }

    pub async fn pending_polls(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_parked(&self, user: &str) -> bool {
        self.state.lock().await.pending.contains_key(user)
    }

    pub async fn poll(self: &Arc<Self>, params: PollParams, responder: Responder) -> Result<PollOutcome> {
        let mut st = self.state.lock().await;

        let has_instant = st.instant.get(&params.user).is_some_and(|q| !q.is_empty());
        let has_new = !has_instant
            && !self
                .store
                .since_for_user(&params.user, params.cursor, 1)
                .await?
                .is_empty();

        if has_instant || has_new {
            let data = self.collect(&mut st, &params).await?;
            self.metrics.polls.inc(&[("outcome", "immediate")]);
            return Ok(PollOutcome::Ready(data));
        }

        match st.pending.get(&params.user).map(|p| p.responder.is_live()) {
            Some(true) => {
                debug!(user = %params.user, "poll already parked, answering empty");
                self.metrics.polls.inc(&[("outcome", "busy")]);
                return Ok(PollOutcome::Busy(PollData::empty(params.cursor)));
            }
            Some(false) => {
                if let Some(stale) = st.pending.remove(&params.user) {
                    stale.timer.abort();
                }
                debug!(user = %params.user, "parked poll of a closed connection replaced");
            }
            None => {}
        }

        let ticket = self.seq.fetch_add(1, Ordering::Relaxed);
        let timer = spawn_timer(Arc::downgrade(self), params.user.clone(), ticket, params.timeout);
        info!(user = %params.user, cursor = params.cursor, timeout_s = params.timeout.as_secs(), "poll parked");
        st.pending.insert(
            params.user.clone(),
            PendingPoll {
                params,
                responder,
                ticket,
                timer,
            },
        );
        self.metrics.polls.inc(&[("outcome", "parked")]);
        Ok(PollOutcome::Parked)
    }

    /// A message for `user` was committed.
    pub async fn notify_new_data(&self, user: &str) {
        self.fulfill(user, None, "message").await;
    }

    /// Queue an instant event for `user` and wake their parked poll.
    pub async fn push_event(&self, user: &str, event: Value) {
        {
            let mut st = self.state.lock().await;
            st.instant.entry(user.to_string()).or_default().push_back(event);
        }
        self.fulfill(user, None, "event").await;
    }

    async fn expire(&self, user: &str, ticket: u64) {
        self.fulfill(user, Some(ticket), "timeout").await;
    }

    /// Take the parked poll of `user` and answer it. With `ticket`, only the
    /// poll that armed that timer is taken.
    ///
    /// A poll whose connection is gone is discarded without draining the
    /// instant queue. Events drained into an answer that could not be
    /// delivered go back to the front of the queue, and any poll parked in
    /// the meantime is tried next.
    async fn fulfill(&self, user: &str, mut ticket: Option<u64>, trigger: &'static str) {
        loop {
            let (pending, data) = {
                let mut st = self.state.lock().await;
                let matches = st
                    .pending
                    .get(user)
                    .is_some_and(|p| ticket.map_or(true, |t| p.ticket == t));
                if !matches {
                    return;
                }
                let Some(pending) = st.pending.remove(user) else {
                    return;
                };
                if ticket.is_none() {
                    pending.timer.abort();
                }
                if !pending.responder.is_live() {
                    debug!(user, trigger, "parked poll's connection is gone, discarded");
                    self.metrics.polls.inc(&[("outcome", "abandoned")]);
                    return;
                }
                let data = self.collect(&mut st, &pending.params).await;
                (pending, data)
            };

            self.metrics.polls.inc(&[("outcome", trigger)]);
            let (resp, drained) = match data {
                Ok(data) => {
                    let drained = data.instant_events.clone();
                    (data.into_response(), drained)
                }
                Err(e) => (Err(e), Vec::new()),
            };
            let resp = resp.unwrap_or_else(|e| {
                warn!(user, error = %e, "poll data collection failed");
                Response::fail(POLL_RESPONSE, e.to_string())
            });
            let outcome = pending.responder.reply(resp).await;
            info!(user, trigger, outcome = outcome.as_str(), "parked poll fulfilled");

            if outcome.is_delivered() || drained.is_empty() {
                return;
            }
            let requeued = drained.len();
            {
                let mut st = self.state.lock().await;
                let queue = st.instant.entry(user.to_string()).or_default();
                for event in drained.into_iter().rev() {
                    queue.push_front(event);
                }
            }
            warn!(user, requeued, "poll answer undeliverable, instant events requeued");
            ticket = None;
        }
    }

    /// Drain instant events and read up to `limit` messages past the cursor.
    async fn collect(&self, st: &mut PollState, params: &PollParams) -> Result<PollData> {
        let instant_events: Vec<Value> = st
            .instant
            .remove(&params.user)
            .map(Vec::from)
            .unwrap_or_default();

        let messages = self
            .store
            .since_for_user(&params.user, params.cursor, params.limit)
            .await?;
        let next_cursor = messages.last().map_or(params.cursor, |m| m.id);
        let has_more = messages.len() >= params.limit;

        Ok(PollData {
            messages,
            instant_events,
            next_cursor,
            has_more,
        })
    }
}

fn spawn_timer(
    coord: Weak<LongPollCoordinator>,
    user: String,
    ticket: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(coord) = coord.upgrade() {
            coord.expire(&user, ticket).await;
        }
    })
}
