use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use medrelay_core::error::{RelayError, Result};
use medrelay_core::protocol::{Request, Response};

use crate::config::ChatSection;
use crate::dispatch::BusinessHandler;
use crate::obs::GatewayMetrics;
use crate::routing::Responder;
use crate::services::long_poll::{LongPollCoordinator, PollOutcome, PollParams};
use crate::services::store::{MessageStore, NewMessage};

const HISTORY_DEFAULT_LIMIT: i64 = 20;
const HISTORY_MAX_LIMIT: i64 = 200;
const CONTACTS_DEFAULT_LIMIT: i64 = 20;
const CONTACTS_MAX_LIMIT: i64 = 100;

/// Doctor/patient chat: pairing events, messages, history, and the
/// `poll_events` long poll.
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    polls: Arc<LongPollCoordinator>,
    cfg: ChatSection,
}

impl ChatService {
    pub fn new(store: Arc<dyn MessageStore>, cfg: ChatSection, metrics: Arc<GatewayMetrics>) -> Self {
        let polls = Arc::new(LongPollCoordinator::new(Arc::clone(&store), metrics));
        Self { store, polls, cfg }
    }

    pub fn coordinator(&self) -> &Arc<LongPollCoordinator> {
        &self.polls
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    async fn request_chat(&self, req: &Request) -> Result<Response> {
        let (doctor, patient) = pair_of(req)?;
        let event = json!({
            "event_type": "chat_requested",
            "doctor_user": doctor,
            "patient_user": patient,
            "note": req.string("note"),
        });
        self.notify_pair(&doctor, &patient, event).await;
        Ok(Response::ok("request_chat_response", json!({ "status": "pending" })))
    }

    async fn accept_chat(&self, req: &Request) -> Result<Response> {
        let (doctor, patient) = pair_of(req)?;
        let event = json!({
            "event_type": "chat_accepted",
            "doctor_user": doctor,
            "patient_user": patient,
        });
        self.notify_pair(&doctor, &patient, event).await;
        Ok(Response::ok("accept_chat_response", json!({ "status": "active" })))
    }

    async fn send_message(&self, req: &Request) -> Result<Response> {
        let (doctor, patient) = pair_of(req)?;
        let file_metadata = req.fields.get("file_metadata").filter(|v| v.is_object()).cloned();

        let stored = self
            .store
            .append(NewMessage {
                doctor_user: doctor.clone(),
                patient_user: patient.clone(),
                message_id: req.string("message_id"),
                sender_user: req.string("user"),
                message_type: req.string("message_type"),
                text_content: req.string("text_content"),
                file_metadata,
            })
            .await?;

        self.polls.notify_new_data(&doctor).await;
        if patient != doctor {
            self.polls.notify_new_data(&patient).await;
        }

        Ok(Response::ok(
            "send_message_response",
            json!({
                "id": stored.id,
                "doctor_user": stored.doctor_user,
                "patient_user": stored.patient_user,
                "message_id": stored.message_id,
                "timestamp_ms": stored.timestamp_ms,
            }),
        ))
    }

    async fn history(&self, req: &Request) -> Result<Response> {
        let (doctor, patient) = pair_of(req)?;
        let before_id = req.i64_field("before_id").unwrap_or(0);
        let limit = req
            .i64_field("limit")
            .unwrap_or(HISTORY_DEFAULT_LIMIT)
            .clamp(1, HISTORY_MAX_LIMIT) as usize;

        let messages = self.store.history(&doctor, &patient, before_id, limit).await?;
        let has_more = messages.len() >= limit;
        Ok(Response::ok(
            "get_history_messages_response",
            json!({
                "doctor_user": doctor,
                "patient_user": patient,
                "messages": messages,
                "has_more": has_more,
            }),
        ))
    }

    async fn recent_contacts(&self, req: &Request) -> Result<Response> {
        let user = req.string("user");
        if user.is_empty() {
            return Err(RelayError::BadRequest("user is required".into()));
        }
        let limit = req
            .i64_field("limit")
            .unwrap_or(CONTACTS_DEFAULT_LIMIT)
            .clamp(1, CONTACTS_MAX_LIMIT) as usize;

        let contacts = self.store.recent_contacts(&user, limit).await?;
        Ok(Response::ok("recent_contacts_response", json!({ "contacts": contacts })))
    }

    async fn notify_pair(&self, doctor: &str, patient: &str, event: Value) {
        self.polls.push_event(doctor, event.clone()).await;
        if patient != doctor {
            self.polls.push_event(patient, event).await;
        }
    }
}

fn pair_of(req: &Request) -> Result<(String, String)> {
    let doctor = req.string("doctor_user");
    let patient = req.string("patient_user");
    if doctor.is_empty() || patient.is_empty() {
        return Err(RelayError::BadRequest(
            "doctor_user and patient_user are required".into(),
        ));
    }
    Ok((doctor, patient))
}

#[async_trait]
impl BusinessHandler for ChatService {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn actions(&self) -> &'static [&'static str] {
        &[
            "request_chat",
            "accept_chat",
            "send_message",
            "get_history_messages",
            "recent_contacts",
            "poll_events",
        ]
    }

    async fn handle(&self, req: Request, responder: Responder) -> Result<()> {
        let resp = match req.action.as_str() {
            "request_chat" => self.request_chat(&req).await?,
            "accept_chat" => self.accept_chat(&req).await?,
            "send_message" => self.send_message(&req).await?,
            "get_history_messages" => self.history(&req).await?,
            "recent_contacts" => self.recent_contacts(&req).await?,
            "poll_events" => {
                let params = PollParams::from_request(&req, &self.cfg)?;
                match self.polls.poll(params, responder.clone()).await? {
                    PollOutcome::Ready(data) | PollOutcome::Busy(data) => data.into_response()?,
                    PollOutcome::Parked => return Ok(()),
                }
            }
            other => return Err(RelayError::BadRequest(format!("unknown chat action: {other}"))),
        };
        responder.reply(resp).await;
        Ok(())
    }
}
