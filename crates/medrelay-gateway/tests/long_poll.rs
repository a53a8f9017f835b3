#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use medrelay_core::protocol::Request;
use medrelay_gateway::config::ChatSection;
use medrelay_gateway::dispatch::Dispatcher;
use medrelay_gateway::obs::GatewayMetrics;
use medrelay_gateway::routing::{ConnectionId, RequestRouter};
use medrelay_gateway::services::{ChatService, MemoryMessageStore, MessageStore, NewMessage, PollParams};

struct Harness {
    router: Arc<RequestRouter>,
    chat: Arc<ChatService>,
}

impl Harness {
    fn new() -> Self {
        let metrics = Arc::new(GatewayMetrics::default());
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let chat = Arc::new(ChatService::new(store, ChatSection::default(), Arc::clone(&metrics)));
        let dispatcher = Dispatcher::new();
        dispatcher.register(chat.clone());
        let router = Arc::new(RequestRouter::new(Arc::new(dispatcher), metrics));
        Self { router, chat }
    }

    fn connect(&self) -> (ConnectionId, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(16);
        (self.router.connect(tx, None), rx)
    }

    fn poll(&self, conn: ConnectionId, user: &str, cursor: i64, timeout_sec: i64) -> String {
        let req = Request::new("poll_events")
            .with("user", user)
            .with("cursor", cursor)
            .with("timeout_sec", timeout_sec);
        self.router.submit(conn, req)
    }

    async fn seed(&self, n: usize, doctor: &str, patient: &str) {
        for i in 0..n {
            self.chat
                .store()
                .append(NewMessage {
                    doctor_user: doctor.into(),
                    patient_user: patient.into(),
                    sender_user: doctor.into(),
                    message_type: "text".into(),
                    text_content: format!("seed {i}"),
                    ..NewMessage::default()
                })
                .await
                .unwrap();
        }
    }

    async fn wait_parked(&self, user: &str) {
        for _ in 0..1000 {
            if self.chat.coordinator().is_parked(user).await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("poll for {user} never parked");
    }
}

async fn recv(rx: &mut mpsc::Receiver<Value>) -> Value {
    rx.recv().await.expect("queue closed")
}

#[tokio::test(start_paused = true)]
async fn second_poll_fails_fast_and_first_stays_parked() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    let (sender, mut sender_rx) = h.connect();
    h.seed(3, "dr", "other").await;

    let first = h.poll(conn, "pat", 3, 30);
    h.wait_parked("pat").await;

    tokio::time::advance(Duration::from_secs(1)).await;
    let second = h.poll(conn, "pat", 3, 30);

    let got = recv(&mut rx).await;
    assert_eq!(got["request_uuid"], second.as_str());
    assert_eq!(got["type"], "poll_events_response");
    assert_eq!(got["success"], true);
    assert_eq!(got["data"]["messages"], json!([]));
    assert_eq!(got["data"]["instant_events"], json!([]));
    assert_eq!(got["data"]["next_cursor"], 3);
    assert!(h.chat.coordinator().is_parked("pat").await);

    // the first poll is still answered normally
    let send = Request::new("send_message")
        .with("doctor_user", "dr")
        .with("patient_user", "pat")
        .with("user", "dr")
        .with("message_type", "text")
        .with("text_content", "hello");
    h.router.submit(sender, send);

    let got = recv(&mut rx).await;
    assert_eq!(got["request_uuid"], first.as_str());
    assert_eq!(got["data"]["next_cursor"], 4);
    assert_eq!(got["data"]["messages"][0]["text_content"], "hello");

    let sent = recv(&mut sender_rx).await;
    assert_eq!(sent["type"], "send_message_response");
    assert_eq!(sent["data"]["id"], 4);
}

#[tokio::test(start_paused = true)]
async fn parked_poll_wakes_on_new_message() {
    let h = Harness::new();
    let (poller, mut rx) = h.connect();
    let (sender, mut sender_rx) = h.connect();
    h.seed(10, "dr", "pat").await;

    let started = Instant::now();
    let uuid = h.poll(poller, "pat", 10, 30);
    h.wait_parked("pat").await;

    let send = Request::new("send_message")
        .with("doctor_user", "dr")
        .with("patient_user", "pat")
        .with("user", "dr")
        .with("message_id", "m-11")
        .with("message_type", "text")
        .with("text_content", "new");
    h.router.submit(sender, send);

    let got = recv(&mut rx).await;
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(got["request_uuid"], uuid.as_str());
    assert_eq!(got["data"]["next_cursor"], 11);
    assert_eq!(got["data"]["messages"].as_array().unwrap().len(), 1);
    assert_eq!(got["data"]["messages"][0]["id"], 11);
    assert_eq!(got["data"]["has_more"], false);
    assert!(!h.chat.coordinator().is_parked("pat").await);

    let sent = recv(&mut sender_rx).await;
    assert_eq!(sent["success"], true);
}

#[tokio::test(start_paused = true)]
async fn parked_poll_times_out_with_empty_delta() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.seed(5, "dr", "pat").await;

    let started = Instant::now();
    let uuid = h.poll(conn, "pat", 5, 2);

    let got = recv(&mut rx).await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(got["request_uuid"], uuid.as_str());
    assert_eq!(got["success"], true);
    assert_eq!(got["data"]["messages"], json!([]));
    assert_eq!(got["data"]["next_cursor"], 5);
    assert_eq!(h.chat.coordinator().pending_polls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn data_already_available_answers_immediately() {
    let h = Harness::new();
    let (conn, mut rx) = h.connect();
    h.seed(3, "dr", "pat").await;

    let started = Instant::now();
    let req = Request::new("poll_events")
        .with("user", "pat")
        .with("cursor", 0)
        .with("limit", 2);
    h.router.submit(conn, req);

    let got = recv(&mut rx).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(got["data"]["messages"].as_array().unwrap().len(), 2);
    assert_eq!(got["data"]["next_cursor"], 2);
    assert_eq!(got["data"]["has_more"], true);
}

#[tokio::test(start_paused = true)]
async fn instant_events_wake_both_parties() {
    let h = Harness::new();
    let (doc_conn, mut doc_rx) = h.connect();
    let (pat_conn, mut pat_rx) = h.connect();

    let doc_poll = h.poll(doc_conn, "dr", 0, 60);
    h.wait_parked("dr").await;

    let accept = Request::new("accept_chat")
        .with("doctor_user", "dr")
        .with("patient_user", "pat");
    let accept_uuid = h.router.submit(pat_conn, accept);

    let got = recv(&mut doc_rx).await;
    assert_eq!(got["request_uuid"], doc_poll.as_str());
    assert_eq!(got["data"]["instant_events"][0]["event_type"], "chat_accepted");
    assert_eq!(got["data"]["next_cursor"], 0);

    let ack = recv(&mut pat_rx).await;
    assert_eq!(ack["request_uuid"], accept_uuid.as_str());
    assert_eq!(ack["data"]["status"], "active");

    // the patient was not polling: the event waits in their queue
    h.poll(pat_conn, "pat", 0, 60);
    let got = recv(&mut pat_rx).await;
    assert_eq!(got["data"]["instant_events"][0]["event_type"], "chat_accepted");
    assert_eq!(got["data"]["instant_events"][0]["doctor_user"], "dr");
}

#[tokio::test(start_paused = true)]
async fn parked_poll_of_closed_connection_is_dropped() {
    let h = Harness::new();
    let (conn, rx) = h.connect();

    h.poll(conn, "pat", 0, 5);
    h.wait_parked("pat").await;
    drop(rx);
    h.router.disconnect(conn);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.chat.coordinator().pending_polls().await, 0);
    assert_eq!(h.router.pending_routes(), 0);
}

fn accept(doctor: &str, patient: &str) -> Request {
    Request::new("accept_chat")
        .with("doctor_user", doctor)
        .with("patient_user", patient)
}

#[tokio::test(start_paused = true)]
async fn event_for_dead_parked_poll_waits_for_reconnect() {
    let h = Harness::new();
    let (old, old_rx) = h.connect();
    let (doc, mut doc_rx) = h.connect();

    h.poll(old, "pat", 0, 1800);
    h.wait_parked("pat").await;
    drop(old_rx);
    h.router.disconnect(old);

    let (new, mut rx) = h.connect();
    h.router.submit(doc, accept("dr", "pat"));
    let ack = recv(&mut doc_rx).await;
    assert_eq!(ack["data"]["status"], "active");
    assert!(!h.chat.coordinator().is_parked("pat").await);

    let uuid = h.poll(new, "pat", 0, 1800);
    let got = recv(&mut rx).await;
    assert_eq!(got["request_uuid"], uuid.as_str());
    assert_eq!(got["data"]["instant_events"][0]["event_type"], "chat_accepted");
}

#[tokio::test(start_paused = true)]
async fn poll_after_reconnect_replaces_dead_parked_poll() {
    let h = Harness::new();
    let (old, old_rx) = h.connect();
    let (doc, mut doc_rx) = h.connect();

    h.poll(old, "pat", 0, 1800);
    h.wait_parked("pat").await;
    drop(old_rx);
    h.router.disconnect(old);

    let (new, mut rx) = h.connect();
    let uuid = h.poll(new, "pat", 0, 1800);
    tokio::time::sleep(Duration::from_millis(100)).await;
    // parked, not answered as busy
    assert!(rx.try_recv().is_err());
    assert_eq!(h.chat.coordinator().pending_polls().await, 1);

    h.router.submit(doc, accept("dr", "pat"));
    let got = recv(&mut rx).await;
    assert_eq!(got["request_uuid"], uuid.as_str());
    assert_eq!(got["data"]["instant_events"][0]["event_type"], "chat_accepted");
    recv(&mut doc_rx).await;
}

#[test]
fn poll_params_are_clamped() {
    let cfg = ChatSection::default();
    let req = Request::new("poll_events")
        .with("user", "u")
        .with("cursor", "42")
        .with("timeout_sec", 99_999)
        .with("limit", 0);
    let p = PollParams::from_request(&req, &cfg).unwrap();
    assert_eq!(p.cursor, 42);
    assert_eq!(p.timeout, Duration::from_secs(cfg.max_poll_timeout_sec));
    assert_eq!(p.limit, 1);

    let req = Request::new("poll_events").with("user", "u");
    let p = PollParams::from_request(&req, &cfg).unwrap();
    assert_eq!(p.cursor, 0);
    assert_eq!(p.limit, cfg.default_poll_limit);

    let err = PollParams::from_request(&Request::new("poll_events"), &cfg).unwrap_err();
    assert_eq!(err.client_code().as_str(), "BAD_REQUEST");
}
