//! Chat message persistence seam.
//!
//! `MessageStore` is what the chat service and the long-poll coordinator read
//! and write; `MemoryMessageStore` is the in-process implementation. Message
//! ids are assigned by the store, strictly increasing from 1.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use medrelay_core::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub doctor_user: String,
    pub patient_user: String,
    pub message_id: String,
    pub sender_user: String,
    pub message_type: String,
    pub text_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_metadata: Option<Value>,
    pub timestamp_ms: u64,
}

impl ChatMessage {
    pub fn involves(&self, user: &str) -> bool {
        self.doctor_user == user || self.patient_user == user
    }

    fn counterpart(&self, user: &str) -> &str {
        if self.doctor_user == user {
            &self.patient_user
        } else {
            &self.doctor_user
        }
    }
}

/// Message to be committed; the store assigns `id` and `timestamp_ms`.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub doctor_user: String,
    pub patient_user: String,
    pub message_id: String,
    pub sender_user: String,
    pub message_type: String,
    pub text_content: String,
    pub file_metadata: Option<Value>,
}

/// Latest exchange with one counterpart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contact {
    pub user: String,
    pub last_message_id: i64,
    pub last_text: String,
    pub last_timestamp_ms: u64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, msg: NewMessage) -> Result<ChatMessage>;

    /// Messages addressed to or sent by `user` with `id > cursor`, ascending,
    /// at most `limit`.
    async fn since_for_user(&self, user: &str, cursor: i64, limit: usize) -> Result<Vec<ChatMessage>>;

    /// One page of a doctor/patient conversation: the newest `limit` messages
    /// with `id < before_id` (`before_id <= 0` means latest), ascending.
    async fn history(
        &self,
        doctor: &str,
        patient: &str,
        before_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;

    /// Counterparts of `user`, most recent exchange first.
    async fn recent_contacts(&self, user: &str, limit: usize) -> Result<Vec<Contact>>;
}

#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    log: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, msg: NewMessage) -> Result<ChatMessage> {
        let mut log = self.log.write().await;
        let id = log.last().map_or(1, |m| m.id + 1);
        let stored = ChatMessage {
            id,
            doctor_user: msg.doctor_user,
            patient_user: msg.patient_user,
            message_id: msg.message_id,
            sender_user: msg.sender_user,
            message_type: msg.message_type,
            text_content: msg.text_content,
            file_metadata: msg.file_metadata,
            timestamp_ms: now_ms(),
        };
        log.push(stored.clone());
        Ok(stored)
    }

    async fn since_for_user(&self, user: &str, cursor: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        let log = self.log.read().await;
        let start = log.partition_point(|m| m.id <= cursor);
        Ok(log[start..]
            .iter()
            .filter(|m| m.involves(user))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn history(
        &self,
        doctor: &str,
        patient: &str,
        before_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let log = self.log.read().await;
        let end = if before_id > 0 {
            log.partition_point(|m| m.id < before_id)
        } else {
            log.len()
        };
        let mut page: Vec<ChatMessage> = log[..end]
            .iter()
            .rev()
            .filter(|m| m.doctor_user == doctor && m.patient_user == patient)
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn recent_contacts(&self, user: &str, limit: usize) -> Result<Vec<Contact>> {
        let log = self.log.read().await;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for m in log.iter().rev().filter(|m| m.involves(user)) {
            let peer = m.counterpart(user);
            if !seen.insert(peer) {
                continue;
            }
            out.push(Contact {
                user: peer.to_string(),
                last_message_id: m.id,
                last_text: m.text_content.clone(),
                last_timestamp_ms: m.timestamp_ms,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}
