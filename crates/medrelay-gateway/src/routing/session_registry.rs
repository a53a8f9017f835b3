use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

/// Stable handle of one accepted connection. Handles are never reused, so a
/// stale handle can only fail to resolve, never resolve to someone else.
pub type ConnectionId = u64;

/// One connection actor's inbound delivery queue.
#[derive(Clone, Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub tx: mpsc::Sender<Value>,
}

/// Connection arena: `ConnectionId -> Connection`.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Connection>,
    seq: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh handle and register the connection's queue under it.
    pub fn register(&self, tx: mpsc::Sender<Value>, peer: Option<SocketAddr>) -> ConnectionId {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(id, Connection { id, peer, tx });
        id
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.sessions.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.sessions.get(&id).map(|r| r.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_not_reused() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = reg.register(tx.clone(), None);
        assert!(reg.remove(a).is_some());
        let b = reg.register(tx, None);
        assert_ne!(a, b);
        assert!(reg.get(a).is_none());
        assert!(reg.contains(b));
        assert_eq!(reg.len(), 1);
    }
}
