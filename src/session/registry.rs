use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Sending half of a live downstream connection. The connection's write
/// task owns the receiver.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    peer_addr: String,
    connected_at: Instant,
    sender: mpsc::UnboundedSender<String>,
}

impl SessionHandle {
    pub fn new(peer_addr: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: Uuid::new_v4(),
            peer_addr: peer_addr.into(),
            connected_at: Instant::now(),
            sender,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Queue a text frame for this session. Fails once the write side is gone.
    pub fn send(&self, message: String) -> Result<(), String> {
        self.sender
            .send(message)
            .map_err(|_| format!("session {} is closed", self.id))
    }
}

struct SessionEntry {
    handle: SessionHandle,
    // Declared tickers. Bookkeeping only; broadcast ignores it.
    subscriptions: HashSet<String>,
}

/// Set of live downstream sessions keyed by identity.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic elsewhere must not make membership changes disappear, so a
    // poisoned lock is recovered rather than propagated.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, handle: SessionHandle) -> usize {
        let id = handle.id();
        let peer = handle.peer_addr().to_string();
        let mut sessions = self.write();
        sessions.insert(
            id,
            SessionEntry {
                handle,
                subscriptions: HashSet::new(),
            },
        );
        let count = sessions.len();
        drop(sessions);

        info!("Session {} registered from {}. Total sessions: {}", id, peer, count);
        count
    }

    pub fn remove(&self, id: Uuid) -> Option<SessionHandle> {
        let mut sessions = self.write();
        let removed = sessions.remove(&id);
        let count = sessions.len();
        drop(sessions);

        if let Some(entry) = &removed {
            info!(
                "Session {} removed ({} subscriptions). Total sessions: {}",
                id,
                entry.subscriptions.len(),
                count
            );
        }
        removed.map(|entry| entry.handle)
    }

    /// Send `message` to every session registered at the moment of the call.
    /// Returns how many sessions accepted it. Failed sessions stay registered
    /// until their own close path removes them.
    pub fn broadcast(&self, message: &str) -> usize {
        let snapshot: Vec<SessionHandle> = self
            .read()
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        let mut delivered = 0;
        for handle in snapshot {
            match handle.send(message.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} failed: {}", handle.peer_addr(), e),
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: Uuid) -> bool {
        self.read().contains_key(&id)
    }

    /// Record that `id` declared interest in `ticker`. Repeats are accepted.
    pub fn note_subscription(&self, id: Uuid, ticker: &str) -> bool {
        match self.write().get_mut(&id) {
            Some(entry) => {
                entry.subscriptions.insert(ticker.to_string());
                true
            }
            None => false,
        }
    }

    pub fn note_unsubscription(&self, id: Uuid, ticker: &str) -> bool {
        match self.write().get_mut(&id) {
            Some(entry) => {
                entry.subscriptions.remove(ticker);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn subscriptions(&self, id: Uuid) -> HashSet<String> {
        self.read()
            .get(&id)
            .map(|entry| entry.subscriptions.clone())
            .unwrap_or_default()
    }

    /// (sessions, total declared subscriptions)
    pub fn get_stats(&self) -> (usize, usize) {
        let sessions = self.read();
        let subscriptions = sessions.values().map(|entry| entry.subscriptions.len()).sum();
        (sessions.len(), subscriptions)
    }
}
