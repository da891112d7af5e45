//! Sessions
//!
//! A connected client is represented by a [`SessionHandle`]: the only task
//! that writes to the socket is the connection's writer task, and every
//! other component reaches the client by enqueueing onto its bounded
//! outbound buffer. A full buffer marks the session for eviction, which the
//! connection task observes and turns into a disconnect.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::warn;
use uuid::Uuid;

use super::protocol::ServerMessage;

/// Handle to one live connection
pub struct SessionHandle {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    outbound: mpsc::Sender<ServerMessage>,
    evict: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(
        user_id: Uuid,
        username: String,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: Uuid::now_v7(),
            user_id,
            username,
            outbound,
            evict: Arc::new(Notify::new()),
        })
    }

    /// Enqueue without blocking. Returns false when the session is gone or
    /// its buffer is full; a full buffer also marks the session for
    /// eviction (slow consumer).
    pub fn enqueue(&self, message: ServerMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    session_id = %self.session_id,
                    user_id = %self.user_id,
                    "outbound buffer full, evicting slow consumer"
                );
                self.evict.notify_one();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves when the session has been marked for eviction.
    pub async fn evicted(&self) {
        self.evict.notified().await;
    }
}

/// All live sessions on this replica, addressable by user.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<Uuid, Vec<Arc<SessionHandle>>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, session: Arc<SessionHandle>) {
        self.inner
            .lock()
            .entry(session.user_id)
            .or_default()
            .push(session);
    }

    pub fn remove(&self, user_id: Uuid, session_id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(sessions) = inner.get_mut(&user_id) {
            sessions.retain(|s| s.session_id != session_id);
            if sessions.is_empty() {
                inner.remove(&user_id);
            }
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.lock().contains_key(&user_id)
    }

    /// Enqueue to every live session of a user. Returns true when at least
    /// one session took the message.
    pub fn send_to_user(&self, user_id: Uuid, message: &ServerMessage) -> bool {
        let sessions: Vec<Arc<SessionHandle>> = self
            .inner
            .lock()
            .get(&user_id)
            .map(|s| s.to_vec())
            .unwrap_or_default();

        let mut delivered = false;
        for session in sessions {
            delivered |= session.enqueue(message.clone());
        }
        delivered
    }
}
