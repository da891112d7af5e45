//! In-Process Hot State
//!
//! Expiry-stamped maps under short `parking_lot` locks, pub/sub over a
//! `tokio::sync::broadcast` channel. TTLs are checked lazily against the
//! tokio clock, so paused-time tests can drive window expiry precisely.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::{HotState, HotStateError, PubSubFrame, SessionMeta};
use crate::models::BidSummary;
use crate::settings::HotStateSettings;

const PUBSUB_CAPACITY: usize = 256;

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

struct RateWindow {
    count: u32,
    started_at: Instant,
    expires_at: Instant,
}

/// In-process [`HotState`] implementation
pub struct MemoryHotState {
    settings: HotStateSettings,
    session_ttl: Duration,
    highest: Mutex<HashMap<Uuid, Expiring<BidSummary>>>,
    history: Mutex<HashMap<Uuid, Expiring<VecDeque<BidSummary>>>>,
    sessions: Mutex<HashMap<Uuid, Expiring<SessionMeta>>>,
    counters: Mutex<HashMap<String, RateWindow>>,
    channel: broadcast::Sender<PubSubFrame>,
}

impl MemoryHotState {
    pub fn new(settings: HotStateSettings, session_ttl: Duration) -> Self {
        let (channel, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            settings,
            session_ttl,
            highest: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            channel,
        }
    }
}

#[async_trait]
impl HotState for MemoryHotState {
    async fn set_highest(
        &self,
        auction_id: Uuid,
        summary: &BidSummary,
    ) -> Result<(), HotStateError> {
        let ttl = Duration::from_secs(self.settings.highest_ttl_secs);
        self.highest
            .lock()
            .insert(auction_id, Expiring::new(summary.clone(), ttl));
        Ok(())
    }

    async fn get_highest(&self, auction_id: Uuid) -> Result<Option<BidSummary>, HotStateError> {
        let mut map = self.highest.lock();
        if let Some(entry) = map.get(&auction_id) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        map.remove(&auction_id);
        Ok(None)
    }

    async fn push_history(
        &self,
        auction_id: Uuid,
        summary: &BidSummary,
    ) -> Result<(), HotStateError> {
        let ttl = Duration::from_secs(self.settings.history_ttl_secs);
        let mut map = self.history.lock();

        let entry = map
            .entry(auction_id)
            .or_insert_with(|| Expiring::new(VecDeque::new(), ttl));
        if !entry.live() {
            entry.value.clear();
        }
        entry.expires_at = Instant::now() + ttl;
        entry.value.push_front(summary.clone());
        entry.value.truncate(self.settings.history_len);
        Ok(())
    }

    async fn recent_history(
        &self,
        auction_id: Uuid,
        limit: usize,
    ) -> Result<Vec<BidSummary>, HotStateError> {
        let map = self.history.lock();
        Ok(match map.get(&auction_id) {
            Some(entry) if entry.live() => entry.value.iter().take(limit).cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn set_session(&self, user_id: Uuid, meta: SessionMeta) -> Result<(), HotStateError> {
        self.sessions
            .lock()
            .insert(user_id, Expiring::new(meta, self.session_ttl));
        Ok(())
    }

    async fn get_session(&self, user_id: Uuid) -> Result<Option<SessionMeta>, HotStateError> {
        let mut map = self.sessions.lock();
        if let Some(entry) = map.get(&user_id) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        map.remove(&user_id);
        Ok(None)
    }

    async fn clear_session(&self, user_id: Uuid) -> Result<(), HotStateError> {
        self.sessions.lock().remove(&user_id);
        Ok(())
    }

    async fn incr_rate(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<u32, HotStateError> {
        let now = Instant::now();
        let fresh = RateWindow {
            count: 1,
            started_at: now,
            expires_at: now + window,
        };
        let mut counters = self.counters.lock();

        match counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now >= occupied.get().expires_at {
                    occupied.insert(fresh);
                    return Ok(1);
                }
                let state = occupied.get_mut();
                state.count += 1;
                if state.count > 2 * limit {
                    state.expires_at = state.started_at + window * 5;
                }
                Ok(state.count)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(1)
            }
        }
    }

    async fn publish(&self, frame: PubSubFrame) -> Result<(), HotStateError> {
        // no subscribers is not an error
        let _ = self.channel.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PubSubFrame> {
        self.channel.subscribe()
    }
}
