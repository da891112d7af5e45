//! Room Hub
//!
//! Per-auction sets of live subscriber sessions and the fan-out path for
//! `newBid` and lifecycle frames. Broadcasting only enqueues onto bounded
//! per-session buffers; a subscriber that cannot keep up is evicted rather
//! than allowed to stall the room. A relay task bridges cross-replica
//! pub/sub frames into local rooms, dropping frames this replica published
//! itself.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::gateway::protocol::ServerMessage;
use crate::gateway::session::SessionHandle;
use crate::hotstate::{PubSubFrame, SharedHotState};
use crate::models::{Auction, AuctionSnapshot, BidSummary};
use crate::store::{SharedStore, StoreError};

/// Bids included in a join snapshot.
const SNAPSHOT_BIDS: usize = 20;

/// Room errors
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("auction not found")]
    AuctionNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-auction subscriber registry and fan-out plane
pub struct RoomHub {
    store: SharedStore,
    hot: SharedHotState,
    replica: Uuid,
    rooms: Mutex<HashMap<Uuid, HashMap<Uuid, Arc<SessionHandle>>>>,
    /// Highest amount seen per auction across local commits and relayed
    /// frames. Fan-out may reorder across replicas; anything at or below
    /// this mark is stale and dropped.
    highest_seen: Mutex<HashMap<Uuid, Decimal>>,
}

impl RoomHub {
    pub fn new(store: SharedStore, hot: SharedHotState, replica: Uuid) -> Arc<Self> {
        Arc::new(Self {
            store,
            hot,
            replica,
            rooms: Mutex::new(HashMap::new()),
            highest_seen: Mutex::new(HashMap::new()),
        })
    }

    /// Record an amount this replica knows to be committed. Returns false
    /// when the amount is stale (already at or below the recorded mark).
    pub fn note_highest(&self, auction_id: Uuid, amount: Decimal) -> bool {
        let mut seen = self.highest_seen.lock();
        match seen.entry(auction_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if amount <= *entry.get() {
                    return false;
                }
                entry.insert(amount);
                true
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(amount);
                true
            }
        }
    }

    /// Add a session to an auction room and return the room snapshot.
    pub async fn join(
        &self,
        session: Arc<SessionHandle>,
        auction_id: Uuid,
    ) -> Result<AuctionSnapshot, RoomError> {
        let auction = self
            .store
            .get_auction(auction_id)
            .await?
            .ok_or(RoomError::AuctionNotFound)?;

        let snapshot = self.snapshot(&auction).await?;

        self.rooms
            .lock()
            .entry(auction_id)
            .or_default()
            .insert(session.session_id, session);

        Ok(snapshot)
    }

    pub fn leave(&self, session_id: Uuid, auction_id: Uuid) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(&auction_id) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(&auction_id);
            }
        }
    }

    pub fn leave_all(&self, session_id: Uuid) {
        let mut rooms = self.rooms.lock();
        rooms.retain(|_, members| {
            members.remove(&session_id);
            !members.is_empty()
        });
    }

    pub fn member_count(&self, auction_id: Uuid) -> usize {
        self.rooms
            .lock()
            .get(&auction_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Enqueue a frame to every room member. Non-blocking: members whose
    /// buffer is full are dropped from the room (their eviction mark is
    /// already set by the failed enqueue). Returns the delivered count.
    pub fn broadcast(&self, auction_id: Uuid, message: &ServerMessage) -> usize {
        let members: Vec<Arc<SessionHandle>> = {
            let rooms = self.rooms.lock();
            match rooms.get(&auction_id) {
                Some(members) => members.values().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut slow = Vec::new();
        for member in members {
            if member.enqueue(message.clone()) {
                delivered += 1;
            } else {
                slow.push(member.session_id);
            }
        }

        if !slow.is_empty() {
            let mut rooms = self.rooms.lock();
            if let Some(members) = rooms.get_mut(&auction_id) {
                for session_id in slow {
                    members.remove(&session_id);
                }
                if members.is_empty() {
                    rooms.remove(&auction_id);
                }
            }
        }

        delivered
    }

    /// Bridge cross-replica pub/sub into local rooms until shutdown.
    /// Frames are never re-published, so they cannot loop.
    pub async fn run_relay(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut frames = self.hot.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = frames.recv() => match frame {
                    Ok(frame) => self.relay_frame(frame),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "room relay lagged behind pub/sub");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    fn relay_frame(&self, frame: PubSubFrame) {
        if frame.origin == self.replica {
            // local bids were already broadcast on the commit path
            return;
        }
        let Some(auction_id) = parse_bid_channel(&frame.channel) else {
            return;
        };
        match serde_json::from_str::<BidSummary>(&frame.payload) {
            Ok(bid) => {
                // in-flight reordering across replicas: trust amount
                // monotonicity and drop anything stale
                if !self.note_highest(auction_id, bid.amount) {
                    debug!(%auction_id, amount = %bid.amount, "dropping stale relayed bid");
                    return;
                }
                let delivered = self.broadcast(auction_id, &ServerMessage::NewBid { bid });
                debug!(%auction_id, delivered, origin = %frame.origin, "relayed remote bid");
            }
            Err(error) => {
                warn!(channel = %frame.channel, %error, "dropping malformed pub/sub frame");
            }
        }
    }

    async fn snapshot(&self, auction: &Auction) -> Result<AuctionSnapshot, RoomError> {
        let mut recent = match self.hot.recent_history(auction.id, SNAPSHOT_BIDS).await {
            Ok(tail) => tail,
            Err(error) => {
                warn!(auction_id = %auction.id, %error, "history tail unavailable");
                Vec::new()
            }
        };
        if recent.is_empty() {
            recent = self.bid_history(auction.id, SNAPSHOT_BIDS as u32).await?;
        }

        let highest = match self.hot.get_highest(auction.id).await {
            Ok(Some(cached)) => Some(cached),
            _ => recent.first().cloned(),
        };

        let participant_count = self.store.participants(auction.id).await?.len();

        Ok(AuctionSnapshot {
            auction_id: auction.id,
            status: auction.status,
            current_highest_bid: auction.current_highest_bid,
            highest_bidder: highest,
            recent_bids: recent,
            participant_count,
            end_time: auction.end_time,
        })
    }

    /// Authoritative bid history from the store, newest first, with
    /// usernames resolved.
    pub async fn bid_history(
        &self,
        auction_id: Uuid,
        limit: u32,
    ) -> Result<Vec<BidSummary>, RoomError> {
        let bids = self.store.list_bids(auction_id, limit).await?;

        let mut usernames: HashMap<Uuid, String> = HashMap::new();
        let mut summaries = Vec::with_capacity(bids.len());
        for bid in &bids {
            let username = match usernames.get(&bid.user_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self
                        .store
                        .get_user(bid.user_id)
                        .await?
                        .map(|u| u.username)
                        .unwrap_or_else(|| "unknown".to_string());
                    usernames.insert(bid.user_id, name.clone());
                    name
                }
            };
            summaries.push(BidSummary::from_bid(bid, &username));
        }
        Ok(summaries)
    }
}

fn parse_bid_channel(channel: &str) -> Option<Uuid> {
    channel
        .strip_prefix("auction:")?
        .strip_suffix(":bids")
        .and_then(|id| Uuid::parse_str(id).ok())
}
