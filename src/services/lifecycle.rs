//! Lifecycle Scheduler
//!
//! Transitions auctions out of ACTIVE at their scheduled end. Every replica
//! runs the same periodic sweep; the store's idempotent end transition makes
//! the race benign, so no leader election is needed. Read paths that observe
//! an expired ACTIVE auction call [`LifecycleScheduler::finalize`] directly
//! (on-demand detection) through the same path.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::rooms::RoomHub;
use crate::bus::{EventStream, SharedBus};
use crate::gateway::protocol::ServerMessage;
use crate::models::AuctionEndedEvent;
use crate::store::{SharedStore, StoreError};

/// Ends expired auctions and emits their outcome events
pub struct LifecycleScheduler {
    store: SharedStore,
    bus: SharedBus,
    rooms: Arc<RoomHub>,
    tick: Duration,
}

impl LifecycleScheduler {
    pub fn new(
        store: SharedStore,
        bus: SharedBus,
        rooms: Arc<RoomHub>,
        tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            rooms,
            tick,
        })
    }

    /// Periodic sweep loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.sweep(Utc::now()).await {
                        warn!(%error, "lifecycle sweep failed");
                    }
                }
            }
        }
    }

    /// End every ACTIVE auction whose end time has passed. Returns how many
    /// transitions this call performed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired = self.store.list_expired(now).await?;
        let mut ended = 0;
        for auction_id in expired {
            match self.finalize(auction_id, now).await {
                Ok(true) => ended += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(%auction_id, %error, "failed to end expired auction");
                }
            }
        }
        Ok(ended)
    }

    /// Idempotently end one auction. Exactly the call that performed the
    /// transition publishes the `auction.ended` event and broadcasts
    /// `auctionEnded`; every other call is a no-op returning false.
    pub async fn finalize(&self, auction_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let outcome = match self.store.end_auction(auction_id, now).await {
            Ok(outcome) => outcome,
            // another replica performed the transition between our read and write
            Err(StoreError::Conflict) => return Ok(false),
            Err(error) => return Err(error),
        };

        if !outcome.transitioned {
            return Ok(false);
        }

        let winning_amount = outcome
            .auction
            .winner_id
            .map(|_| outcome.auction.current_highest_bid);

        info!(
            %auction_id,
            winner = ?outcome.auction.winner_id,
            participants = outcome.participants.len(),
            "auction ended"
        );

        let event = AuctionEndedEvent {
            auction_id,
            winner_id: outcome.auction.winner_id,
            winning_amount,
            participants: outcome.participants,
        };
        match serde_json::to_value(&event) {
            Ok(payload) => {
                if let Err(error) = self
                    .bus
                    .publish(EventStream::AuctionEnded, &auction_id.to_string(), payload)
                    .await
                {
                    // the ENDED state in the store is final either way
                    warn!(%auction_id, %error, "failed to publish auction.ended");
                }
            }
            Err(error) => warn!(%auction_id, %error, "failed to encode auction.ended"),
        }

        self.rooms.broadcast(
            auction_id,
            &ServerMessage::AuctionEnded {
                auction_id,
                winner_id: event.winner_id,
                winning_amount: event.winning_amount,
            },
        );

        Ok(true)
    }
}
