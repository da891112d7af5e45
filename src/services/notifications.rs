//! Notification Dispatch
//!
//! Two consumers close the outcome loop. The first turns each
//! `auction.ended` event into per-recipient `notify.user` messages (WON for
//! the winner, LOST for every other participant, or a room-wide watcher
//! notice when nobody bid). The second delivers `notify.user` messages to
//! live sessions through the idempotent sink: each `(auction, recipient,
//! kind)` key is recorded exactly once, duplicates are discarded, and
//! recipients without a live session stay queued for broker redelivery.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::rooms::RoomHub;
use crate::bus::{BusError, EventStream, SharedBus};
use crate::gateway::protocol::ServerMessage;
use crate::gateway::session::SessionRegistry;
use crate::models::{AuctionEndedEvent, NotificationKind, UserNotification};
use crate::store::{SharedStore, StoreError};

/// Consumes outcome events and pushes user notifications
pub struct NotificationDispatcher {
    store: SharedStore,
    bus: SharedBus,
    rooms: Arc<RoomHub>,
    registry: Arc<SessionRegistry>,
    poll: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        store: SharedStore,
        bus: SharedBus,
        rooms: Arc<RoomHub>,
        registry: Arc<SessionRegistry>,
        poll: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            rooms,
            registry,
            poll,
        })
    }

    /// Poll both streams until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll) => {
                    if let Err(error) = self.drain().await {
                        warn!(%error, "notification dispatch round failed");
                    }
                }
            }
        }
    }

    /// Process everything currently deliverable on both streams.
    pub async fn drain(&self) -> Result<(), BusError> {
        self.fan_out_outcomes().await?;
        self.deliver_notifications().await?;
        Ok(())
    }

    async fn fan_out_outcomes(&self) -> Result<(), BusError> {
        let mut seen = HashSet::new();
        while let Some(delivery) = self.bus.pull(EventStream::AuctionEnded).await? {
            if !seen.insert(delivery.receipt) {
                break;
            }
            match serde_json::from_value::<AuctionEndedEvent>(delivery.payload.clone()) {
                Ok(event) => {
                    if let Err(error) = self.fan_out(&event).await {
                        warn!(auction_id = %event.auction_id, %error, "outcome fan-out failed, leaving for redelivery");
                        continue;
                    }
                    self.bus.ack(&delivery).await?;
                }
                Err(error) => {
                    // leave unacked: the attempt cap moves it to the dead letters
                    warn!(key = %delivery.key, %error, "malformed auction.ended payload");
                }
            }
        }
        Ok(())
    }

    async fn fan_out(&self, event: &AuctionEndedEvent) -> Result<(), BusError> {
        match event.winner_id {
            Some(winner) => {
                self.publish_notification(UserNotification {
                    user_id: Some(winner),
                    kind: NotificationKind::Won,
                    auction_id: event.auction_id,
                    payload: json!({
                        "auctionId": event.auction_id,
                        "winningAmount": event.winning_amount,
                    }),
                })
                .await?;

                for participant in event.participants.iter().filter(|p| **p != winner) {
                    self.publish_notification(UserNotification {
                        user_id: Some(*participant),
                        kind: NotificationKind::Lost,
                        auction_id: event.auction_id,
                        payload: json!({
                            "auctionId": event.auction_id,
                            "winningAmount": event.winning_amount,
                        }),
                    })
                    .await?;
                }
            }
            None => {
                self.publish_notification(UserNotification {
                    user_id: None,
                    kind: NotificationKind::NoBidsWatcher,
                    auction_id: event.auction_id,
                    payload: json!({ "auctionId": event.auction_id }),
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn publish_notification(&self, notification: UserNotification) -> Result<(), BusError> {
        let payload = serde_json::to_value(&notification)
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        self.bus
            .publish(EventStream::NotifyUser, &notification.dedup_key(), payload)
            .await
    }

    async fn deliver_notifications(&self) -> Result<(), BusError> {
        let mut seen = HashSet::new();
        while let Some(delivery) = self.bus.pull(EventStream::NotifyUser).await? {
            if !seen.insert(delivery.receipt) {
                break;
            }
            let notification: UserNotification =
                match serde_json::from_value(delivery.payload.clone()) {
                    Ok(notification) => notification,
                    Err(error) => {
                        warn!(key = %delivery.key, %error, "malformed notify.user payload");
                        continue;
                    }
                };

            match self.deliver(&notification).await {
                Ok(true) => self.bus.ack(&delivery).await?,
                // recipient offline: stay queued for the next redelivery
                Ok(false) => debug!(key = %delivery.key, "recipient offline, keeping notification"),
                Err(error) => {
                    warn!(key = %delivery.key, %error, "delivery sink unavailable");
                }
            }
        }
        Ok(())
    }

    /// Returns true when the notification is finished (delivered now or a
    /// discarded duplicate), false when it should be redelivered later.
    async fn deliver(&self, notification: &UserNotification) -> Result<bool, StoreError> {
        let message = ServerMessage::UserNotification {
            kind: notification.kind,
            payload: notification.payload.clone(),
        };

        match notification.user_id {
            Some(user_id) => {
                if !self.registry.is_online(user_id) {
                    return Ok(false);
                }
                if self
                    .store
                    .record_notification(&notification.dedup_key())
                    .await?
                {
                    self.registry.send_to_user(user_id, &message);
                } else {
                    debug!(key = %notification.dedup_key(), "duplicate notification discarded");
                }
                Ok(true)
            }
            None => {
                if self
                    .store
                    .record_notification(&notification.dedup_key())
                    .await?
                {
                    self.rooms.broadcast(notification.auction_id, &message);
                }
                Ok(true)
            }
        }
    }
}
