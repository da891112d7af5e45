//! Event Payloads
//!
//! Messages carried on the durable event streams. Consumers are idempotent,
//! so each payload exposes the key it is deduplicated by.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One record per accepted bid, published on `bid.audit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidAudit {
    pub bid_id: Uuid,
    pub auction_id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub timestamp: i64,
}

/// One record per ACTIVE -> ENDED transition, published on `auction.ended`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionEndedEvent {
    pub auction_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub winning_amount: Option<Decimal>,
    pub participants: Vec<Uuid>,
}

/// Per-recipient outcome message, published on `notify.user`.
/// `user_id` is `None` for room-wide watcher notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotification {
    pub user_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub auction_id: Uuid,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Won,
    Lost,
    NoBidsWatcher,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Won => "WON",
            Self::Lost => "LOST",
            Self::NoBidsWatcher => "NO_BIDS_WATCHER",
        }
    }
}

impl UserNotification {
    /// Deterministic delivery-sink key: `(auction, recipient, kind)`.
    pub fn dedup_key(&self) -> String {
        let recipient = self
            .user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "room".to_string());
        format!("{}:{}:{}", self.auction_id, recipient, self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_per_recipient_and_kind() {
        let auction_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let won = UserNotification {
            user_id: Some(user_id),
            kind: NotificationKind::Won,
            auction_id,
            payload: serde_json::json!({}),
        };
        let lost = UserNotification {
            user_id: Some(user_id),
            kind: NotificationKind::Lost,
            auction_id,
            payload: serde_json::json!({}),
        };
        assert_ne!(won.dedup_key(), lost.dedup_key());
        assert_eq!(won.dedup_key(), won.dedup_key());

        let watcher = UserNotification {
            user_id: None,
            kind: NotificationKind::NoBidsWatcher,
            auction_id,
            payload: serde_json::json!({}),
        };
        assert!(watcher.dedup_key().contains("room"));
    }

    #[test]
    fn kinds_serialize_to_wire_names() {
        let json = serde_json::to_string(&NotificationKind::NoBidsWatcher).unwrap();
        assert_eq!(json, "\"NO_BIDS_WATCHER\"");
    }
}
