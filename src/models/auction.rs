//! Auction Models
//!
//! Single-item English auctions with a fixed end time and ascending bids.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Auction record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub id: Uuid,
    pub item_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub starting_bid: Decimal,
    /// Equals `starting_bid` until the first bid is accepted; non-decreasing.
    pub current_highest_bid: Decimal,
    pub winner_id: Option<Uuid>,
    pub status: AuctionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionStatus {
    Active,
    Ended,
    Cancelled,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Ended => "ENDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "ENDED" => Some(Self::Ended),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// ENDED and CANCELLED are terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl Auction {
    /// Open for bids at `now`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == AuctionStatus::Active && now >= self.start_time && now < self.end_time
    }

    /// ACTIVE but past its end time, i.e. waiting for the lifecycle sweep
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == AuctionStatus::Active && now >= self.end_time
    }

    /// Seconds until the scheduled end, if still open
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.is_open(now) {
            Some((self.end_time - now).num_seconds().max(0))
        } else {
            None
        }
    }
}

/// Fields required to create an auction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuction {
    pub item_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub starting_bid: Decimal,
}

/// Accepted bid. `timestamp` is server-assigned epoch milliseconds,
/// strictly increasing within one auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub timestamp: i64,
}

/// Wire-facing view of an accepted bid, used for the highest-bid cache,
/// the history tail, and `newBid` fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidSummary {
    pub bid_id: Uuid,
    pub auction_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub amount: Decimal,
    pub timestamp: i64,
}

impl BidSummary {
    pub fn from_bid(bid: &Bid, username: &str) -> Self {
        Self {
            bid_id: bid.id,
            auction_id: bid.auction_id,
            user_id: bid.user_id,
            username: username.to_string(),
            amount: bid.amount,
            timestamp: bid.timestamp,
        }
    }
}

/// Room state returned to a client on join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub auction_id: Uuid,
    pub status: AuctionStatus,
    /// Current price: the highest accepted bid, or the starting bid.
    pub current_highest_bid: Decimal,
    pub highest_bidder: Option<BidSummary>,
    pub recent_bids: Vec<BidSummary>,
    pub participant_count: usize,
    pub end_time: DateTime<Utc>,
}

/// Result of an `end_auction` call. `transitioned` is true only for the
/// single call that performed the ACTIVE -> ENDED transition, so the ended
/// event cluster is emitted exactly once even under concurrent sweeps.
#[derive(Debug, Clone)]
pub struct EndOutcome {
    pub auction: Auction,
    pub participants: Vec<Uuid>,
    pub transitioned: bool,
}
