//! Durable Store
//!
//! Authoritative persistence for users, auctions, and bids. The store is the
//! single source of truth: a committed write here stands regardless of any
//! downstream cache, queue, or fan-out failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Auction, Bid, EndOutcome, NewAuction, NewUser, User};

pub mod sql;

pub use sql::SqlStore;

/// Store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("auction not found")]
    AuctionNotFound,
    #[error("auction is not open for bids")]
    AuctionNotActive,
    #[error("auction has ended")]
    AuctionEnded,
    #[error("bid must exceed the current highest bid of {highest}")]
    BidTooLow { highest: Decimal },
    #[error("caller already holds the highest bid")]
    SelfOutbid,
    #[error("conflicting concurrent update")]
    Conflict,
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error("invalid auction: {0}")]
    InvalidAuction(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures are retried internally with bounded backoff;
    /// everything else surfaces to the caller unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict | Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let text = err.to_string();
        if text.contains("UNIQUE") || text.contains("unique constraint") {
            StoreError::Duplicate("unique column")
        } else {
            StoreError::Unavailable(text)
        }
    }
}

/// Authoritative auction persistence.
///
/// `place_bid` serializes per auction: implementations guard the
/// highest-bid update optimistically and report lost races as
/// [`StoreError::Conflict`], which callers retry. Concurrent bids on
/// different auctions never contend.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Inserts with `current_highest_bid := starting_bid`, status ACTIVE.
    async fn create_auction(&self, new: NewAuction) -> Result<Auction, StoreError>;

    async fn get_auction(&self, id: Uuid) -> Result<Option<Auction>, StoreError>;

    /// In one transaction: re-read the auction, verify it is open and the
    /// amount beats the current highest, reject a caller who already holds
    /// the highest bid, insert the bid, and advance `current_highest_bid`.
    async fn place_bid(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Bid, StoreError>;

    /// Idempotent ACTIVE -> ENDED transition. Resolves the winner from the
    /// highest accepted bid. Only the call that performed the transition
    /// observes `transitioned = true`.
    async fn end_auction(&self, id: Uuid, now: DateTime<Utc>) -> Result<EndOutcome, StoreError>;

    /// ACTIVE auctions whose end time has passed.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    /// Accepted bids, newest first.
    async fn list_bids(&self, auction_id: Uuid, limit: u32) -> Result<Vec<Bid>, StoreError>;

    /// Distinct users with at least one accepted bid.
    async fn participants(&self, auction_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Idempotent notification delivery sink: returns true exactly once
    /// per key, false for every duplicate.
    async fn record_notification(&self, key: &str) -> Result<bool, StoreError>;
}

pub type SharedStore = Arc<dyn AuctionStore>;
