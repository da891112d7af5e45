//! Hot State
//!
//! Shared low-latency state derived from the store: highest-bid cache,
//! display-only bid history tail, session presence, rate counters, and the
//! pub/sub channels used for cross-replica fan-out. Everything here is
//! best-effort: callers log failures and continue, and the rate gate fails
//! open, because the store alone is ground truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::BidSummary;

pub mod memory;

pub use memory::MemoryHotState;

/// Hot-state errors
#[derive(Debug, Clone, Error)]
pub enum HotStateError {
    #[error("hot state unavailable: {0}")]
    Unavailable(String),
}

/// Presence record for a connected user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: Uuid,
    pub username: String,
    pub replica: Uuid,
    pub connected_at: DateTime<Utc>,
}

/// Frame carried on a pub/sub channel. `origin` tags the publishing replica
/// so relays can drop their own frames instead of looping them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubFrame {
    pub channel: String,
    pub origin: Uuid,
    pub payload: String,
}

/// Channel that fans accepted bids out across replicas for one auction.
pub fn bid_channel(auction_id: Uuid) -> String {
    format!("auction:{auction_id}:bids")
}

/// Channel for cross-replica cache invalidation.
pub const GLOBAL_BID_CHANNEL: &str = "bid:global";

/// Rate-counter key for one `(user, auction)` pair.
pub fn rate_key(user_id: Uuid, auction_id: Uuid) -> String {
    format!("rate_limit:{user_id}:{auction_id}")
}

/// Derived shared state. The trait is the replica seam: a process-external
/// backend plugs in behind it without touching any consumer.
#[async_trait]
pub trait HotState: Send + Sync {
    async fn set_highest(
        &self,
        auction_id: Uuid,
        summary: &BidSummary,
    ) -> Result<(), HotStateError>;

    async fn get_highest(&self, auction_id: Uuid) -> Result<Option<BidSummary>, HotStateError>;

    /// Push to the bounded per-auction history tail, newest first.
    async fn push_history(
        &self,
        auction_id: Uuid,
        summary: &BidSummary,
    ) -> Result<(), HotStateError>;

    async fn recent_history(
        &self,
        auction_id: Uuid,
        limit: usize,
    ) -> Result<Vec<BidSummary>, HotStateError>;

    async fn set_session(&self, user_id: Uuid, meta: SessionMeta) -> Result<(), HotStateError>;

    async fn get_session(&self, user_id: Uuid) -> Result<Option<SessionMeta>, HotStateError>;

    async fn clear_session(&self, user_id: Uuid) -> Result<(), HotStateError>;

    /// Sliding-window counter. The first increment arms the window; a count
    /// beyond `2 * limit` extends the window to five times its length
    /// (progressive penalty). Returns the new count.
    async fn incr_rate(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<u32, HotStateError>;

    async fn publish(&self, frame: PubSubFrame) -> Result<(), HotStateError>;

    /// Subscribe to every pub/sub channel; receivers filter by channel name.
    fn subscribe(&self) -> broadcast::Receiver<PubSubFrame>;
}

pub type SharedHotState = Arc<dyn HotState>;
