//! Event Bus
//!
//! Durable at-least-once message streams decoupling side effects from the
//! synchronous bid path: `bid.audit` for accepted bids, `auction.ended` for
//! lifecycle transitions, `notify.user` for per-recipient outcomes. Messages
//! are pulled, processed, and acknowledged; an unacked message becomes
//! deliverable again after a bounded visibility timeout, and messages that
//! exhaust their attempts land in the dead-letter queue. Consumers are
//! keyed-idempotent, so redelivery is safe.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;
pub mod sql;

pub use memory::MemoryEventBus;
pub use sql::SqlEventBus;

/// Event bus errors
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        BusError::Unavailable(err.to_string())
    }
}

/// The named streams and their backing queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStream {
    BidAudit,
    AuctionEnded,
    NotifyUser,
}

impl EventStream {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BidAudit => "bid.audit",
            Self::AuctionEnded => "auction.ended",
            Self::NotifyUser => "notify.user",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Self::BidAudit => "audit-logs",
            Self::AuctionEnded => "auction-events",
            Self::NotifyUser => "notifications",
        }
    }
}

/// One pulled message. Holds the receipt needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: i64,
    pub stream: EventStream,
    pub key: String,
    pub payload: serde_json::Value,
    /// Delivery attempts including this one.
    pub attempts: u32,
}

/// Durable at-least-once message channel.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Durably enqueue a message. `key` is the consumer-side idempotency key.
    async fn publish(
        &self,
        stream: EventStream,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<(), BusError>;

    /// Claim the next deliverable message, if any. The message stays
    /// invisible until acked or until the visibility timeout passes.
    async fn pull(&self, stream: EventStream) -> Result<Option<Delivery>, BusError>;

    /// Acknowledge and permanently remove a delivery.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Poison messages parked after exhausting their delivery attempts.
    async fn dead_letters(&self, stream: EventStream) -> Result<Vec<Delivery>, BusError>;
}

pub type SharedBus = Arc<dyn EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_and_queue_names_are_stable() {
        assert_eq!(EventStream::BidAudit.name(), "bid.audit");
        assert_eq!(EventStream::AuctionEnded.name(), "auction.ended");
        assert_eq!(EventStream::NotifyUser.name(), "notify.user");

        assert_eq!(EventStream::BidAudit.queue(), "audit-logs");
        assert_eq!(EventStream::AuctionEnded.queue(), "auction-events");
        assert_eq!(EventStream::NotifyUser.queue(), "notifications");
    }
}
