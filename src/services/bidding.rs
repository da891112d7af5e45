//! Bid Acceptance
//!
//! The serialized pipeline every bid goes through: normalize the amount,
//! charge the per-user-per-auction rate gate, commit durably through the
//! store, then fan out. Per-auction serialization is an in-process mutex
//! layered above the store's optimistic transaction: lost cross-replica
//! races surface as transient conflicts and are retried with bounded
//! backoff. Side effects after the commit are best effort and never
//! invalidate an accepted bid.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::lifecycle::LifecycleScheduler;
use super::rooms::RoomHub;
use crate::bus::{EventStream, SharedBus};
use crate::gateway::protocol::{BidErrorCode, ServerMessage};
use crate::hotstate::{bid_channel, rate_key, PubSubFrame, SharedHotState};
use crate::models::{Bid, BidAudit, BidSummary};
use crate::settings::BiddingSettings;
use crate::store::{SharedStore, StoreError};

/// Why a bid was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BidRejection {
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("{0}")]
    Validation(String),
    #[error("bid could not be committed, try again")]
    Unavailable,
}

impl BidRejection {
    pub fn code(&self) -> BidErrorCode {
        match self {
            Self::RateLimited { .. } => BidErrorCode::RateLimitExceeded,
            Self::InvalidAmount(_) => BidErrorCode::InvalidAmount,
            Self::Validation(_) | Self::Unavailable => BidErrorCode::BidValidationError,
        }
    }
}

/// Serialized bid validator
pub struct BiddingService {
    store: SharedStore,
    hot: SharedHotState,
    bus: SharedBus,
    rooms: Arc<RoomHub>,
    lifecycle: Arc<LifecycleScheduler>,
    settings: BiddingSettings,
    replica: Uuid,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl BiddingService {
    pub fn new(
        store: SharedStore,
        hot: SharedHotState,
        bus: SharedBus,
        rooms: Arc<RoomHub>,
        lifecycle: Arc<LifecycleScheduler>,
        settings: BiddingSettings,
        replica: Uuid,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hot,
            bus,
            rooms,
            lifecycle,
            settings,
            replica,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Validate and durably commit one bid. On success the accepted bid has
    /// already been broadcast to local room members; cache, cross-replica
    /// publish, and audit run on a detached task.
    pub async fn submit(
        &self,
        user_id: Uuid,
        username: &str,
        auction_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Bid, BidRejection> {
        if amount <= Decimal::ZERO {
            return Err(BidRejection::InvalidAmount(
                "amount must be positive".to_string(),
            ));
        }
        if amount > self.settings.max_bid_amount {
            return Err(BidRejection::InvalidAmount(format!(
                "amount exceeds the maximum of {}",
                self.settings.max_bid_amount
            )));
        }
        let amount = amount.normalize();

        self.rate_gate(user_id, auction_id).await?;

        let bid = {
            let lock = self.auction_lock(auction_id);
            let _guard = lock.lock().await;
            self.commit(auction_id, user_id, amount, now).await?
        };

        let summary = BidSummary::from_bid(&bid, username);
        self.rooms.note_highest(auction_id, summary.amount);
        self.rooms
            .broadcast(auction_id, &ServerMessage::NewBid { bid: summary.clone() });
        self.spawn_side_effects(summary);

        Ok(bid)
    }

    /// Charge the sliding-window counter. HotState failure fails open: the
    /// store remains the gate that matters.
    async fn rate_gate(&self, user_id: Uuid, auction_id: Uuid) -> Result<(), BidRejection> {
        let window = Duration::from_secs(self.settings.rate_window_secs);
        let key = rate_key(user_id, auction_id);
        match self
            .hot
            .incr_rate(&key, window, self.settings.rate_limit)
            .await
        {
            Ok(count) if count > self.settings.rate_limit => {
                debug!(%user_id, %auction_id, count, "bid rate limited");
                Err(BidRejection::RateLimited {
                    retry_after_secs: self.settings.rate_window_secs,
                })
            }
            Ok(_) => Ok(()),
            Err(error) => {
                warn!(%error, "rate gate unavailable, failing open");
                Ok(())
            }
        }
    }

    fn auction_lock(&self, auction_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(auction_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn commit(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Bid, BidRejection> {
        let mut attempt = 0u32;
        loop {
            match self.store.place_bid(auction_id, user_id, amount, now).await {
                Ok(bid) => return Ok(bid),
                Err(error) if error.is_transient() && attempt < self.settings.commit_retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..10);
                    let backoff = Duration::from_millis((10u64 << attempt.min(6)) + jitter);
                    debug!(%auction_id, attempt, %error, "retrying transient store failure");
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(self.reject(auction_id, error)),
            }
        }
    }

    fn reject(&self, auction_id: Uuid, error: StoreError) -> BidRejection {
        match error {
            StoreError::AuctionNotFound => BidRejection::Validation("auction not found".to_string()),
            StoreError::AuctionNotActive => {
                BidRejection::Validation("auction is not open for bids".to_string())
            }
            StoreError::AuctionEnded => {
                // on-demand detection: make sure the terminal transition and
                // its event cluster actually happen
                let lifecycle = self.lifecycle.clone();
                tokio::spawn(async move {
                    if let Err(error) = lifecycle.finalize(auction_id, Utc::now()).await {
                        warn!(%auction_id, %error, "on-demand finalize failed");
                    }
                });
                BidRejection::Validation("auction has ended".to_string())
            }
            error @ StoreError::BidTooLow { .. } => BidRejection::Validation(error.to_string()),
            StoreError::SelfOutbid => {
                BidRejection::Validation("you already hold the highest bid".to_string())
            }
            StoreError::InvalidAuction(message) => BidRejection::Validation(message.to_string()),
            StoreError::Conflict | StoreError::Unavailable(_) | StoreError::Duplicate(_) => {
                warn!(%auction_id, %error, "bid commit failed after retries");
                BidRejection::Unavailable
            }
        }
    }

    /// Post-commit side effects, in order: highest cache + history tail,
    /// cross-replica publish, audit event. All best effort.
    fn spawn_side_effects(&self, summary: BidSummary) {
        let hot = self.hot.clone();
        let bus = self.bus.clone();
        let replica = self.replica;

        tokio::spawn(async move {
            let auction_id = summary.auction_id;

            if let Err(error) = hot.set_highest(auction_id, &summary).await {
                warn!(%auction_id, %error, "failed to cache highest bid");
            }
            if let Err(error) = hot.push_history(auction_id, &summary).await {
                warn!(%auction_id, %error, "failed to append history tail");
            }

            match serde_json::to_string(&summary) {
                Ok(payload) => {
                    let frame = PubSubFrame {
                        channel: bid_channel(auction_id),
                        origin: replica,
                        payload,
                    };
                    if let Err(error) = hot.publish(frame).await {
                        warn!(%auction_id, %error, "failed to publish bid frame");
                    }
                }
                Err(error) => warn!(%auction_id, %error, "failed to encode bid frame"),
            }

            let audit = BidAudit {
                bid_id: summary.bid_id,
                auction_id,
                user_id: summary.user_id,
                amount: summary.amount,
                timestamp: summary.timestamp,
            };
            match serde_json::to_value(&audit) {
                Ok(payload) => {
                    if let Err(error) = bus
                        .publish(EventStream::BidAudit, &audit.bid_id.to_string(), payload)
                        .await
                    {
                        warn!(%auction_id, %error, "failed to publish bid.audit");
                    }
                }
                Err(error) => warn!(%auction_id, %error, "failed to encode bid.audit"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, MemoryEventBus};
    use crate::gateway::session::SessionHandle;
    use crate::hotstate::{HotState, HotStateError, MemoryHotState, SessionMeta};
    use crate::models::{NewAuction, NewUser};
    use crate::settings::{EventSettings, HotStateSettings};
    use crate::store::{AuctionStore, SqlStore};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use tokio::sync::{broadcast, mpsc};

    struct Fixture {
        store: Arc<SqlStore>,
        hot: Arc<MemoryHotState>,
        bus: Arc<MemoryEventBus>,
        rooms: Arc<RoomHub>,
        bidding: Arc<BiddingService>,
        replica: Uuid,
    }

    fn build(
        store: Arc<SqlStore>,
        hot: SharedHotState,
        bus: SharedBus,
        replica: Uuid,
    ) -> (Arc<RoomHub>, Arc<BiddingService>) {
        let rooms = RoomHub::new(store.clone(), hot.clone(), replica);
        let lifecycle = LifecycleScheduler::new(
            store.clone(),
            bus.clone(),
            rooms.clone(),
            Duration::from_secs(30),
        );
        let bidding = BiddingService::new(
            store,
            hot,
            bus,
            rooms.clone(),
            lifecycle,
            BiddingSettings::default(),
            replica,
        );
        (rooms, bidding)
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqlStore::in_memory().await.unwrap());
        let hot = Arc::new(MemoryHotState::new(
            HotStateSettings::default(),
            Duration::from_secs(7200),
        ));
        let bus = Arc::new(MemoryEventBus::new(EventSettings::default()));
        let replica = Uuid::new_v4();
        let (rooms, bidding) = build(store.clone(), hot.clone(), bus.clone(), replica);
        Fixture {
            store,
            hot,
            bus,
            rooms,
            bidding,
            replica,
        }
    }

    async fn seed_user(store: &SqlStore, username: &str) -> Uuid {
        store
            .create_user(NewUser {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                password_hash: "x".to_string(),
                full_name: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn seed_auction(store: &SqlStore, open_for: ChronoDuration) -> Uuid {
        store
            .create_auction(NewAuction {
                item_id: Uuid::new_v4().to_string(),
                start_time: Utc::now() - ChronoDuration::minutes(1),
                end_time: Utc::now() + open_for,
                starting_bid: dec!(100),
            })
            .await
            .unwrap()
            .id
    }

    /// Poll until `probe` yields Some, or panic after a second.
    async fn eventually<T, F, Fut>(mut probe: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        for _ in 0..100 {
            if let Some(value) = probe().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within one second");
    }

    #[tokio::test]
    async fn accepted_bid_reaches_room_cache_and_audit_stream() {
        let fx = fixture().await;
        let u1 = seed_user(&fx.store, "u1").await;
        let auction_id = seed_auction(&fx.store, ChronoDuration::minutes(10)).await;

        let (tx, mut rx) = mpsc::channel(8);
        let member = SessionHandle::new(Uuid::new_v4(), "watcher".to_string(), tx);
        fx.rooms.join(member, auction_id).await.unwrap();

        let mut frames = fx.hot.subscribe();

        let bid = fx
            .bidding
            .submit(u1, "u1", auction_id, dec!(150), Utc::now())
            .await
            .expect("bid accepted");
        assert_eq!(bid.amount, dec!(150));

        // the durable row is ground truth
        let auction = fx.store.get_auction(auction_id).await.unwrap().unwrap();
        assert_eq!(auction.current_highest_bid, dec!(150));

        // local room members see newBid without waiting on the side-effect task
        match rx.recv().await.unwrap() {
            ServerMessage::NewBid { bid: seen } => {
                assert_eq!(seen.amount, dec!(150));
                assert_eq!(seen.username, "u1");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // detached side effects: cache, pub/sub frame tagged with our
        // replica, audit event
        let cached = eventually(|| async {
            fx.hot.get_highest(auction_id).await.unwrap()
        })
        .await;
        assert_eq!(cached.bid_id, bid.id);

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.origin, fx.replica);
        assert_eq!(frame.channel, bid_channel(auction_id));

        let delivery = eventually(|| async {
            fx.bus.pull(EventStream::BidAudit).await.unwrap()
        })
        .await;
        assert_eq!(delivery.key, bid.id.to_string());
    }

    #[tokio::test]
    async fn equal_bid_is_rejected_and_store_untouched() {
        let fx = fixture().await;
        let u1 = seed_user(&fx.store, "u1").await;
        let u2 = seed_user(&fx.store, "u2").await;
        let auction_id = seed_auction(&fx.store, ChronoDuration::minutes(10)).await;

        fx.bidding
            .submit(u1, "u1", auction_id, dec!(150), Utc::now())
            .await
            .unwrap();

        let rejection = fx
            .bidding
            .submit(u2, "u2", auction_id, dec!(150), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(rejection.code(), BidErrorCode::BidValidationError);

        let auction = fx.store.get_auction(auction_id).await.unwrap().unwrap();
        assert_eq!(auction.current_highest_bid, dec!(150));
        assert_eq!(fx.store.list_bids(auction_id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn highest_holder_cannot_outbid_themselves() {
        let fx = fixture().await;
        let u1 = seed_user(&fx.store, "u1").await;
        let auction_id = seed_auction(&fx.store, ChronoDuration::minutes(10)).await;

        fx.bidding
            .submit(u1, "u1", auction_id, dec!(150), Utc::now())
            .await
            .unwrap();

        let rejection = fx
            .bidding
            .submit(u1, "u1", auction_id, dec!(200), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(rejection.code(), BidErrorCode::BidValidationError);
        assert!(rejection.to_string().contains("highest"));
    }

    #[tokio::test]
    async fn sixth_submission_in_the_window_is_rate_limited() {
        let fx = fixture().await;
        let u3 = seed_user(&fx.store, "u3").await;
        let auction_id = seed_auction(&fx.store, ChronoDuration::minutes(10)).await;

        // five submissions evaluated on their merits
        for step in 1..=5 {
            let amount = Decimal::from(100 + step * 10);
            fx.bidding
                .submit(u3, "u3", auction_id, amount, Utc::now())
                .await
                .ok();
        }

        let rejection = fx
            .bidding
            .submit(u3, "u3", auction_id, dec!(900), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(rejection.code(), BidErrorCode::RateLimitExceeded);
    }

    #[tokio::test]
    async fn invalid_amounts_never_charge_the_rate_gate() {
        let fx = fixture().await;
        let u1 = seed_user(&fx.store, "u1").await;
        let auction_id = seed_auction(&fx.store, ChronoDuration::minutes(10)).await;

        for _ in 0..10 {
            let rejection = fx
                .bidding
                .submit(u1, "u1", auction_id, dec!(-5), Utc::now())
                .await
                .unwrap_err();
            assert_eq!(rejection.code(), BidErrorCode::InvalidAmount);
        }
        let too_big = fx
            .bidding
            .submit(u1, "u1", auction_id, dec!(999_000_000), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(too_big.code(), BidErrorCode::InvalidAmount);

        // the gate was never charged, so a valid bid still passes
        fx.bidding
            .submit(u1, "u1", auction_id, dec!(150), Utc::now())
            .await
            .expect("valid bid accepted");
    }

    #[tokio::test]
    async fn concurrent_equal_bids_admit_exactly_one() {
        let fx = fixture().await;
        let u4 = seed_user(&fx.store, "u4").await;
        let u5 = seed_user(&fx.store, "u5").await;
        let auction_id = seed_auction(&fx.store, ChronoDuration::minutes(10)).await;

        let now = Utc::now();
        let (first, second) = tokio::join!(
            fx.bidding.submit(u4, "u4", auction_id, dec!(200), now),
            fx.bidding.submit(u5, "u5", auction_id, dec!(200), now),
        );

        assert!(
            first.is_ok() != second.is_ok(),
            "exactly one of the two concurrent bids must win"
        );
        let auction = fx.store.get_auction(auction_id).await.unwrap().unwrap();
        assert_eq!(auction.current_highest_bid, dec!(200));
        assert_eq!(fx.store.list_bids(auction_id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_auction_is_finalized_on_demand() {
        let fx = fixture().await;
        let u1 = seed_user(&fx.store, "u1").await;
        let auction_id = seed_auction(&fx.store, ChronoDuration::seconds(1)).await;

        let late = Utc::now() + ChronoDuration::minutes(2);
        let rejection = fx
            .bidding
            .submit(u1, "u1", auction_id, dec!(150), late)
            .await
            .unwrap_err();
        assert_eq!(rejection.code(), BidErrorCode::BidValidationError);

        // the read path kicked off the terminal transition
        let status = eventually(|| async {
            let auction = fx.store.get_auction(auction_id).await.unwrap().unwrap();
            auction.status.is_terminal().then_some(auction.status)
        })
        .await;
        assert!(status.is_terminal());
    }

    /// Hot state that always fails, to prove the pipeline degrades instead
    /// of blocking bid acceptance.
    struct DownHotState;

    #[async_trait]
    impl HotState for DownHotState {
        async fn set_highest(
            &self,
            _: Uuid,
            _: &BidSummary,
        ) -> Result<(), HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn get_highest(&self, _: Uuid) -> Result<Option<BidSummary>, HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn push_history(
            &self,
            _: Uuid,
            _: &BidSummary,
        ) -> Result<(), HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn recent_history(
            &self,
            _: Uuid,
            _: usize,
        ) -> Result<Vec<BidSummary>, HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn set_session(&self, _: Uuid, _: SessionMeta) -> Result<(), HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn get_session(&self, _: Uuid) -> Result<Option<SessionMeta>, HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn clear_session(&self, _: Uuid) -> Result<(), HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn incr_rate(&self, _: &str, _: Duration, _: u32) -> Result<u32, HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        async fn publish(&self, _: PubSubFrame) -> Result<(), HotStateError> {
            Err(HotStateError::Unavailable("down".to_string()))
        }
        fn subscribe(&self) -> broadcast::Receiver<PubSubFrame> {
            broadcast::channel(1).1
        }
    }

    #[tokio::test]
    async fn rate_gate_fails_open_when_hot_state_is_down() {
        let store = Arc::new(SqlStore::in_memory().await.unwrap());
        let bus = Arc::new(MemoryEventBus::new(EventSettings::default()));
        let (_rooms, bidding) = build(
            store.clone(),
            Arc::new(DownHotState),
            bus,
            Uuid::new_v4(),
        );

        let u1 = seed_user(&store, "u1").await;
        let auction_id = seed_auction(&store, ChronoDuration::minutes(10)).await;

        bidding
            .submit(u1, "u1", auction_id, dec!(150), Utc::now())
            .await
            .expect("bid accepted despite hot state outage");
    }
}
