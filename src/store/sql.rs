//! SQL Store
//!
//! `sqlx::AnyPool` implementation of [`AuctionStore`]. Amounts are stored as
//! text-encoded decimals and instants as epoch milliseconds, which keeps the
//! schema portable across the Any driver's backends. All amount comparisons
//! happen in Rust on parsed decimals; the highest-bid update is guarded by a
//! compare-and-swap on the exact text previously read, so a lost race
//! surfaces as [`StoreError::Conflict`] instead of a silent overwrite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use super::{AuctionStore, StoreError};
use crate::models::{Auction, AuctionStatus, Bid, EndOutcome, NewAuction, NewUser, User};

const AUCTION_COLUMNS: &str = "id, item_id, start_time, end_time, starting_bid, \
     current_highest_bid, winner_id, status, created_at, updated_at";

/// Durable store over `sqlx::AnyPool`
#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    /// Connect and create missing tables.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Isolated in-memory database. Each call gets its own namespace;
    /// `cache=shared` lets every pool connection see the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let url = format!(
            "sqlite:file:{}?mode=memory&cache=shared",
            Uuid::new_v4().simple()
        );
        Self::connect(&url, 5).await
    }

    /// Underlying pool, shared with the SQL event bus.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL UNIQUE,
                email         TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                full_name     TEXT,
                is_active     BIGINT NOT NULL DEFAULT 1,
                created_at    BIGINT NOT NULL,
                updated_at    BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS auctions (
                id                  TEXT PRIMARY KEY,
                item_id             TEXT NOT NULL UNIQUE,
                start_time          BIGINT NOT NULL,
                end_time            BIGINT NOT NULL,
                starting_bid        TEXT NOT NULL,
                current_highest_bid TEXT NOT NULL,
                winner_id           TEXT,
                status              TEXT NOT NULL,
                created_at          BIGINT NOT NULL,
                updated_at          BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bids (
                id         TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL REFERENCES users (id),
                auction_id TEXT NOT NULL REFERENCES auctions (id),
                amount     TEXT NOT NULL,
                timestamp  BIGINT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_bids_auction_time ON bids (auction_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_auctions_status_end ON auctions (status, end_time)",
            r#"
            CREATE TABLE IF NOT EXISTS notification_log (
                dedup_key   TEXT PRIMARY KEY,
                recorded_at BIGINT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuctionStore for SqlStore {
    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let user = User {
            id: Uuid::now_v7(),
            username: new.username,
            email: new.email,
            password_hash: new.password_hash,
            full_name: new.full_name,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        };

        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, full_name, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.full_name.clone())
        .bind(1_i64)
        .bind(user.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, email, password_hash, full_name, is_active, created_at, updated_at \
             FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn create_auction(&self, new: NewAuction) -> Result<Auction, StoreError> {
        if new.end_time <= new.start_time {
            return Err(StoreError::InvalidAuction("end_time must follow start_time"));
        }
        if new.starting_bid <= Decimal::ZERO {
            return Err(StoreError::InvalidAuction("starting_bid must be positive"));
        }

        let auction = Auction {
            id: Uuid::now_v7(),
            item_id: new.item_id,
            start_time: new.start_time,
            end_time: new.end_time,
            starting_bid: new.starting_bid,
            current_highest_bid: new.starting_bid,
            winner_id: None,
            status: AuctionStatus::Active,
            created_at: Utc::now(),
            updated_at: None,
        };

        sqlx::query(
            "INSERT INTO auctions \
             (id, item_id, start_time, end_time, starting_bid, current_highest_bid, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(auction.id.to_string())
        .bind(&auction.item_id)
        .bind(auction.start_time.timestamp_millis())
        .bind(auction.end_time.timestamp_millis())
        .bind(auction.starting_bid.to_string())
        .bind(auction.current_highest_bid.to_string())
        .bind(auction.status.as_str())
        .bind(auction.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(auction)
    }

    async fn get_auction(&self, id: Uuid) -> Result<Option<Auction>, StoreError> {
        let query = format!("SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| auction_from_row(&r)).transpose()
    }

    async fn place_bid(
        &self,
        auction_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Bid, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(auction_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::AuctionNotFound)?;

        let auction = auction_from_row(&row)?;
        // CAS guard binds the exact text we read, not a re-rendered decimal
        let highest_text: String = row.try_get("current_highest_bid")?;

        match auction.status {
            AuctionStatus::Active => {}
            AuctionStatus::Ended => return Err(StoreError::AuctionEnded),
            AuctionStatus::Cancelled => return Err(StoreError::AuctionNotActive),
        }
        if now < auction.start_time {
            return Err(StoreError::AuctionNotActive);
        }
        if now >= auction.end_time {
            return Err(StoreError::AuctionEnded);
        }
        if amount < auction.starting_bid || amount <= auction.current_highest_bid {
            return Err(StoreError::BidTooLow {
                highest: auction.current_highest_bid,
            });
        }

        let newest = sqlx::query(
            "SELECT user_id, timestamp FROM bids \
             WHERE auction_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(auction_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let mut timestamp = now.timestamp_millis();
        if let Some(r) = newest {
            let holder: String = r.try_get("user_id")?;
            if parse_uuid(&holder)? == user_id {
                return Err(StoreError::SelfOutbid);
            }
            let last: i64 = r.try_get("timestamp")?;
            timestamp = timestamp.max(last + 1);
        }

        let bid = Bid {
            id: Uuid::now_v7(),
            auction_id,
            user_id,
            amount,
            timestamp,
        };

        sqlx::query("INSERT INTO bids (id, user_id, auction_id, amount, timestamp) VALUES (?, ?, ?, ?, ?)")
            .bind(bid.id.to_string())
            .bind(bid.user_id.to_string())
            .bind(bid.auction_id.to_string())
            .bind(bid.amount.to_string())
            .bind(bid.timestamp)
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query(
            "UPDATE auctions SET current_highest_bid = ?, updated_at = ? \
             WHERE id = ? AND status = 'ACTIVE' AND current_highest_bid = ?",
        )
        .bind(bid.amount.to_string())
        .bind(now.timestamp_millis())
        .bind(auction_id.to_string())
        .bind(&highest_text)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        tx.commit().await?;
        Ok(bid)
    }

    async fn end_auction(&self, id: Uuid, now: DateTime<Utc>) -> Result<EndOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::AuctionNotFound)?;
        let mut auction = auction_from_row(&row)?;

        let participants = participants_tx(&mut tx, id).await?;

        if auction.status.is_terminal() {
            tx.commit().await?;
            return Ok(EndOutcome {
                auction,
                participants,
                transitioned: false,
            });
        }

        let winner = sqlx::query(
            "SELECT user_id FROM bids WHERE auction_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| {
            let holder: String = r.try_get("user_id")?;
            parse_uuid(&holder)
        })
        .transpose()?;

        let updated = sqlx::query(
            "UPDATE auctions SET status = 'ENDED', winner_id = ?, updated_at = ? \
             WHERE id = ? AND status = 'ACTIVE'",
        )
        .bind(winner.map(|w| w.to_string()))
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Another replica ended it between our read and write.
            return Err(StoreError::Conflict);
        }

        tx.commit().await?;

        auction.status = AuctionStatus::Ended;
        auction.winner_id = winner;
        auction.updated_at = Some(now);

        Ok(EndOutcome {
            auction,
            participants,
            transitioned: true,
        })
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT id FROM auctions WHERE status = 'ACTIVE' AND end_time <= ?")
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| {
                let id: String = r.try_get("id")?;
                parse_uuid(&id)
            })
            .collect()
    }

    async fn list_bids(&self, auction_id: Uuid, limit: u32) -> Result<Vec<Bid>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, auction_id, amount, timestamp FROM bids \
             WHERE auction_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(auction_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(bid_from_row).collect()
    }

    async fn participants(&self, auction_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT user_id FROM bids WHERE auction_id = ?")
            .bind(auction_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| {
                let id: String = r.try_get("user_id")?;
                parse_uuid(&id)
            })
            .collect()
    }

    async fn record_notification(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO notification_log (dedup_key, recorded_at) VALUES (?, ?) \
             ON CONFLICT (dedup_key) DO NOTHING",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

async fn participants_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    auction_id: Uuid,
) -> Result<Vec<Uuid>, StoreError> {
    let rows = sqlx::query("SELECT DISTINCT user_id FROM bids WHERE auction_id = ?")
        .bind(auction_id.to_string())
        .fetch_all(&mut **tx)
        .await?;

    rows.iter()
        .map(|r| {
            let id: String = r.try_get("user_id")?;
            parse_uuid(&id)
        })
        .collect()
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|_| StoreError::Unavailable(format!("corrupt uuid: {text}")))
}

fn parse_amount(text: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(text).map_err(|_| StoreError::Unavailable(format!("corrupt amount: {text}")))
}

fn parse_instant(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Unavailable(format!("timestamp out of range: {ms}")))
}

fn auction_from_row(row: &AnyRow) -> Result<Auction, StoreError> {
    let id: String = row.try_get("id")?;
    let starting: String = row.try_get("starting_bid")?;
    let highest: String = row.try_get("current_highest_bid")?;
    let winner: Option<String> = row.try_get("winner_id")?;
    let status: String = row.try_get("status")?;
    let updated: Option<i64> = row.try_get("updated_at")?;

    Ok(Auction {
        id: parse_uuid(&id)?,
        item_id: row.try_get("item_id")?,
        start_time: parse_instant(row.try_get("start_time")?)?,
        end_time: parse_instant(row.try_get("end_time")?)?,
        starting_bid: parse_amount(&starting)?,
        current_highest_bid: parse_amount(&highest)?,
        winner_id: winner.as_deref().map(parse_uuid).transpose()?,
        status: AuctionStatus::parse(&status)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown status: {status}")))?,
        created_at: parse_instant(row.try_get("created_at")?)?,
        updated_at: updated.map(parse_instant).transpose()?,
    })
}

fn bid_from_row(row: &AnyRow) -> Result<Bid, StoreError> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let auction_id: String = row.try_get("auction_id")?;
    let amount: String = row.try_get("amount")?;

    Ok(Bid {
        id: parse_uuid(&id)?,
        auction_id: parse_uuid(&auction_id)?,
        user_id: parse_uuid(&user_id)?,
        amount: parse_amount(&amount)?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn user_from_row(row: &AnyRow) -> Result<User, StoreError> {
    let id: String = row.try_get("id")?;
    let is_active: i64 = row.try_get("is_active")?;
    let updated: Option<i64> = row.try_get("updated_at")?;

    Ok(User {
        id: parse_uuid(&id)?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        full_name: row.try_get("full_name")?,
        is_active: is_active != 0,
        created_at: parse_instant(row.try_get("created_at")?)?,
        updated_at: updated.map(parse_instant).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn store() -> SqlStore {
        SqlStore::in_memory().await.expect("in-memory store")
    }

    async fn seed_user(store: &SqlStore, username: &str) -> User {
        store
            .create_user(NewUser {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                password_hash: "x".to_string(),
                full_name: None,
            })
            .await
            .expect("create user")
    }

    async fn seed_auction(store: &SqlStore, starting: Decimal, open_for: Duration) -> Auction {
        let now = Utc::now();
        store
            .create_auction(NewAuction {
                item_id: Uuid::new_v4().to_string(),
                start_time: now - Duration::minutes(1),
                end_time: now + open_for,
                starting_bid: starting,
            })
            .await
            .expect("create auction")
    }

    #[tokio::test]
    async fn auction_round_trips() {
        let store = store().await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        let loaded = store.get_auction(auction.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AuctionStatus::Active);
        assert_eq!(loaded.starting_bid, dec!(100));
        assert_eq!(loaded.current_highest_bid, dec!(100));
        assert_eq!(loaded.item_id, auction.item_id);
        assert!(loaded.winner_id.is_none());

        assert!(store.get_auction(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_auction_specs() {
        let store = store().await;
        let now = Utc::now();

        let backwards = store
            .create_auction(NewAuction {
                item_id: "lot".to_string(),
                start_time: now,
                end_time: now - Duration::minutes(1),
                starting_bid: dec!(10),
            })
            .await;
        assert!(matches!(backwards, Err(StoreError::InvalidAuction(_))));

        let free = store
            .create_auction(NewAuction {
                item_id: "lot".to_string(),
                start_time: now,
                end_time: now + Duration::minutes(1),
                starting_bid: Decimal::ZERO,
            })
            .await;
        assert!(matches!(free, Err(StoreError::InvalidAuction(_))));
    }

    #[tokio::test]
    async fn accepted_bid_advances_highest() {
        let store = store().await;
        let bidder = seed_user(&store, "u1").await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        let bid = store
            .place_bid(auction.id, bidder.id, dec!(150), Utc::now())
            .await
            .expect("bid accepted");
        assert_eq!(bid.amount, dec!(150));

        let loaded = store.get_auction(auction.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_highest_bid, dec!(150));

        let bids = store.list_bids(auction.id, 10).await.unwrap();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].id, bid.id);
    }

    #[tokio::test]
    async fn equal_amount_is_too_low() {
        let store = store().await;
        let u1 = seed_user(&store, "u1").await;
        let u2 = seed_user(&store, "u2").await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        store
            .place_bid(auction.id, u1.id, dec!(150), Utc::now())
            .await
            .unwrap();

        let err = store
            .place_bid(auction.id, u2.id, dec!(150), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BidTooLow { highest } if highest == dec!(150)));

        // store unchanged
        let loaded = store.get_auction(auction.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_highest_bid, dec!(150));
        assert_eq!(store.list_bids(auction.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn starting_bid_must_be_met() {
        let store = store().await;
        let u1 = seed_user(&store, "u1").await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        let err = store
            .place_bid(auction.id, u1.id, dec!(99), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BidTooLow { .. }));
    }

    #[tokio::test]
    async fn holder_of_highest_cannot_raise_own_bid() {
        let store = store().await;
        let u1 = seed_user(&store, "u1").await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        store
            .place_bid(auction.id, u1.id, dec!(150), Utc::now())
            .await
            .unwrap();

        let err = store
            .place_bid(auction.id, u1.id, dec!(200), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SelfOutbid));

        let loaded = store.get_auction(auction.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_highest_bid, dec!(150));
    }

    #[tokio::test]
    async fn bids_after_end_time_are_rejected() {
        let store = store().await;
        let u1 = seed_user(&store, "u1").await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        let late = Utc::now() + Duration::minutes(11);
        let err = store
            .place_bid(auction.id, u1.id, dec!(150), late)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AuctionEnded));
    }

    #[tokio::test]
    async fn unknown_auction_is_reported() {
        let store = store().await;
        let u1 = seed_user(&store, "u1").await;

        let err = store
            .place_bid(Uuid::new_v4(), u1.id, dec!(150), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AuctionNotFound));
    }

    #[tokio::test]
    async fn timestamps_strictly_increase_per_auction() {
        let store = store().await;
        let u1 = seed_user(&store, "u1").await;
        let u2 = seed_user(&store, "u2").await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        // same wall-clock instant for every bid
        let now = Utc::now();
        store.place_bid(auction.id, u1.id, dec!(110), now).await.unwrap();
        store.place_bid(auction.id, u2.id, dec!(120), now).await.unwrap();
        store.place_bid(auction.id, u1.id, dec!(130), now).await.unwrap();

        let bids = store.list_bids(auction.id, 10).await.unwrap();
        assert_eq!(bids.len(), 3);
        // newest first, amounts and timestamps strictly decreasing in list order
        for pair in bids.windows(2) {
            assert!(pair[0].timestamp > pair[1].timestamp);
            assert!(pair[0].amount > pair[1].amount);
        }
    }

    #[tokio::test]
    async fn end_resolves_winner_and_is_idempotent() {
        let store = store().await;
        let u1 = seed_user(&store, "u1").await;
        let u2 = seed_user(&store, "u2").await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        store.place_bid(auction.id, u1.id, dec!(300), Utc::now()).await.unwrap();
        store.place_bid(auction.id, u2.id, dec!(400), Utc::now()).await.unwrap();

        let first = store.end_auction(auction.id, Utc::now()).await.unwrap();
        assert!(first.transitioned);
        assert_eq!(first.auction.status, AuctionStatus::Ended);
        assert_eq!(first.auction.winner_id, Some(u2.id));
        assert_eq!(first.participants.len(), 2);

        let second = store.end_auction(auction.id, Utc::now()).await.unwrap();
        assert!(!second.transitioned);
        assert_eq!(second.auction.status, AuctionStatus::Ended);
        assert_eq!(second.auction.winner_id, Some(u2.id));

        // terminal: no more bids
        let err = store
            .place_bid(auction.id, u1.id, dec!(500), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AuctionEnded));
    }

    #[tokio::test]
    async fn end_without_bids_has_no_winner() {
        let store = store().await;
        let auction = seed_auction(&store, dec!(100), Duration::minutes(10)).await;

        let outcome = store.end_auction(auction.id, Utc::now()).await.unwrap();
        assert!(outcome.transitioned);
        assert!(outcome.auction.winner_id.is_none());
        assert!(outcome.participants.is_empty());
    }

    #[tokio::test]
    async fn expired_sweep_only_sees_overdue_active_auctions() {
        let store = store().await;
        let due = seed_auction(&store, dec!(100), Duration::seconds(1)).await;
        let open = seed_auction(&store, dec!(100), Duration::minutes(30)).await;

        let later = Utc::now() + Duration::minutes(1);
        let expired = store.list_expired(later).await.unwrap();
        assert!(expired.contains(&due.id));
        assert!(!expired.contains(&open.id));

        // once ended it leaves the sweep set
        store.end_auction(due.id, later).await.unwrap();
        let expired = store.list_expired(later).await.unwrap();
        assert!(!expired.contains(&due.id));
    }

    #[tokio::test]
    async fn notification_sink_accepts_each_key_once() {
        let store = store().await;

        assert!(store.record_notification("a:u:WON").await.unwrap());
        assert!(!store.record_notification("a:u:WON").await.unwrap());
        assert!(store.record_notification("a:u:LOST").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = store().await;
        seed_user(&store, "taken").await;

        let err = store
            .create_user(NewUser {
                username: "taken".to_string(),
                email: "other@example.com".to_string(),
                password_hash: "x".to_string(),
                full_name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }
}
