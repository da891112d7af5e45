//! SQL Event Bus
//!
//! Durable queue rows in the store database, sharing its pool. A claim is an
//! optimistic update guarded on the attempt counter, so two replicas pulling
//! the same stream never double-deliver inside one visibility window; an
//! expired lease simply makes the row claimable again. Rows that exhaust
//! their attempts move to `dead_letters`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{AnyPool, Row};

use super::{BusError, Delivery, EventBus, EventStream};
use crate::settings::EventSettings;

/// Claim attempts per pull before giving up the poll round.
const CLAIM_ROUNDS: u32 = 16;

/// Durable [`EventBus`] over `sqlx::AnyPool`
#[derive(Clone)]
pub struct SqlEventBus {
    pool: AnyPool,
    settings: EventSettings,
}

impl SqlEventBus {
    /// Wrap an existing pool and create missing tables.
    pub async fn new(pool: AnyPool, settings: EventSettings) -> Result<Self, BusError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS event_queue (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                stream       TEXT NOT NULL,
                dedup_key    TEXT NOT NULL,
                payload      TEXT NOT NULL,
                attempts     BIGINT NOT NULL DEFAULT 0,
                available_at BIGINT NOT NULL,
                created_at   BIGINT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_event_queue_stream ON event_queue (stream, available_at)",
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                stream    TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                payload   TEXT NOT NULL,
                attempts  BIGINT NOT NULL,
                failed_at BIGINT NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool, settings })
    }
}

#[async_trait]
impl EventBus for SqlEventBus {
    async fn publish(
        &self,
        stream: EventStream,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO event_queue (stream, dedup_key, payload, attempts, available_at, created_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(stream.name())
        .bind(key)
        .bind(payload.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pull(&self, stream: EventStream) -> Result<Option<Delivery>, BusError> {
        for _ in 0..CLAIM_ROUNDS {
            let now = Utc::now().timestamp_millis();

            let row = sqlx::query(
                "SELECT id, dedup_key, payload, attempts FROM event_queue \
                 WHERE stream = ? AND available_at <= ? ORDER BY id LIMIT 1",
            )
            .bind(stream.name())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id: i64 = row.try_get("id")?;
            let key: String = row.try_get("dedup_key")?;
            let payload_text: String = row.try_get("payload")?;
            let attempts: i64 = row.try_get("attempts")?;

            if attempts >= i64::from(self.settings.max_attempts) {
                let parked = sqlx::query(
                    "INSERT INTO dead_letters (stream, dedup_key, payload, attempts, failed_at) \
                     SELECT stream, dedup_key, payload, attempts, ? FROM event_queue \
                     WHERE id = ? AND attempts = ?",
                )
                .bind(now)
                .bind(id)
                .bind(attempts)
                .execute(&self.pool)
                .await?;
                if parked.rows_affected() == 1 {
                    sqlx::query("DELETE FROM event_queue WHERE id = ?")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
                continue;
            }

            let lease_until = now + (self.settings.visibility_timeout_secs as i64) * 1000;
            let claimed = sqlx::query(
                "UPDATE event_queue SET attempts = attempts + 1, available_at = ? \
                 WHERE id = ? AND attempts = ?",
            )
            .bind(lease_until)
            .bind(id)
            .bind(attempts)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                // another consumer claimed it first
                continue;
            }

            let payload = serde_json::from_str(&payload_text)
                .map_err(|e| BusError::Unavailable(format!("corrupt payload: {e}")))?;

            return Ok(Some(Delivery {
                receipt: id,
                stream,
                key,
                payload,
                attempts: (attempts + 1) as u32,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        sqlx::query("DELETE FROM event_queue WHERE id = ?")
            .bind(delivery.receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, stream: EventStream) -> Result<Vec<Delivery>, BusError> {
        let rows = sqlx::query(
            "SELECT id, dedup_key, payload, attempts FROM dead_letters WHERE stream = ? ORDER BY id",
        )
        .bind(stream.name())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload_text: String = row.try_get("payload")?;
                let attempts: i64 = row.try_get("attempts")?;
                let payload = serde_json::from_str(&payload_text)
                    .map_err(|e| BusError::Unavailable(format!("corrupt payload: {e}")))?;
                Ok(Delivery {
                    receipt: row.try_get("id")?,
                    stream,
                    key: row.try_get("dedup_key")?,
                    payload,
                    attempts: attempts as u32,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqlStore;
    use serde_json::json;

    async fn bus(visibility_secs: u64, max_attempts: u32) -> SqlEventBus {
        let store = SqlStore::in_memory().await.expect("store");
        SqlEventBus::new(
            store.pool().clone(),
            EventSettings {
                visibility_timeout_secs: visibility_secs,
                max_attempts,
                poll_interval_ms: 10,
            },
        )
        .await
        .expect("bus schema")
    }

    #[tokio::test]
    async fn messages_survive_the_publish_pull_ack_cycle() {
        let bus = bus(30, 8).await;
        bus.publish(EventStream::BidAudit, "b1", json!({"amount": "150"}))
            .await
            .unwrap();

        let delivery = bus.pull(EventStream::BidAudit).await.unwrap().unwrap();
        assert_eq!(delivery.key, "b1");
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.payload["amount"], "150");

        // invisible while leased
        assert!(bus.pull(EventStream::BidAudit).await.unwrap().is_none());

        bus.ack(&delivery).await.unwrap();
        assert!(bus.pull(EventStream::BidAudit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streams_do_not_cross_deliver() {
        let bus = bus(30, 8).await;
        bus.publish(EventStream::AuctionEnded, "a1", json!({}))
            .await
            .unwrap();

        assert!(bus.pull(EventStream::NotifyUser).await.unwrap().is_none());
        assert!(bus.pull(EventStream::AuctionEnded).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_makes_the_message_claimable_again() {
        // zero-length visibility: the lease is expired as soon as it is taken
        let bus = bus(0, 8).await;
        bus.publish(EventStream::NotifyUser, "n1", json!({}))
            .await
            .unwrap();

        let first = bus.pull(EventStream::NotifyUser).await.unwrap().unwrap();
        let second = bus.pull(EventStream::NotifyUser).await.unwrap().unwrap();
        assert_eq!(first.receipt, second.receipt);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_messages_park_in_the_dead_letter_queue() {
        let bus = bus(0, 2).await;
        bus.publish(EventStream::NotifyUser, "poison", json!({}))
            .await
            .unwrap();

        // two failed deliveries, then the third pull parks it
        assert!(bus.pull(EventStream::NotifyUser).await.unwrap().is_some());
        assert!(bus.pull(EventStream::NotifyUser).await.unwrap().is_some());
        assert!(bus.pull(EventStream::NotifyUser).await.unwrap().is_none());

        let dead = bus.dead_letters(EventStream::NotifyUser).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key, "poison");
        assert_eq!(dead[0].attempts, 2);

        // the live queue no longer holds it
        assert!(bus.pull(EventStream::NotifyUser).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ordered_delivery_within_one_stream() {
        let bus = bus(30, 8).await;
        for key in ["first", "second", "third"] {
            bus.publish(EventStream::BidAudit, key, json!({})).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(delivery) = bus.pull(EventStream::BidAudit).await.unwrap() {
            seen.push(delivery.key.clone());
            bus.ack(&delivery).await.unwrap();
        }
        assert_eq!(seen, vec!["first", "second", "third"]);
    }
}
