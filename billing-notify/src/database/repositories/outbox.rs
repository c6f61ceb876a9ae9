//! Outbox repository.
//!
//! The billing batch inserts READY rows; the relay is the only writer of the
//! READY -> PUBLISHED transition.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::Result;
use crate::database::MAX_BULK_ROWS;
use crate::database::models::{OutboxEventDbModel, OutboxStatus, OutboxStatusCounts};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::Channel;

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Oldest READY rows first.
    async fn fetch_ready(&self, limit: u32) -> Result<Vec<OutboxEventDbModel>>;
    /// Flip READY rows to PUBLISHED in one statement per chunk.
    async fn mark_published(&self, event_ids: &[String]) -> Result<u64>;
    /// Insert or refresh a row keyed by (bill_id, channel).
    async fn upsert(&self, event: &OutboxEventDbModel) -> Result<()>;
    async fn find(&self, bill_id: i64, channel: Channel) -> Result<Option<OutboxEventDbModel>>;
    async fn status_counts(&self) -> Result<OutboxStatusCounts>;
}

pub struct SqlxOutboxRepository {
    pool: SqlitePool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn mark_published_chunk(&self, event_ids: &[String], now: i64) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE outbox_event SET status = ");
        qb.push_bind(OutboxStatus::Published.as_str())
            .push(", updated_at = ")
            .push_bind(now)
            .push(" WHERE status = ")
            .push_bind(OutboxStatus::Ready.as_str())
            .push(" AND event_id IN (");
        {
            let mut ids = qb.separated(", ");
            for id in event_ids {
                ids.push_bind(id.as_str());
            }
        }
        qb.push(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn fetch_ready(&self, limit: u32) -> Result<Vec<OutboxEventDbModel>> {
        let rows = sqlx::query_as::<_, OutboxEventDbModel>(
            r#"
            SELECT * FROM outbox_event
            WHERE status = ?
            ORDER BY created_at, event_id
            LIMIT ?
            "#,
        )
        .bind(OutboxStatus::Ready.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_published(&self, event_ids: &[String]) -> Result<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }

        let now = now_ms();
        let mut updated = 0;
        for chunk in event_ids.chunks(MAX_BULK_ROWS) {
            updated += retry_on_sqlite_busy("outbox_mark_published", || {
                self.mark_published_chunk(chunk, now)
            })
            .await?;
        }
        Ok(updated)
    }

    async fn upsert(&self, event: &OutboxEventDbModel) -> Result<()> {
        // Status is never part of the update, so a PUBLISHED row stays PUBLISHED.
        sqlx::query(
            r#"
            INSERT INTO outbox_event (
                event_id, bill_id, user_id, event_type, channel, payload,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bill_id, channel) DO UPDATE SET
                user_id = excluded.user_id,
                event_type = excluded.event_type,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            WHERE outbox_event.status = 'READY'
            "#,
        )
        .bind(&event.event_id)
        .bind(event.bill_id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(&event.channel)
        .bind(&event.payload)
        .bind(OutboxStatus::Ready.as_str())
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, bill_id: i64, channel: Channel) -> Result<Option<OutboxEventDbModel>> {
        let row = sqlx::query_as::<_, OutboxEventDbModel>(
            "SELECT * FROM outbox_event WHERE bill_id = ? AND channel = ?",
        )
        .bind(bill_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn status_counts(&self) -> Result<OutboxStatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_event GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = OutboxStatusCounts::default();
        for (status, count) in rows {
            match OutboxStatus::parse(&status) {
                Some(OutboxStatus::Ready) => counts.ready = count as u64,
                Some(OutboxStatus::Published) => counts.published = count as u64,
                None => tracing::warn!(status = %status, "Unknown outbox status"),
            }
        }
        Ok(counts)
    }
}
