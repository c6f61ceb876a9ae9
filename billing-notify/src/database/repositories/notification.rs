//! Notification record repository.
//!
//! Records are keyed by (bill_id, channel). Writes are bulk upserts guarded so
//! that a terminal row (SENT, or escalated) is never overwritten by a late
//! attempt, and `retry_count` never moves backwards.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::Result;
use crate::database::MAX_BULK_ROWS;
use crate::database::models::NotificationRecordDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{Channel, NotificationRecord, NotificationStatus};

#[async_trait]
pub trait NotificationRecordRepository: Send + Sync {
    /// Write every record in one bulk statement per chunk.
    async fn upsert_all(&self, records: &[NotificationRecord]) -> Result<u64>;
    async fn find(&self, bill_id: i64, channel: Channel) -> Result<Option<NotificationRecord>>;
    /// FAILED rows not yet escalated, oldest first.
    async fn find_failed(&self, limit: u32) -> Result<Vec<NotificationRecord>>;
    /// Whether the durable record for (bill_id, channel) is SENT.
    async fn is_sent(&self, bill_id: i64, channel: Channel) -> Result<bool>;
    /// Put RETRY rows whose re-publish failed back to their FAILED state.
    async fn restore_failed(&self, records: &[NotificationRecord]) -> Result<u64>;
    async fn count_by_status(&self) -> Result<Vec<(NotificationStatus, u64)>>;
}

pub struct SqlxNotificationRecordRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert_chunk(&self, rows: &[NotificationRecordDbModel]) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO notification_record (\
                notification_id, user_id, bill_id, channel, status, recipient, content, \
                retry_count, scheduled_at, sent_at, error_message, escalated_at, \
                created_at, updated_at) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(&row.notification_id)
                .push_bind(row.user_id)
                .push_bind(row.bill_id)
                .push_bind(&row.channel)
                .push_bind(&row.status)
                .push_bind(&row.recipient)
                .push_bind(&row.content)
                .push_bind(row.retry_count)
                .push_bind(row.scheduled_at)
                .push_bind(row.sent_at)
                .push_bind(&row.error_message)
                .push_bind(row.escalated_at)
                .push_bind(row.created_at)
                .push_bind(row.updated_at);
        });
        qb.push(
            r#"
            ON CONFLICT(bill_id, channel) DO UPDATE SET
                status = excluded.status,
                recipient = excluded.recipient,
                content = excluded.content,
                retry_count = MAX(notification_record.retry_count, excluded.retry_count),
                scheduled_at = excluded.scheduled_at,
                sent_at = excluded.sent_at,
                error_message = excluded.error_message,
                escalated_at = excluded.escalated_at,
                updated_at = excluded.updated_at
            WHERE notification_record.status != 'SENT'
              AND notification_record.escalated_at IS NULL
            "#,
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NotificationRecordRepository for SqlxNotificationRecordRepository {
    async fn upsert_all(&self, records: &[NotificationRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let rows: Vec<NotificationRecordDbModel> = records.iter().map(Into::into).collect();
        let mut affected = 0;
        for chunk in rows.chunks(MAX_BULK_ROWS) {
            affected +=
                retry_on_sqlite_busy("notification_upsert", || self.upsert_chunk(chunk)).await?;
        }
        Ok(affected)
    }

    async fn find(&self, bill_id: i64, channel: Channel) -> Result<Option<NotificationRecord>> {
        sqlx::query_as::<_, NotificationRecordDbModel>(
            "SELECT * FROM notification_record WHERE bill_id = ? AND channel = ?",
        )
        .bind(bill_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(NotificationRecord::try_from)
        .transpose()
    }

    async fn find_failed(&self, limit: u32) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query_as::<_, NotificationRecordDbModel>(
            r#"
            SELECT * FROM notification_record
            WHERE status = ? AND escalated_at IS NULL
            ORDER BY updated_at
            LIMIT ?
            "#,
        )
        .bind(NotificationStatus::Failed.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match NotificationRecord::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable notification record: {}", e),
            }
        }
        Ok(records)
    }

    async fn is_sent(&self, bill_id: i64, channel: Channel) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM notification_record WHERE bill_id = ? AND channel = ? AND status = ?",
        )
        .bind(bill_id)
        .bind(channel.as_str())
        .bind(NotificationStatus::Sent.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn restore_failed(&self, records: &[NotificationRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for record in records {
            let result = sqlx::query(
                r#"
                UPDATE notification_record
                SET status = ?, retry_count = ?, updated_at = ?
                WHERE bill_id = ? AND channel = ? AND status = ?
                "#,
            )
            .bind(NotificationStatus::Failed.as_str())
            .bind(i64::from(record.retry_count))
            .bind(datetime_to_ms(record.updated_at))
            .bind(record.bill_id)
            .bind(record.channel.as_str())
            .bind(NotificationStatus::Retry.as_str())
            .execute(&mut *tx)
            .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn count_by_status(&self) -> Result<Vec<(NotificationStatus, u64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM notification_record GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| {
                status
                    .parse::<NotificationStatus>()
                    .ok()
                    .map(|s| (s, count as u64))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::domain::message::fixtures::message;
    use chrono::Utc;

    async fn repo() -> SqlxNotificationRecordRepository {
        SqlxNotificationRecordRepository::new(init_memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_upsert_updates_same_logical_row() {
        let repo = repo().await;
        let msg = message(1001, Channel::Email);
        let failed = NotificationRecord::failed(&msg, 0, "timeout", Utc::now());
        repo.upsert_all(std::slice::from_ref(&failed)).await.unwrap();

        let retried = failed.retried(3, Utc::now()).unwrap();
        repo.upsert_all(&[retried]).await.unwrap();

        // a fresh attempt carries a new id but lands on the same row
        let sent = NotificationRecord::sent(&msg, 1, Utc::now());
        repo.upsert_all(&[sent]).await.unwrap();

        let stored = repo.find(1001, Channel::Email).await.unwrap().unwrap();
        assert_eq!(stored.notification_id, failed.notification_id);
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert_eq!(stored.retry_count, 1);
        assert!(repo.is_sent(1001, Channel::Email).await.unwrap());
    }

    #[tokio::test]
    async fn test_sent_row_is_never_overwritten() {
        let repo = repo().await;
        let msg = message(5, Channel::Push);
        repo.upsert_all(&[NotificationRecord::sent(&msg, 0, Utc::now())])
            .await
            .unwrap();

        let affected = repo
            .upsert_all(&[NotificationRecord::failed(&msg, 0, "late", Utc::now())])
            .await
            .unwrap();
        assert_eq!(affected, 0);

        let stored = repo.find(5, Channel::Push).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_retry_count_never_decreases() {
        let repo = repo().await;
        let msg = message(6, Channel::Email);
        repo.upsert_all(&[NotificationRecord::failed(&msg, 2, "x", Utc::now())])
            .await
            .unwrap();
        repo.upsert_all(&[NotificationRecord::failed(&msg, 0, "y", Utc::now())])
            .await
            .unwrap();

        let stored = repo.find(6, Channel::Email).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.error_message.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_find_failed_excludes_escalated() {
        let repo = repo().await;
        let a = NotificationRecord::failed(&message(1, Channel::Email), 3, "x", Utc::now());
        let b = NotificationRecord::failed(&message(2, Channel::Email), 1, "x", Utc::now());
        repo.upsert_all(&[a.clone(), b]).await.unwrap();
        assert_eq!(repo.find_failed(10).await.unwrap().len(), 2);

        let escalated = a.escalated(3, Utc::now()).unwrap();
        repo.upsert_all(&[escalated.clone()]).await.unwrap();
        let failed = repo.find_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].bill_id, 2);

        // escalation is sticky
        assert_eq!(repo.upsert_all(&[escalated]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restore_failed_undoes_retry() {
        let repo = repo().await;
        let failed = NotificationRecord::failed(&message(9, Channel::Email), 1, "x", Utc::now());
        let retried = failed.retried(3, Utc::now()).unwrap();
        repo.upsert_all(&[retried]).await.unwrap();
        assert!(repo.find_failed(10).await.unwrap().is_empty());

        assert_eq!(repo.restore_failed(&[failed.clone()]).await.unwrap(), 1);
        let stored = repo.find(9, Channel::Email).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, 1);

        // only RETRY rows are touched
        assert_eq!(repo.restore_failed(&[failed]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_upsert_spans_chunks() {
        let repo = repo().await;
        let now = Utc::now();
        let records: Vec<_> = (0..(MAX_BULK_ROWS as i64 + 20))
            .map(|id| NotificationRecord::sent(&message(id, Channel::Sms), 0, now))
            .collect();
        assert_eq!(repo.upsert_all(&records).await.unwrap(), records.len() as u64);

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts, vec![(NotificationStatus::Sent, records.len() as u64)]);
    }
}
