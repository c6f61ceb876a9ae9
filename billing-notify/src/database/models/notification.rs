//! Notification record database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms};
use crate::domain::{Channel, NotificationRecord, NotificationStatus};
use crate::{Error, Result};

/// Notification record database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationRecordDbModel {
    pub notification_id: String,
    pub user_id: i64,
    pub bill_id: i64,
    pub channel: String,
    /// PENDING, SCHEDULED, SENT, FAILED, RETRY
    pub status: String,
    pub recipient: String,
    pub content: String,
    pub retry_count: i64,
    pub scheduled_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub error_message: Option<String>,
    pub escalated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&NotificationRecord> for NotificationRecordDbModel {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            notification_id: record.notification_id.clone(),
            user_id: record.user_id,
            bill_id: record.bill_id,
            channel: record.channel.as_str().to_string(),
            status: record.status.as_str().to_string(),
            recipient: record.recipient.clone(),
            content: record.content.clone(),
            retry_count: i64::from(record.retry_count),
            scheduled_at: opt_datetime_to_ms(record.scheduled_at),
            sent_at: opt_datetime_to_ms(record.sent_at),
            error_message: record.error_message.clone(),
            escalated_at: opt_datetime_to_ms(record.escalated_at),
            created_at: datetime_to_ms(record.created_at),
            updated_at: datetime_to_ms(record.updated_at),
        }
    }
}

impl TryFrom<NotificationRecordDbModel> for NotificationRecord {
    type Error = Error;

    fn try_from(row: NotificationRecordDbModel) -> Result<Self> {
        let channel = Channel::parse(&row.channel)
            .ok_or_else(|| Error::Database(format!("unknown channel '{}'", row.channel)))?;
        let status: NotificationStatus = row
            .status
            .parse()
            .map_err(|_| Error::Database(format!("unknown status '{}'", row.status)))?;

        Ok(Self {
            notification_id: row.notification_id,
            user_id: row.user_id,
            bill_id: row.bill_id,
            channel,
            status,
            recipient: row.recipient,
            content: row.content,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            scheduled_at: row.scheduled_at.map(ms_to_datetime),
            sent_at: row.sent_at.map(ms_to_datetime),
            error_message: row.error_message,
            escalated_at: row.escalated_at.map(ms_to_datetime),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        })
    }
}
