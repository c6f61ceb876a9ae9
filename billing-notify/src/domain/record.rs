//! Notification delivery records and their state machine.
//!
//! Transitions are pure: each returns a new record and leaves the input
//! untouched, so the retry job can compute a whole batch of mutations before
//! writing any of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BillingNotificationMessage, Channel};
use crate::{Error, Result};

/// Maximum retries before a failed record is escalated to the fallback channel.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivery status of a notification record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    /// Parked in the deferred queue until quiet time ends.
    Pending,
    /// Parked in the scheduled queue until the user's preferred time.
    Scheduled,
    Sent,
    Failed,
    /// Re-published by the retry job, awaiting the next attempt.
    Retry,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Retry => "RETRY",
        }
    }
}

/// One logical delivery of a bill on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub notification_id: String,
    pub user_id: i64,
    pub bill_id: i64,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub recipient: String,
    pub content: String,
    pub retry_count: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    fn base(
        message: &BillingNotificationMessage,
        status: NotificationStatus,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: uuid::Uuid::new_v4().to_string(),
            user_id: message.user_id,
            bill_id: message.bill_id,
            channel: message.channel,
            status,
            recipient: message.recipient(),
            content: message.render_content(),
            retry_count,
            scheduled_at: None,
            sent_at: None,
            error_message: None,
            escalated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deferred by quiet time, releasing at `release_at`.
    pub fn pending(
        message: &BillingNotificationMessage,
        retry_count: u32,
        release_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scheduled_at: Some(release_at),
            ..Self::base(message, NotificationStatus::Pending, retry_count, now)
        }
    }

    /// Parked until the user's preferred delivery time.
    pub fn scheduled(
        message: &BillingNotificationMessage,
        retry_count: u32,
        release_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scheduled_at: Some(release_at),
            ..Self::base(message, NotificationStatus::Scheduled, retry_count, now)
        }
    }

    pub fn sent(message: &BillingNotificationMessage, retry_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            sent_at: Some(now),
            ..Self::base(message, NotificationStatus::Sent, retry_count, now)
        }
    }

    pub fn failed(
        message: &BillingNotificationMessage,
        retry_count: u32,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::base(message, NotificationStatus::Failed, retry_count, now)
        }
    }

    /// Whether this failure used up the retry budget.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == NotificationStatus::Failed && self.retry_count >= max_retries
    }

    /// Terminal records are never overwritten by later attempts.
    pub fn is_terminal(&self) -> bool {
        self.status == NotificationStatus::Sent || self.escalated_at.is_some()
    }

    /// FAILED (retry_count < max) -> RETRY (retry_count + 1).
    pub fn retried(&self, max_retries: u32, now: DateTime<Utc>) -> Result<Self> {
        if self.status != NotificationStatus::Failed || self.escalated_at.is_some() {
            return Err(Error::invalid_transition(self.status, NotificationStatus::Retry));
        }
        if self.retry_count >= max_retries {
            return Err(Error::invalid_transition(
                format!("{} (retry {}/{})", self.status, self.retry_count, max_retries),
                NotificationStatus::Retry,
            ));
        }
        Ok(Self {
            status: NotificationStatus::Retry,
            retry_count: self.retry_count + 1,
            updated_at: now,
            ..self.clone()
        })
    }

    /// FAILED (retry_count >= max) -> terminal FAILED, escalated once.
    pub fn escalated(&self, max_retries: u32, now: DateTime<Utc>) -> Result<Self> {
        if !self.is_exhausted(max_retries) || self.escalated_at.is_some() {
            return Err(Error::invalid_transition(
                format!("{} (retry {}/{})", self.status, self.retry_count, max_retries),
                "ESCALATED",
            ));
        }
        Ok(Self {
            escalated_at: Some(now),
            updated_at: now,
            ..self.clone()
        })
    }

    /// Delivery attempt number of the next retry of this record.
    pub fn next_delivery_attempt(&self) -> u32 {
        self.retry_count + 1
    }
}
