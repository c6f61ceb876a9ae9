//! Outbox event database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::domain::{BillingNotificationMessage, Channel};

/// Event type written by the billing batch for every bill/channel pair.
pub const BILLING_NOTIFICATION_EVENT: &str = "BILLING_NOTIFICATION";

/// A row of the transactional outbox.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OutboxEventDbModel {
    pub event_id: String,
    pub bill_id: i64,
    pub user_id: i64,
    pub event_type: String,
    pub channel: String,
    /// Serialized `BillingNotificationMessage`.
    pub payload: String,
    /// READY, PUBLISHED
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OutboxEventDbModel {
    /// Build a READY row for a message.
    pub fn ready(message: &BillingNotificationMessage) -> serde_json::Result<Self> {
        let now = now_ms();
        Ok(Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            bill_id: message.bill_id,
            user_id: message.user_id,
            event_type: BILLING_NOTIFICATION_EVENT.to_string(),
            channel: message.channel.as_str().to_string(),
            payload: message.to_json()?,
            status: OutboxStatus::Ready.as_str().to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_status(&self) -> Option<OutboxStatus> {
        OutboxStatus::parse(&self.status)
    }

    pub fn get_channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }
}

/// Outbox row status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Ready,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Published => "PUBLISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(Self::Ready),
            "PUBLISHED" => Some(Self::Published),
            _ => None,
        }
    }
}

/// Row counts per outbox status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStatusCounts {
    pub ready: u64,
    pub published: u64,
}
