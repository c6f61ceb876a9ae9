//! Wire payload carried through the broker, the delay queues and retries.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::Channel;

/// A billing notification as produced by the billing batch.
///
/// The serialized form is what travels through the broker and the delay
/// queues, so field order is part of the contract: sorted-set members are
/// compared byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingNotificationMessage {
    pub bill_id: i64,
    pub user_id: i64,
    /// Billing month in `YYYY-MM` form.
    pub billing_year_month: String,
    pub bill_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub recipient_phone: Option<String>,
    pub recipient_name: String,
    pub total_amount: i64,
    pub channel: Channel,
    pub produced_at: DateTime<Utc>,
}

impl BillingNotificationMessage {
    /// Idempotency key for this bill on this channel.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.bill_id, self.channel)
    }

    /// The same bill re-targeted at another channel.
    pub fn with_channel(&self, channel: Channel) -> Self {
        Self {
            channel,
            ..self.clone()
        }
    }

    /// Address the channel handler delivers to.
    pub fn recipient(&self) -> String {
        match self.channel {
            Channel::Email => self.recipient_email.clone().unwrap_or_default(),
            Channel::Sms => self.recipient_phone.clone().unwrap_or_default(),
            Channel::Push => format!("user:{}", self.user_id),
        }
    }

    /// Human readable body used for every channel.
    pub fn render_content(&self) -> String {
        format!(
            "Dear {}, your {} bill of {} is due on {}.",
            self.recipient_name, self.billing_year_month, self.total_amount, self.due_date
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

/// `{billId}:{channel}` key shared by idempotency markers and delay-queue lookups.
pub fn dedup_key(bill_id: i64, channel: Channel) -> String {
    format!("{}:{}", bill_id, channel.as_str())
}


#[cfg(test)]
mod tests {
    use super::fixtures::message;
    use super::*;

    #[test]
    fn test_message_json_shape() {
        let msg = message(1001, Channel::Email);
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"billId\":1001"));
        assert!(json.contains("\"channel\":\"EMAIL\""));
        assert!(json.contains("\"billingYearMonth\":\"2024-02\""));

        let parsed = BillingNotificationMessage::from_json(json.as_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_recipient_per_channel() {
        let msg = message(7, Channel::Email);
        assert_eq!(msg.recipient(), "user42@example.com");
        assert_eq!(msg.with_channel(Channel::Sms).recipient(), "+15550000042");
        assert_eq!(msg.with_channel(Channel::Push).recipient(), "user:42");
    }

    #[test]
    fn test_dedup_key() {
        assert_eq!(message(1001, Channel::Sms).dedup_key(), "1001:SMS");
    }

    #[test]
    fn test_malformed_payload_rejected() {
        assert!(BillingNotificationMessage::from_json(b"{\"billId\":\"oops\"}").is_err());
        assert!(BillingNotificationMessage::from_json(b"not json").is_err());
    }
}
