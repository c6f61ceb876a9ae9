//! Bill database model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{BillingNotificationMessage, Channel};
use crate::{Error, Result};

/// A bill as written by the monthly billing batch.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillDbModel {
    pub bill_id: i64,
    pub user_id: i64,
    pub billing_year_month: String,
    /// ISO date
    pub bill_date: String,
    /// ISO date
    pub due_date: String,
    pub total_amount: i64,
    pub recipient_name: String,
    pub recipient_email: Option<String>,
    pub recipient_phone: Option<String>,
    pub updated_at: i64,
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| Error::Database(format!("invalid {field} '{value}': {e}")))
}

impl BillDbModel {
    /// Build the wire message for this bill on `channel`.
    pub fn to_message(
        &self,
        channel: Channel,
        produced_at: DateTime<Utc>,
    ) -> Result<BillingNotificationMessage> {
        Ok(BillingNotificationMessage {
            bill_id: self.bill_id,
            user_id: self.user_id,
            billing_year_month: self.billing_year_month.clone(),
            bill_date: parse_date("bill_date", &self.bill_date)?,
            due_date: parse_date("due_date", &self.due_date)?,
            recipient_email: self.recipient_email.clone(),
            recipient_phone: self.recipient_phone.clone(),
            recipient_name: self.recipient_name.clone(),
            total_amount: self.total_amount,
            channel,
            produced_at,
        })
    }

    pub fn from_message(message: &BillingNotificationMessage, updated_at: i64) -> Self {
        Self {
            bill_id: message.bill_id,
            user_id: message.user_id,
            billing_year_month: message.billing_year_month.clone(),
            bill_date: message.bill_date.format("%Y-%m-%d").to_string(),
            due_date: message.due_date.format("%Y-%m-%d").to_string(),
            total_amount: message.total_amount,
            recipient_name: message.recipient_name.clone(),
            recipient_email: message.recipient_email.clone(),
            recipient_phone: message.recipient_phone.clone(),
            updated_at,
        }
    }
}
