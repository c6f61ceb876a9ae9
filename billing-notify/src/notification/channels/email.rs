//! Email handler.
//!
//! Models a flaky transport: a fixed latency plus a failure probability that
//! is low on the first attempt and much higher on retries. When a relay URL
//! is configured the message is also POSTed to it.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{DeliveryError, HandlerStats};
use crate::domain::{BillingNotificationMessage, Channel};
use crate::Result;
use crate::utils::http_client::build_client;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Artificial latency per send.
    pub latency: Duration,
    /// Failure probability when `delivery_attempt == 1`.
    pub first_attempt_failure_rate: f64,
    /// Failure probability on every later attempt.
    pub retry_failure_rate: f64,
    /// Optional HTTP relay for real delivery.
    pub relay_url: Option<String>,
    pub from_address: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(200),
            first_attempt_failure_rate: 0.05,
            retry_failure_rate: 0.5,
            relay_url: None,
            from_address: "billing@localhost".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailHandler {
    config: EmailConfig,
    client: Client,
    pub(super) stats: HandlerStats,
}

impl EmailHandler {
    pub fn new(config: EmailConfig) -> Result<Self> {
        let client = build_client(Duration::from_secs(config.timeout_secs.max(1)))?;
        Ok(Self {
            config,
            client,
            stats: HandlerStats::default(),
        })
    }

    fn failure_rate(&self, delivery_attempt: u32) -> f64 {
        if delivery_attempt <= 1 {
            self.config.first_attempt_failure_rate
        } else {
            self.config.retry_failure_rate
        }
    }

    fn subject(message: &BillingNotificationMessage) -> String {
        format!("Your {} bill is ready", message.billing_year_month)
    }

    pub(super) async fn send(
        &self,
        message: &BillingNotificationMessage,
        trace_id: &str,
        delivery_attempt: u32,
    ) -> std::result::Result<(), DeliveryError> {
        let to = message.recipient_email.as_deref().unwrap_or_default();
        if to.is_empty() {
            return Err(DeliveryError::MissingRecipient(Channel::Email));
        }

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        let rate = self.failure_rate(delivery_attempt);
        if rand::random::<f64>() < rate {
            warn!(
                bill_id = message.bill_id,
                trace_id = %trace_id,
                attempt = delivery_attempt,
                "Email transport failed"
            );
            return Err(DeliveryError::Transport {
                channel: Channel::Email,
                attempt: delivery_attempt,
                reason: "simulated SMTP timeout".to_string(),
            });
        }

        if let Some(url) = &self.config.relay_url {
            self.relay(url, message, to, trace_id, delivery_attempt)
                .await?;
        }

        debug!(
            bill_id = message.bill_id,
            trace_id = %trace_id,
            attempt = delivery_attempt,
            "Email sent to {}",
            to
        );
        Ok(())
    }

    async fn relay(
        &self,
        url: &str,
        message: &BillingNotificationMessage,
        to: &str,
        trace_id: &str,
        delivery_attempt: u32,
    ) -> std::result::Result<(), DeliveryError> {
        let payload = json!({
            "from": self.config.from_address,
            "to": to,
            "subject": Self::subject(message),
            "body": message.render_content(),
            "traceId": trace_id,
            "billId": message.bill_id,
        });

        let response = self
            .client
            .post(url)
            .header("X-Trace-Id", trace_id)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                channel: Channel::Email,
                attempt: delivery_attempt,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            warn!(bill_id = message.bill_id, status, "Email relay rejected message");
            return Err(DeliveryError::Rejected {
                channel: Channel::Email,
                status,
            });
        }
        Ok(())
    }
}
