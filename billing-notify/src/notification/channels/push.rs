//! Push handler.

use tracing::info;

use super::{DeliveryError, HandlerStats};
use crate::domain::BillingNotificationMessage;

#[derive(Debug, Clone, Default)]
pub struct PushHandler {
    pub(super) stats: HandlerStats,
}

impl PushHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) async fn send(
        &self,
        message: &BillingNotificationMessage,
        trace_id: &str,
        delivery_attempt: u32,
    ) -> Result<(), DeliveryError> {
        info!(
            bill_id = message.bill_id,
            user_id = message.user_id,
            trace_id = %trace_id,
            attempt = delivery_attempt,
            "Push notification sent: {}",
            message.render_content()
        );
        Ok(())
    }
}
