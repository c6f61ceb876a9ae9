//! SMS handler.
//!
//! SMS is the escalation target for exhausted channels, so it must not become
//! a retry source itself: delivery is logged and always succeeds.

use tracing::{info, warn};

use super::{DeliveryError, HandlerStats};
use crate::domain::BillingNotificationMessage;

#[derive(Debug, Clone, Default)]
pub struct SmsHandler {
    pub(super) stats: HandlerStats,
}

impl SmsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) async fn send(
        &self,
        message: &BillingNotificationMessage,
        trace_id: &str,
        delivery_attempt: u32,
    ) -> Result<(), DeliveryError> {
        let phone = message.recipient_phone.as_deref().unwrap_or_default();
        if phone.is_empty() {
            warn!(
                bill_id = message.bill_id,
                trace_id = %trace_id,
                "SMS has no phone number on file; recorded as delivered"
            );
        }

        info!(
            bill_id = message.bill_id,
            user_id = message.user_id,
            trace_id = %trace_id,
            attempt = delivery_attempt,
            "SMS sent to {}: {}",
            mask(phone),
            message.render_content()
        );
        Ok(())
    }
}

fn mask(phone: &str) -> String {
    let visible = phone.len().saturating_sub(4);
    phone
        .char_indices()
        .map(|(i, c)| if i < visible { '*' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_keeps_last_digits() {
        assert_eq!(mask("+15550000042"), "********0042");
        assert_eq!(mask("12"), "12");
    }
}
