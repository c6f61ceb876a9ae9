//! Outbox relay.
//!
//! Publishes READY outbox rows and flips them to PUBLISHED in one bulk
//! update. A row is never marked without a broker acknowledgement; if any
//! publish in the batch fails, nothing in the batch is marked and the same
//! rows are picked up again on the next cycle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::codec::MessageCodec;
use crate::Result;
use crate::broker::{BrokerMessage, DeliveryOrigin, SharedBroker};
use crate::database::repositories::OutboxRepository;
use crate::scheduler::PeriodicJob;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// Rows flipped to PUBLISHED.
    pub marked: u64,
}

pub struct OutboxRelay {
    outbox: Arc<dyn OutboxRepository>,
    broker: SharedBroker,
    codec: MessageCodec,
    topic: String,
    batch_size: u32,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        broker: SharedBroker,
        codec: MessageCodec,
        topic: impl Into<String>,
        batch_size: u32,
    ) -> Self {
        Self {
            outbox,
            broker,
            codec,
            topic: topic.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn relay_once(&self) -> Result<RelayReport> {
        let rows = self.outbox.fetch_ready(self.batch_size).await?;
        let mut report = RelayReport {
            fetched: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }

        let mut published = Vec::with_capacity(rows.len());
        for row in &rows {
            let sealed = match self.codec.seal_raw(row.payload.as_bytes()) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(event_id = %row.event_id, "Failed to seal outbox payload: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            let message = BrokerMessage::new(row.event_id.clone(), sealed)
                .with_attempt(1)
                .with_origin(DeliveryOrigin::Outbox);
            match self.broker.publish(&self.topic, message).await {
                Ok(()) => published.push(row.event_id.clone()),
                Err(e) => {
                    warn!(event_id = %row.event_id, bill_id = row.bill_id, "Outbox publish failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        report.published = published.len();

        if report.failed > 0 {
            warn!(
                fetched = report.fetched,
                failed = report.failed,
                "Outbox batch incomplete, leaving rows READY for the next cycle"
            );
            return Ok(report);
        }

        report.marked = self.outbox.mark_published(&published).await?;
        info!(published = report.published, marked = report.marked, "Outbox batch relayed");
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for OutboxRelay {
    fn name(&self) -> &'static str {
        "outbox-relay"
    }

    async fn run_once(&self) -> Result<usize> {
        Ok(self.relay_once().await?.published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{OutboxEventDbModel, OutboxStatus};
    use crate::domain::Channel;
    use crate::domain::message::fixtures::message;
    use crate::notification::testing::{MAIN_TOPIC, harness};

    #[tokio::test]
    async fn test_withheld_ack_leaves_batch_ready() {
        let h = harness(0.0).await;
        let mut event_ids = Vec::new();
        for bill_id in 1..=3 {
            let row = OutboxEventDbModel::ready(&message(bill_id, Channel::Email)).unwrap();
            event_ids.push(row.event_id.clone());
            h.outbox.upsert(&row).await.unwrap();
        }
        let relay = OutboxRelay::new(
            h.outbox.clone(),
            Arc::new(h.broker.clone()),
            h.codec.clone(),
            MAIN_TOPIC,
            10,
        );

        h.broker.fail_key(event_ids[1].clone());
        let report = relay.relay_once().await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.marked, 0);
        assert_eq!(h.outbox.status_counts().await.unwrap().ready, 3);

        h.broker.clear_failures();
        let report = relay.relay_once().await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.marked, 3);

        let counts = h.outbox.status_counts().await.unwrap();
        assert_eq!((counts.ready, counts.published), (0, 3));
        // the two acknowledged rows went out twice: at-least-once
        assert_eq!(h.broker.messages(MAIN_TOPIC).len(), 5);
        assert_eq!(relay.relay_once().await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn test_broker_down_skips_cycle() {
        let h = harness(0.0).await;
        let row = OutboxEventDbModel::ready(&message(1, Channel::Sms)).unwrap();
        h.outbox.upsert(&row).await.unwrap();
        let relay = OutboxRelay::new(
            h.outbox.clone(),
            Arc::new(h.broker.clone()),
            h.codec.clone(),
            MAIN_TOPIC,
            10,
        );

        h.broker.set_unavailable(true);
        assert_eq!(relay.run_once().await.unwrap(), 0);
        let stored = h.outbox.find(1, Channel::Sms).await.unwrap().unwrap();
        assert_eq!(stored.get_status(), Some(OutboxStatus::Ready));
    }

    #[tokio::test]
    async fn test_relayed_message_opens_as_outbox_delivery() {
        let h = harness(0.0).await;
        let msg = message(11, Channel::Push);
        let row = OutboxEventDbModel::ready(&msg).unwrap();
        h.outbox.upsert(&row).await.unwrap();
        let relay = OutboxRelay::new(
            h.outbox.clone(),
            Arc::new(h.broker.clone()),
            h.codec.clone(),
            MAIN_TOPIC,
            10,
        );
        relay.relay_once().await.unwrap();

        let published = h.broker.messages(MAIN_TOPIC);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, row.event_id);
        assert_eq!(published[0].origin, DeliveryOrigin::Outbox);
        assert_eq!(published[0].delivery_attempt, 1);
        assert_eq!(h.codec.open(&published[0].payload).unwrap(), msg);
    }
}
