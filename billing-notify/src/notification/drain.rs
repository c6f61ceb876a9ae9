//! Delay-queue drain jobs.
//!
//! Moves due entries from a delay queue back onto the main topic. An entry is
//! removed only after its publish was acknowledged.
//!
//! Queue entries carry only the wire message. The delivery attempt is taken
//! from the parked record, so a retry deferred by quiet time is released as
//! the same attempt it was parked as.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::codec::MessageCodec;
use super::delay_queue::{DelayQueue, QueueKind};
use crate::Result;
use crate::broker::{BrokerMessage, DeliveryOrigin, SharedBroker};
use crate::database::repositories::NotificationRecordRepository;
use crate::domain::BillingNotificationMessage;
use crate::scheduler::PeriodicJob;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub ready: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct DrainJob {
    queue: DelayQueue,
    broker: SharedBroker,
    codec: MessageCodec,
    records: Arc<dyn NotificationRecordRepository>,
    topic: String,
    batch_size: usize,
}

impl DrainJob {
    pub fn new(
        queue: DelayQueue,
        broker: SharedBroker,
        codec: MessageCodec,
        records: Arc<dyn NotificationRecordRepository>,
        topic: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            broker,
            codec,
            records,
            topic: topic.into(),
            batch_size: batch_size.max(1),
        }
    }

    fn origin(&self) -> DeliveryOrigin {
        match self.queue.kind() {
            QueueKind::Deferred => DeliveryOrigin::Deferred,
            QueueKind::Scheduled => DeliveryOrigin::Scheduled,
        }
    }

    /// Attempt number the parked record was waiting to make.
    async fn delivery_attempt(&self, message: &BillingNotificationMessage) -> u32 {
        match self.records.find(message.bill_id, message.channel).await {
            Ok(Some(record)) => record.next_delivery_attempt(),
            Ok(None) => 1,
            Err(e) => {
                warn!(
                    bill_id = message.bill_id,
                    channel = %message.channel,
                    "Cannot read parked record, releasing as first attempt: {}",
                    e
                );
                1
            }
        }
    }

    pub async fn drain_once(&self) -> Result<DrainReport> {
        let ready = self.queue.drain_ready(None, self.batch_size).await?;
        let mut report = DrainReport {
            ready: ready.len(),
            ..Default::default()
        };

        for entry in &ready {
            let message = &entry.message;
            let published = match self.codec.seal(message) {
                Ok(payload) => {
                    let attempt = self.delivery_attempt(message).await;
                    let broker_message = BrokerMessage::new(message.bill_id.to_string(), payload)
                        .with_attempt(attempt)
                        .with_origin(self.origin());
                    self.broker.publish(&self.topic, broker_message).await
                }
                Err(e) => Err(e),
            };

            match published {
                Ok(()) => {
                    report.published += 1;
                    if let Err(e) = self.queue.remove(entry).await {
                        // Left in place it is re-published next cycle and
                        // dropped by the sent marker downstream.
                        warn!(bill_id = message.bill_id, queue = %self.queue.kind(), "Failed to remove drained entry: {}", e);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        bill_id = message.bill_id,
                        channel = %message.channel,
                        queue = %self.queue.kind(),
                        "Re-publish failed, entry kept: {}",
                        e
                    );
                }
            }
        }

        if report.ready > 0 {
            info!(
                queue = %self.queue.kind(),
                ready = report.ready,
                published = report.published,
                failed = report.failed,
                "Delay queue drained"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for DrainJob {
    fn name(&self) -> &'static str {
        match self.queue.kind() {
            QueueKind::Deferred => "drain-deferred",
            QueueKind::Scheduled => "drain-scheduled",
        }
    }

    async fn run_once(&self) -> Result<usize> {
        Ok(self.drain_once().await?.published)
    }
}
