//! Fallback delivery for escalated notifications.
//!
//! Consumes the dead-letter topic and re-sends each bill over SMS. SMS never
//! raises, so this path does not feed the retry job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::channels::ChannelHandlers;
use super::codec::MessageCodec;
use super::consumer::BatchProcessor;
use super::idempotency::{IdempotencyGuard, Marker};
use crate::Result;
use crate::broker::BrokerRecord;
use crate::clock::SharedClock;
use crate::database::repositories::NotificationRecordRepository;
use crate::domain::{Channel, NotificationRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackReport {
    pub received: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct DeadLetterProcessor {
    codec: MessageCodec,
    idempotency: Arc<IdempotencyGuard>,
    handlers: Arc<ChannelHandlers>,
    records: Arc<dyn NotificationRecordRepository>,
    clock: SharedClock,
    fallback: Channel,
}

impl DeadLetterProcessor {
    pub fn new(
        codec: MessageCodec,
        idempotency: Arc<IdempotencyGuard>,
        handlers: Arc<ChannelHandlers>,
        records: Arc<dyn NotificationRecordRepository>,
        clock: SharedClock,
    ) -> Self {
        Self {
            codec,
            idempotency,
            handlers,
            records,
            clock,
            fallback: Channel::Sms,
        }
    }

    async fn deliver(&self, record: &BrokerRecord, report: &mut FallbackReport) -> Option<NotificationRecord> {
        let original = match self.codec.open(&record.message.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(key = %record.message.key, "Dropping malformed dead letter: {}", e);
                report.skipped += 1;
                return None;
            }
        };
        let message = original.with_channel(self.fallback);
        let bill_id = message.bill_id;

        if self.idempotency.marker(bill_id, self.fallback).await == Some(Marker::Sent) {
            info!(bill_id, "Fallback already delivered");
            report.skipped += 1;
            return None;
        }

        let trace_id = uuid::Uuid::new_v4().to_string();
        let handler = self.handlers.for_channel(self.fallback);
        match handler.handle(&message, &trace_id, 1).await {
            Ok(()) => {
                if let Err(e) = self.idempotency.mark_sent(bill_id, self.fallback).await {
                    warn!(bill_id, %trace_id, "Failed to write fallback sent marker: {}", e);
                }
                info!(
                    bill_id,
                    from = %original.channel,
                    to = %self.fallback,
                    %trace_id,
                    "Escalated notification delivered on fallback channel"
                );
                report.sent += 1;
                Some(NotificationRecord::sent(&message, 0, self.clock.now()))
            }
            Err(e) => {
                warn!(bill_id, %trace_id, "Fallback delivery failed: {}", e);
                report.failed += 1;
                Some(NotificationRecord::failed(&message, 0, e.to_string(), self.clock.now()))
            }
        }
    }
}

#[async_trait]
impl BatchProcessor for DeadLetterProcessor {
    type Report = FallbackReport;

    fn name(&self) -> &'static str {
        "dead-letter"
    }

    async fn process(&self, batch: &[BrokerRecord]) -> Result<FallbackReport> {
        let mut report = FallbackReport {
            received: batch.len(),
            ..Default::default()
        };
        let mut records = Vec::with_capacity(batch.len());
        for record in batch {
            if let Some(outcome) = self.deliver(record, &mut report).await {
                records.push(outcome);
            }
        }
        self.records.upsert_all(&records).await?;
        Ok(report)
    }
}
