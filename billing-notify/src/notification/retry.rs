//! Retry and dead-letter escalation.
//!
//! Each cycle loads FAILED records that have not been escalated and splits
//! them in two:
//!
//! - below the retry budget: FAILED -> RETRY, written in one bulk upsert,
//!   then processing markers in one pipelined write, then one publish per
//!   record with the next delivery attempt. Records whose publish fails are
//!   restored to FAILED so the attempt is not consumed.
//! - at the budget: published once to the dead-letter topic, then stamped as
//!   escalated in one bulk upsert so they are never selected again.
//!
//! Records do not keep the full wire payload. Messages are rebuilt from the
//! current bill row.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::codec::MessageCodec;
use super::idempotency::IdempotencyGuard;
use crate::Result;
use crate::broker::{BrokerMessage, DeliveryOrigin, SharedBroker, Topics};
use crate::clock::{Clock, SharedClock};
use crate::database::models::BillDbModel;
use crate::database::repositories::{BillRepository, NotificationRecordRepository};
use crate::domain::{BillingNotificationMessage, NotificationRecord};
use crate::scheduler::PeriodicJob;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub batch_size: u32,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: crate::domain::DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub selected: usize,
    pub retried: usize,
    pub escalated: usize,
    pub publish_failures: usize,
    /// Records whose bill row no longer exists.
    pub orphaned: usize,
}

pub struct RetryJob {
    records: Arc<dyn NotificationRecordRepository>,
    bills: Arc<dyn BillRepository>,
    broker: SharedBroker,
    codec: MessageCodec,
    idempotency: Arc<IdempotencyGuard>,
    topics: Topics,
    clock: SharedClock,
    config: RetryConfig,
}

impl RetryJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        records: Arc<dyn NotificationRecordRepository>,
        bills: Arc<dyn BillRepository>,
        broker: SharedBroker,
        codec: MessageCodec,
        idempotency: Arc<IdempotencyGuard>,
        topics: Topics,
        clock: SharedClock,
        config: RetryConfig,
    ) -> Self {
        Self {
            records,
            bills,
            broker,
            codec,
            idempotency,
            topics,
            clock,
            config,
        }
    }

    pub async fn retry_once(&self) -> Result<RetryReport> {
        let failed = self.records.find_failed(self.config.batch_size).await?;
        let mut report = RetryReport {
            selected: failed.len(),
            ..Default::default()
        };
        if failed.is_empty() {
            return Ok(report);
        }

        let now = self.clock.now();
        let max = self.config.max_retries;
        let mut bill_ids: Vec<i64> = failed.iter().map(|r| r.bill_id).collect();
        bill_ids.sort_unstable();
        bill_ids.dedup();
        let bills = self.bills.find_many(&bill_ids).await?;

        let mut retries = Vec::new();
        let mut escalations = Vec::new();
        for record in failed {
            let Some(message) = self.rebuild(&record, &bills, now, &mut report) else {
                continue;
            };
            if record.is_exhausted(max) {
                escalations.push((record, message));
            } else {
                retries.push((record, message));
            }
        }

        self.retry(retries, now, &mut report).await?;
        self.escalate(escalations, now, &mut report).await?;

        info!(
            selected = report.selected,
            retried = report.retried,
            escalated = report.escalated,
            publish_failures = report.publish_failures,
            orphaned = report.orphaned,
            "Retry cycle completed"
        );
        Ok(report)
    }

    fn rebuild(
        &self,
        record: &NotificationRecord,
        bills: &HashMap<i64, BillDbModel>,
        now: DateTime<Utc>,
        report: &mut RetryReport,
    ) -> Option<BillingNotificationMessage> {
        let Some(bill) = bills.get(&record.bill_id) else {
            warn!(bill_id = record.bill_id, channel = %record.channel, "Bill missing, cannot retry");
            report.orphaned += 1;
            return None;
        };
        match bill.to_message(record.channel, now) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(bill_id = record.bill_id, "Cannot rebuild message from bill: {}", e);
                report.orphaned += 1;
                None
            }
        }
    }

    async fn retry(
        &self,
        batch: Vec<(NotificationRecord, BillingNotificationMessage)>,
        now: DateTime<Utc>,
        report: &mut RetryReport,
    ) -> Result<()> {
        let mut pending = Vec::with_capacity(batch.len());
        for (record, message) in batch {
            match record.retried(self.config.max_retries, now) {
                Ok(next) => pending.push((record, next, message)),
                Err(e) => warn!(bill_id = record.bill_id, "Skipping retry: {}", e),
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let transitions: Vec<NotificationRecord> =
            pending.iter().map(|(_, next, _)| next.clone()).collect();
        self.records.upsert_all(&transitions).await?;

        let targets: Vec<(i64, _)> = transitions.iter().map(|r| (r.bill_id, r.channel)).collect();
        if let Err(e) = self.idempotency.mark_processing_many(&targets).await {
            warn!(count = targets.len(), "Failed to write retry processing markers: {}", e);
        }

        let mut unpublished = Vec::new();
        for (previous, next, message) in pending {
            let attempt = next.next_delivery_attempt();
            match self.publish(&self.topics.main, &message, attempt, DeliveryOrigin::Retry).await {
                Ok(()) => report.retried += 1,
                Err(e) => {
                    warn!(bill_id = next.bill_id, channel = %next.channel, "Retry publish failed: {}", e);
                    report.publish_failures += 1;
                    unpublished.push(previous);
                }
            }
        }

        if !unpublished.is_empty() {
            if let Err(e) = self.records.restore_failed(&unpublished).await {
                error!(count = unpublished.len(), "Failed to restore unpublished retries: {}", e);
            }
        }
        Ok(())
    }

    async fn escalate(
        &self,
        batch: Vec<(NotificationRecord, BillingNotificationMessage)>,
        now: DateTime<Utc>,
        report: &mut RetryReport,
    ) -> Result<()> {
        let mut escalated = Vec::with_capacity(batch.len());
        for (record, message) in batch {
            let next = match record.escalated(self.config.max_retries, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(bill_id = record.bill_id, "Skipping escalation: {}", e);
                    continue;
                }
            };
            let attempt = record.next_delivery_attempt();
            match self
                .publish(&self.topics.dead_letter, &message, attempt, DeliveryOrigin::DeadLetter)
                .await
            {
                Ok(()) => {
                    warn!(
                        bill_id = record.bill_id,
                        channel = %record.channel,
                        retries = record.retry_count,
                        "Retries exhausted, escalated to dead letter"
                    );
                    escalated.push(next);
                }
                Err(e) => {
                    warn!(bill_id = record.bill_id, "Dead-letter publish failed: {}", e);
                    report.publish_failures += 1;
                }
            }
        }

        report.escalated = escalated.len();
        self.records.upsert_all(&escalated).await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        message: &BillingNotificationMessage,
        attempt: u32,
        origin: DeliveryOrigin,
    ) -> Result<()> {
        let payload = self.codec.seal(message)?;
        let broker_message = BrokerMessage::new(message.bill_id.to_string(), payload)
            .with_attempt(attempt)
            .with_origin(origin);
        self.broker.publish(topic, broker_message).await
    }
}

#[async_trait]
impl PeriodicJob for RetryJob {
    fn name(&self) -> &'static str {
        "retry-escalation"
    }

    async fn run_once(&self) -> Result<usize> {
        let report = self.retry_once().await?;
        Ok(report.retried + report.escalated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::fixtures::message;
    use crate::domain::{Channel, NotificationStatus};
    use crate::notification::idempotency::Marker;
    use crate::notification::testing::{Harness, harness};

    fn job(h: &Harness) -> RetryJob {
        RetryJob::new(
            h.records.clone(),
            h.bills.clone(),
            Arc::new(h.broker.clone()),
            h.codec.clone(),
            h.idempotency.clone(),
            h.topics.clone(),
            Arc::new(h.clock.clone()),
            RetryConfig::default(),
        )
    }

    async fn seed_failed(h: &Harness, bill_id: i64, retry_count: u32) -> BillingNotificationMessage {
        let msg = message(bill_id, Channel::Email);
        h.bills
            .upsert(&BillDbModel::from_message(&msg, 0))
            .await
            .unwrap();
        h.records
            .upsert_all(&[NotificationRecord::failed(&msg, retry_count, "timeout", h.clock.now())])
            .await
            .unwrap();
        msg
    }

    #[tokio::test]
    async fn test_failed_record_is_republished_as_retry() {
        let h = harness(0.0).await;
        seed_failed(&h, 1, 0).await;

        let report = job(&h).retry_once().await.unwrap();
        assert_eq!(report.retried, 1);

        let stored = h.records.find(1, Channel::Email).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Retry);
        assert_eq!(stored.retry_count, 1);

        let published = h.broker.messages(&h.topics.main);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].delivery_attempt, 2);
        assert_eq!(published[0].origin, DeliveryOrigin::Retry);
        assert_eq!(h.idempotency.marker(1, Channel::Email).await, Some(Marker::Processing));

        // RETRY rows are not selected again
        assert_eq!(job(&h).retry_once().await.unwrap().selected, 0);
    }

    #[tokio::test]
    async fn test_exhausted_record_escalates_once() {
        let h = harness(0.0).await;
        let msg = seed_failed(&h, 2, 3).await;

        let report = job(&h).retry_once().await.unwrap();
        assert_eq!((report.retried, report.escalated), (0, 1));

        let dead = h.broker.messages(&h.topics.dead_letter);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].origin, DeliveryOrigin::DeadLetter);
        assert_eq!(h.codec.open(&dead[0].payload).unwrap().bill_id, msg.bill_id);
        assert!(h.broker.messages(&h.topics.main).is_empty());

        let stored = h.records.find(2, Channel::Email).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.escalated_at.is_some());

        let again = job(&h).retry_once().await.unwrap();
        assert_eq!(again.selected, 0);
        assert_eq!(h.broker.messages(&h.topics.dead_letter).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_retry_budget() {
        let h = harness(0.0).await;
        seed_failed(&h, 3, 1).await;
        h.broker.set_unavailable(true);

        let report = job(&h).retry_once().await.unwrap();
        assert_eq!((report.retried, report.publish_failures), (0, 1));

        let stored = h.records.find(3, Channel::Email).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_outage_does_not_mark_escalated() {
        let h = harness(0.0).await;
        seed_failed(&h, 4, 3).await;
        h.broker.set_unavailable(true);

        let report = job(&h).retry_once().await.unwrap();
        assert_eq!(report.escalated, 0);
        let stored = h.records.find(4, Channel::Email).await.unwrap().unwrap();
        assert!(stored.escalated_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_bill_is_skipped() {
        let h = harness(0.0).await;
        let msg = message(99, Channel::Push);
        h.records
            .upsert_all(&[NotificationRecord::failed(&msg, 0, "x", h.clock.now())])
            .await
            .unwrap();

        let report = job(&h).retry_once().await.unwrap();
        assert_eq!((report.selected, report.orphaned, report.retried), (1, 1, 0));
        assert!(h.broker.messages(&h.topics.main).is_empty());
    }
}
