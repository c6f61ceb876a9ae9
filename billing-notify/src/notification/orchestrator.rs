//! Per-batch dispatch.
//!
//! Every record of a polled batch runs through the same decision chain on a
//! bounded worker pool: open, dedupe, preferred-schedule, quiet time, then the
//! channel handler. Outcomes are collected and written with a single bulk
//! upsert once the whole batch is done; the caller acknowledges the batch only
//! after that write succeeds.
//!
//! A SENT marker whose row never made it to the store is not dispatched again;
//! the missing row is rebuilt from the marker and written with the batch.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::channels::ChannelHandlers;
use super::codec::MessageCodec;
use super::delay_queue::DelayQueue;
use super::idempotency::{IdempotencyGuard, Marker};
use super::resolver::PreferenceResolver;
use crate::Result;
use crate::broker::{BrokerRecord, DeliveryOrigin};
use crate::clock::SharedClock;
use crate::database::repositories::NotificationRecordRepository;
use crate::domain::{BillingNotificationMessage, NotificationRecord};

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent(NotificationRecord),
    Failed(NotificationRecord),
    /// Parked in the deferred queue (quiet time).
    Deferred(NotificationRecord),
    /// Parked in the scheduled queue (preferred time).
    Scheduled(NotificationRecord),
    /// SENT marker present but no SENT row: the row is written from the
    /// marker without dispatching again.
    Recovered(NotificationRecord),
    /// Already delivered or already in flight.
    Duplicate,
    /// Unreadable payload.
    Malformed,
}

impl DispatchOutcome {
    fn record(self) -> Option<NotificationRecord> {
        match self {
            Self::Sent(r)
            | Self::Failed(r)
            | Self::Deferred(r)
            | Self::Scheduled(r)
            | Self::Recovered(r) => Some(r),
            Self::Duplicate | Self::Malformed => None,
        }
    }
}

/// Counts for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
    pub scheduled: usize,
    pub duplicates: usize,
    /// SENT rows rebuilt from a marker whose row was never persisted.
    pub recovered: usize,
    pub malformed: usize,
    /// Rows written by the bulk upsert.
    pub persisted: u64,
}

impl BatchReport {
    fn tally(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent(_) => self.sent += 1,
            DispatchOutcome::Failed(_) => self.failed += 1,
            DispatchOutcome::Deferred(_) => self.deferred += 1,
            DispatchOutcome::Scheduled(_) => self.scheduled += 1,
            DispatchOutcome::Recovered(_) => self.recovered += 1,
            DispatchOutcome::Duplicate => self.duplicates += 1,
            DispatchOutcome::Malformed => self.malformed += 1,
        }
    }
}

pub struct DispatchOrchestrator {
    codec: MessageCodec,
    idempotency: Arc<IdempotencyGuard>,
    resolver: Arc<PreferenceResolver>,
    deferred: DelayQueue,
    scheduled: DelayQueue,
    handlers: Arc<ChannelHandlers>,
    records: Arc<dyn NotificationRecordRepository>,
    clock: SharedClock,
    workers: Arc<Semaphore>,
}

impl DispatchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec: MessageCodec,
        idempotency: Arc<IdempotencyGuard>,
        resolver: Arc<PreferenceResolver>,
        deferred: DelayQueue,
        scheduled: DelayQueue,
        handlers: Arc<ChannelHandlers>,
        records: Arc<dyn NotificationRecordRepository>,
        clock: SharedClock,
        max_workers: usize,
    ) -> Self {
        Self {
            codec,
            idempotency,
            resolver,
            deferred,
            scheduled,
            handlers,
            records,
            clock,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    pub fn handlers(&self) -> &ChannelHandlers {
        &self.handlers
    }

    /// Process a batch and persist its outcomes in one write.
    ///
    /// An error means nothing from this batch was persisted and the batch
    /// must be redelivered.
    pub async fn process_batch(self: &Arc<Self>, batch: &[BrokerRecord]) -> Result<BatchReport> {
        let mut report = BatchReport {
            received: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let claimed: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let mut tasks = JoinSet::new();
        for record in batch.iter().cloned() {
            let this = Arc::clone(self);
            let claimed = Arc::clone(&claimed);
            let workers = Arc::clone(&self.workers);
            tasks.spawn(async move {
                let _permit = workers.acquire_owned().await.ok();
                this.dispatch(&record, &claimed).await
            });
        }

        let mut records = Vec::with_capacity(batch.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.tally(&outcome);
                    records.extend(outcome.record());
                }
                Err(e) => error!("Dispatch worker panicked: {}", e),
            }
        }

        report.persisted = self.records.upsert_all(&records).await?;
        info!(
            received = report.received,
            sent = report.sent,
            failed = report.failed,
            deferred = report.deferred,
            scheduled = report.scheduled,
            duplicates = report.duplicates,
            recovered = report.recovered,
            malformed = report.malformed,
            "Dispatch batch completed"
        );
        Ok(report)
    }

    /// Run one broker record through the decision chain.
    pub async fn dispatch(&self, record: &BrokerRecord, claimed: &DashSet<String>) -> DispatchOutcome {
        let message = match self.codec.open(&record.message.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    key = %record.message.key,
                    offset = record.offset,
                    "Dropping malformed notification payload: {}",
                    e
                );
                return DispatchOutcome::Malformed;
            }
        };

        let attempt = record.message.delivery_attempt;
        let origin = record.message.origin;
        let bill_id = message.bill_id;
        let channel = message.channel;

        let marker = self.idempotency.marker(bill_id, channel).await;
        if marker == Some(Marker::Processing) && !origin.is_release() {
            debug!(bill_id, %channel, %origin, "Skipping notification already in flight");
            return DispatchOutcome::Duplicate;
        }
        if !claimed.insert(message.dedup_key()) {
            debug!(bill_id, %channel, "Duplicate within batch");
            return DispatchOutcome::Duplicate;
        }
        if marker == Some(Marker::Sent) {
            return self.recover_sent(&message, attempt).await;
        }

        self.route(message, attempt, origin).await
    }

    /// A delivery whose batch failed to persist leaves a SENT marker without
    /// its SENT row. The replayed copy writes the row instead of sending.
    async fn recover_sent(&self, message: &BillingNotificationMessage, attempt: u32) -> DispatchOutcome {
        let (bill_id, channel) = (message.bill_id, message.channel);
        match self.records.is_sent(bill_id, channel).await {
            Ok(false) => {
                warn!(bill_id, %channel, "Sent marker without a SENT row, restoring the row");
                DispatchOutcome::Recovered(NotificationRecord::sent(
                    message,
                    attempt.saturating_sub(1),
                    self.clock.now(),
                ))
            }
            Ok(true) => {
                debug!(bill_id, %channel, "Skipping already sent notification");
                DispatchOutcome::Duplicate
            }
            Err(e) => {
                warn!(bill_id, %channel, "Sent ledger unavailable, skipping: {}", e);
                DispatchOutcome::Duplicate
            }
        }
    }

    async fn route(
        &self,
        message: BillingNotificationMessage,
        attempt: u32,
        origin: DeliveryOrigin,
    ) -> DispatchOutcome {
        let now = self.clock.now();
        let retry_count = attempt.saturating_sub(1);
        let (bill_id, user_id, channel) = (message.bill_id, message.user_id, message.channel);

        if let Some(release_at) = self
            .resolver
            .resolve_scheduled_time(user_id, channel, &message.billing_year_month)
            .await
            .filter(|at| *at > now)
        {
            return self
                .park(&self.scheduled, &message, release_at, retry_count)
                .await
                .map(|()| {
                    info!(bill_id, %channel, %release_at, "Scheduled for preferred time");
                    DispatchOutcome::Scheduled(NotificationRecord::scheduled(
                        &message,
                        retry_count,
                        release_at,
                        now,
                    ))
                })
                .unwrap_or_else(DispatchOutcome::Failed);
        }

        let quiet = self.resolver.resolve_quiet_time(user_id, channel, now).await;
        if let Some(release_at) = quiet.release_at.filter(|_| quiet.is_quiet) {
            return self
                .park(&self.deferred, &message, release_at, retry_count)
                .await
                .map(|()| {
                    info!(
                        bill_id,
                        %channel,
                        source = %quiet.source,
                        %release_at,
                        "Deferred by quiet time"
                    );
                    DispatchOutcome::Deferred(NotificationRecord::pending(
                        &message,
                        retry_count,
                        release_at,
                        now,
                    ))
                })
                .unwrap_or_else(DispatchOutcome::Failed);
        }

        let trace_id = uuid::Uuid::new_v4().to_string();
        let handler = self.handlers.for_channel(channel);
        match handler.handle(&message, &trace_id, attempt).await {
            Ok(()) => {
                if let Err(e) = self.idempotency.mark_sent(bill_id, channel).await {
                    warn!(bill_id, %channel, %trace_id, "Failed to write sent marker: {}", e);
                }
                info!(bill_id, %channel, %trace_id, attempt, %origin, "Notification sent");
                DispatchOutcome::Sent(NotificationRecord::sent(&message, retry_count, self.clock.now()))
            }
            Err(e) => {
                warn!(bill_id, %channel, %trace_id, attempt, "Notification delivery failed: {}", e);
                DispatchOutcome::Failed(NotificationRecord::failed(
                    &message,
                    retry_count,
                    e.to_string(),
                    self.clock.now(),
                ))
            }
        }
    }

    /// Mark in flight and push to `queue`. A failed push yields the FAILED
    /// record to persist instead.
    async fn park(
        &self,
        queue: &DelayQueue,
        message: &BillingNotificationMessage,
        release_at: chrono::DateTime<chrono::Utc>,
        retry_count: u32,
    ) -> std::result::Result<(), NotificationRecord> {
        let (bill_id, channel) = (message.bill_id, message.channel);
        if let Err(e) = self
            .idempotency
            .mark_processing(bill_id, channel, Some(release_at))
            .await
        {
            warn!(bill_id, %channel, "Failed to write processing marker: {}", e);
        }

        queue
            .schedule(message, release_at, channel)
            .await
            .map_err(|e| {
                error!(bill_id, %channel, queue = %queue.kind(), "Failed to park notification: {}", e);
                NotificationRecord::failed(
                    message,
                    retry_count,
                    format!("{} queue unavailable: {}", queue.kind(), e),
                    self.clock.now(),
                )
            })
    }
}
