//! End-to-end tests for the dispatch pipeline.
//!
//! Every component runs in process: SQLite in memory, the in-memory broker
//! and cache, and a manual clock. Jobs are driven one cycle at a time.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use billing_notify::broker::{BrokerMessage, InMemoryBroker, MessageBroker};
use billing_notify::clock::ManualClock;
use billing_notify::config::PipelineConfig;
use billing_notify::database::init_memory_pool;
use billing_notify::database::models::{BillDbModel, OutboxEventDbModel};
use billing_notify::database::repositories::{
    BillRepository, NotificationRecordRepository, OutboxRepository,
};
use billing_notify::domain::{
    BillingNotificationMessage, Channel, NotificationStatus, UserChannelPreference,
};
use billing_notify::notification::Marker;
use billing_notify::services::{Backends, ServiceContainer};

struct Pipeline {
    container: ServiceContainer,
    broker: InMemoryBroker,
    clock: ManualClock,
}

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

async fn pipeline(start: DateTime<Utc>, email_failure_rate: &str) -> Pipeline {
    let vars = [
        ("CONSUMER_POLL_MS", "20"),
        ("EMAIL_LATENCY_MS", "0"),
        ("EMAIL_FIRST_ATTEMPT_FAILURE_RATE", email_failure_rate),
        ("EMAIL_RETRY_FAILURE_RATE", email_failure_rate),
    ];
    let config = PipelineConfig::from_lookup(|key| {
        vars.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
    .unwrap();

    let clock = ManualClock::new(start);
    let broker = InMemoryBroker::new();
    let backends = Backends::in_memory(&config, broker.clone(), Arc::new(clock.clone()));
    let pool = init_memory_pool().await.unwrap();
    let container = ServiceContainer::new(pool, config, backends).unwrap();
    Pipeline {
        container,
        broker,
        clock,
    }
}

fn message(bill_id: i64, channel: Channel, month: &str) -> BillingNotificationMessage {
    BillingNotificationMessage {
        bill_id,
        user_id: 7,
        billing_year_month: month.to_string(),
        bill_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        due_date: NaiveDate::from_ymd_opt(2024, 2, 25).unwrap(),
        recipient_email: Some("user7@example.com".to_string()),
        recipient_phone: Some("+15550000007".to_string()),
        recipient_name: "Lee".to_string(),
        total_amount: 12_500,
        channel,
        produced_at: at(2024, 2, 1, 0),
    }
}

impl Pipeline {
    /// What the billing batch writes: the bill and its outbox row.
    async fn bill(&self, message: &BillingNotificationMessage) -> OutboxEventDbModel {
        self.container
            .bills
            .upsert(&BillDbModel::from_message(message, 0))
            .await
            .unwrap();
        let row = OutboxEventDbModel::ready(message).unwrap();
        self.container.outbox.upsert(&row).await.unwrap();
        row
    }

    async fn status(&self, bill_id: i64, channel: Channel) -> Option<(NotificationStatus, u32)> {
        self.container
            .records
            .find(bill_id, channel)
            .await
            .unwrap()
            .map(|r| (r.status, r.retry_count))
    }

    fn email_calls(&self) -> u64 {
        self.container
            .handlers
            .for_channel(Channel::Email)
            .stats()
            .calls()
    }
}

#[tokio::test]
async fn duplicate_delivery_yields_one_sent_record() {
    let p = pipeline(at(2024, 3, 1, 12), "0.0").await;
    let msg = message(1001, Channel::Email, "2024-02");
    let topic = p.container.config.broker.topics.main.clone();
    let payload = msg.to_json().unwrap().into_bytes();

    for _ in 0..2 {
        p.broker
            .publish(&topic, BrokerMessage::new("1001", payload.clone()))
            .await
            .unwrap();
    }
    p.container.dispatch.poll_once().await.unwrap();
    // and once more in a later batch
    p.broker
        .publish(&topic, BrokerMessage::new("1001", payload))
        .await
        .unwrap();
    p.container.dispatch.poll_once().await.unwrap();

    assert_eq!(p.status(1001, Channel::Email).await, Some((NotificationStatus::Sent, 0)));
    assert_eq!(p.container.idempotency.sent_writes(), 1);
    assert_eq!(p.email_calls(), 1);
}

#[tokio::test]
async fn message_in_quiet_time_waits_for_window_to_close() {
    let p = pipeline(at(2024, 3, 1, 23), "0.0").await;
    let msg = message(1001, Channel::Email, "2024-02");
    p.bill(&msg).await;

    assert_eq!(p.container.relay.relay_once().await.unwrap().published, 1);
    let report = p.container.dispatch.poll_once().await.unwrap().unwrap();
    assert_eq!(report.deferred, 1);

    assert_eq!(p.status(1001, Channel::Email).await, Some((NotificationStatus::Pending, 0)));
    let stats = p.container.deferred.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.per_channel["EMAIL"], 1);
    assert_eq!(p.email_calls(), 0);
    assert_ne!(p.container.idempotency.marker(1001, Channel::Email).await, Some(Marker::Sent));
    assert_eq!(p.container.idempotency.sent_writes(), 0);

    // still quiet at 07:59
    p.clock.set(Utc.with_ymd_and_hms(2024, 3, 2, 7, 59, 0).unwrap());
    assert!(p.container.deferred.drain_ready(None, 10).await.unwrap().is_empty());
    assert_eq!(p.container.deferred_drain.drain_once().await.unwrap().published, 0);

    p.clock.set(at(2024, 3, 2, 8));
    assert_eq!(p.container.deferred_drain.drain_once().await.unwrap().published, 1);
    assert_eq!(p.container.deferred.stats().await.unwrap().total, 0);

    let report = p.container.dispatch.poll_once().await.unwrap().unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(p.status(1001, Channel::Email).await, Some((NotificationStatus::Sent, 0)));
    assert_eq!(p.email_calls(), 1);
}

#[tokio::test]
async fn preferred_day_31_clamps_to_end_of_february() {
    let p = pipeline(at(2023, 2, 1, 12), "0.0").await;
    p.container
        .update_preference(&UserChannelPreference {
            user_id: 7,
            channel: Channel::Sms,
            enabled: true,
            priority: 0,
            quiet_start: None,
            quiet_end: None,
            preferred_day: Some(31),
            preferred_hour: Some(9),
            preferred_minute: Some(30),
        })
        .await
        .unwrap();
    let msg = message(2002, Channel::Sms, "2023-02");
    p.bill(&msg).await;

    p.container.relay.relay_once().await.unwrap();
    let report = p.container.dispatch.poll_once().await.unwrap().unwrap();
    assert_eq!(report.scheduled, 1);

    let release = Utc.with_ymd_and_hms(2023, 2, 28, 9, 30, 0).unwrap();
    let record = p.container.records.find(2002, Channel::Sms).await.unwrap().unwrap();
    assert_eq!(record.status, NotificationStatus::Scheduled);
    assert_eq!(record.scheduled_at, Some(release));

    p.clock.set(release);
    assert_eq!(p.container.scheduled_drain.drain_once().await.unwrap().published, 1);
    p.container.dispatch.poll_once().await.unwrap();
    assert_eq!(p.status(2002, Channel::Sms).await, Some((NotificationStatus::Sent, 0)));
}

#[tokio::test]
async fn exhausted_retries_escalate_to_sms_exactly_once() {
    let p = pipeline(at(2024, 3, 1, 12), "1.0").await;
    let msg = message(3003, Channel::Email, "2024-02");
    p.bill(&msg).await;
    p.container.relay.relay_once().await.unwrap();

    p.container.dispatch.poll_once().await.unwrap();
    assert_eq!(p.status(3003, Channel::Email).await, Some((NotificationStatus::Failed, 0)));

    for expected in 1..=3 {
        let report = p.container.retry.retry_once().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(
            p.status(3003, Channel::Email).await,
            Some((NotificationStatus::Retry, expected))
        );
        p.container.dispatch.poll_once().await.unwrap();
        assert_eq!(
            p.status(3003, Channel::Email).await,
            Some((NotificationStatus::Failed, expected))
        );
    }
    assert_eq!(p.email_calls(), 4);

    let report = p.container.retry.retry_once().await.unwrap();
    assert_eq!((report.retried, report.escalated), (0, 1));
    let dead_letter_topic = p.container.config.broker.topics.dead_letter.clone();
    assert_eq!(p.broker.messages(&dead_letter_topic).len(), 1);

    let fallback = p.container.dead_letter.poll_once().await.unwrap().unwrap();
    assert_eq!(fallback.sent, 1);
    assert_eq!(p.status(3003, Channel::Sms).await, Some((NotificationStatus::Sent, 0)));

    // terminal: never selected again
    for _ in 0..3 {
        assert_eq!(p.container.retry.retry_once().await.unwrap().selected, 0);
    }
    assert_eq!(p.broker.messages(&dead_letter_topic).len(), 1);
    assert_eq!(p.email_calls(), 4);
    let record = p.container.records.find(3003, Channel::Email).await.unwrap().unwrap();
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(record.escalated_at.is_some());
}

#[tokio::test]
async fn outbox_rows_stay_ready_until_acknowledged() {
    let p = pipeline(at(2024, 3, 1, 12), "0.0").await;
    for bill_id in 1..=3 {
        p.bill(&message(bill_id, Channel::Push, "2024-02")).await;
    }

    p.broker.set_unavailable(true);
    let report = p.container.relay.relay_once().await.unwrap();
    assert_eq!((report.fetched, report.marked), (3, 0));
    assert_eq!(p.container.outbox.status_counts().await.unwrap().ready, 3);

    p.broker.set_unavailable(false);
    let report = p.container.relay.relay_once().await.unwrap();
    assert_eq!((report.fetched, report.marked), (3, 3));

    let dispatched = p.container.dispatch.poll_once().await.unwrap().unwrap();
    assert_eq!(dispatched.sent, 3);
    let stats = p.container.stats().await.unwrap();
    assert_eq!(stats.outbox.published, 3);
    assert_eq!(stats.records, vec![(NotificationStatus::Sent, 3)]);
}

#[tokio::test]
async fn consumer_restart_redelivers_unacknowledged_batch() {
    let p = pipeline(at(2024, 3, 1, 12), "0.0").await;
    let msg = message(4004, Channel::Push, "2024-02");
    p.bill(&msg).await;
    p.container.relay.relay_once().await.unwrap();

    // a second consumer in the same group sees the same unacked record
    let topics = &p.container.config.broker.topics;
    let replay = p
        .broker
        .consumer(p.container.config.broker.dispatch_group.clone(), topics.main.clone());
    p.container.dispatch.poll_once().await.unwrap();
    let redelivered = billing_notify::broker::BrokerConsumer::poll_batch(
        &replay,
        10,
        std::time::Duration::ZERO,
    )
    .await
    .unwrap();
    assert_eq!(redelivered.len(), 1);

    let orchestrator = p.container.dispatch.processor();
    let report = orchestrator.process_batch(&redelivered).await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(p.status(4004, Channel::Push).await, Some((NotificationStatus::Sent, 0)));
}
