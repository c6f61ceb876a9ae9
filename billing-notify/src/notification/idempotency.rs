//! Idempotency markers.
//!
//! `sent:{billId}:{channel}` holds `SENT` once a delivery succeeded and
//! `PROCESSING` while the message is parked in a delay queue or being
//! retried. A SENT marker suppresses every further delivery. A PROCESSING
//! marker only suppresses fresh outbox deliveries: the released copy that
//! the pipeline itself re-publishes must still get through.
//!
//! Markers expire. When no marker is found the durable notification record
//! is consulted, so a redelivery after expiry still sees a SENT row.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::broker::DeliveryOrigin;
use crate::cache::{SharedCacheStore, keys};
use crate::clock::SharedClock;
use crate::database::repositories::NotificationRecordRepository;
use crate::domain::Channel;
use crate::Result;

const SENT: &str = "SENT";
const PROCESSING: &str = "PROCESSING";

/// Slack added on top of a parked message's release time.
const PROCESSING_GRACE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Sent,
    Processing,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub sent_ttl: Duration,
    /// Minimum lifetime of a PROCESSING marker.
    pub processing_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            sent_ttl: Duration::from_secs(7 * 24 * 3600),
            processing_ttl: Duration::from_secs(600),
        }
    }
}

pub struct IdempotencyGuard {
    cache: SharedCacheStore,
    records: Arc<dyn NotificationRecordRepository>,
    clock: SharedClock,
    config: IdempotencyConfig,
    sent_writes: AtomicU64,
}

impl IdempotencyGuard {
    pub fn new(
        cache: SharedCacheStore,
        records: Arc<dyn NotificationRecordRepository>,
        clock: SharedClock,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            cache,
            records,
            clock,
            config,
            sent_writes: AtomicU64::new(0),
        }
    }

    /// Current marker, falling back to the record store when the cache is
    /// down or the marker has expired.
    pub async fn marker(&self, bill_id: i64, channel: Channel) -> Option<Marker> {
        match self.cache.get(&keys::sent(bill_id, channel)).await {
            Ok(Some(value)) if value == PROCESSING => return Some(Marker::Processing),
            Ok(Some(_)) => return Some(Marker::Sent),
            Ok(None) => {}
            Err(e) => warn!(bill_id, %channel, "Idempotency cache unavailable: {}", e),
        }

        match self.records.is_sent(bill_id, channel).await {
            Ok(true) => Some(Marker::Sent),
            Ok(false) => None,
            Err(e) => {
                warn!(bill_id, %channel, "Sent ledger unavailable: {}", e);
                None
            }
        }
    }

    /// Whether any marker exists for this bill on this channel.
    pub async fn is_duplicate(&self, bill_id: i64, channel: Channel) -> bool {
        self.marker(bill_id, channel).await.is_some()
    }

    /// Whether a delivery arriving from `origin` must be dropped.
    pub async fn should_skip(&self, bill_id: i64, channel: Channel, origin: DeliveryOrigin) -> bool {
        match self.marker(bill_id, channel).await {
            Some(Marker::Sent) => true,
            Some(Marker::Processing) => !origin.is_release(),
            None => false,
        }
    }

    pub async fn mark_sent(&self, bill_id: i64, channel: Channel) -> Result<()> {
        self.cache
            .set(&keys::sent(bill_id, channel), SENT, Some(self.config.sent_ttl))
            .await?;
        self.sent_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Mark a message parked until `release_at`.
    pub async fn mark_processing(
        &self,
        bill_id: i64,
        channel: Channel,
        release_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let ttl = self.processing_ttl(release_at);
        self.cache
            .set(&keys::sent(bill_id, channel), PROCESSING, Some(ttl))
            .await
    }

    /// Mark many in-flight retries in one round trip.
    pub async fn mark_processing_many(&self, targets: &[(i64, Channel)]) -> Result<()> {
        let entries: Vec<(String, String)> = targets
            .iter()
            .map(|(bill_id, channel)| (keys::sent(*bill_id, *channel), PROCESSING.to_string()))
            .collect();
        self.cache
            .set_many(&entries, Some(self.config.processing_ttl))
            .await
    }

    pub async fn clear(&self, bill_id: i64, channel: Channel) -> Result<()> {
        self.cache.delete(&keys::sent(bill_id, channel)).await
    }

    /// SENT markers written by this guard.
    pub fn sent_writes(&self) -> u64 {
        self.sent_writes.load(Ordering::Relaxed)
    }

    fn processing_ttl(&self, release_at: Option<DateTime<Utc>>) -> Duration {
        let until_release = release_at
            .and_then(|at| (at - self.clock.now()).to_std().ok())
            .map(|d| d + PROCESSING_GRACE)
            .unwrap_or_default();
        until_release.max(self.config.processing_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, InMemoryCacheStore};
    use crate::clock::{Clock, ManualClock};
    use crate::database::init_memory_pool;
    use crate::database::repositories::SqlxNotificationRecordRepository;
    use crate::domain::NotificationRecord;
    use crate::domain::message::fixtures::message;
    use chrono::TimeZone;

    struct Fixture {
        guard: IdempotencyGuard,
        cache: InMemoryCacheStore,
        clock: ManualClock,
        records: Arc<SqlxNotificationRecordRepository>,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let cache = InMemoryCacheStore::new(Arc::new(clock.clone()));
        let records = Arc::new(SqlxNotificationRecordRepository::new(
            init_memory_pool().await.unwrap(),
        ));
        let guard = IdempotencyGuard::new(
            Arc::new(cache.clone()),
            records.clone(),
            Arc::new(clock.clone()),
            IdempotencyConfig::default(),
        );
        Fixture {
            guard,
            cache,
            clock,
            records,
        }
    }

    #[tokio::test]
    async fn test_sent_marker_blocks_everything() {
        let f = fixture().await;
        assert!(!f.guard.is_duplicate(1, Channel::Email).await);
        f.guard.mark_sent(1, Channel::Email).await.unwrap();

        assert!(f.guard.is_duplicate(1, Channel::Email).await);
        assert!(f.guard.should_skip(1, Channel::Email, DeliveryOrigin::Retry).await);
        assert!(!f.guard.is_duplicate(1, Channel::Sms).await);
        assert_eq!(f.guard.sent_writes(), 1);
    }

    #[tokio::test]
    async fn test_processing_marker_lets_released_copy_through() {
        let f = fixture().await;
        f.guard
            .mark_processing(2, Channel::Push, None)
            .await
            .unwrap();

        assert!(f.guard.should_skip(2, Channel::Push, DeliveryOrigin::Outbox).await);
        assert!(!f.guard.should_skip(2, Channel::Push, DeliveryOrigin::Deferred).await);
        assert!(!f.guard.should_skip(2, Channel::Push, DeliveryOrigin::Scheduled).await);
    }

    #[tokio::test]
    async fn test_processing_marker_outlives_release() {
        let f = fixture().await;
        let release = f.clock.now() + chrono::Duration::hours(20);
        f.guard
            .mark_processing(3, Channel::Email, Some(release))
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::hours(20) + chrono::Duration::minutes(30));
        assert_eq!(f.guard.marker(3, Channel::Email).await, Some(Marker::Processing));

        f.clock.advance(chrono::Duration::hours(1));
        assert_eq!(f.guard.marker(3, Channel::Email).await, None);
    }

    #[tokio::test]
    async fn test_expired_marker_falls_back_to_sent_ledger() {
        let f = fixture().await;
        f.guard.mark_sent(4, Channel::Email).await.unwrap();
        f.records
            .upsert_all(&[NotificationRecord::sent(
                &message(4, Channel::Email),
                0,
                f.clock.now(),
            )])
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::days(8));
        assert_eq!(f.cache.get("sent:4:EMAIL").await.unwrap(), None);
        assert!(f.guard.is_duplicate(4, Channel::Email).await);
    }

    #[tokio::test]
    async fn test_cache_outage_is_not_fatal() {
        let f = fixture().await;
        f.cache.set_available(false);
        assert_eq!(f.guard.marker(5, Channel::Sms).await, None);
        assert!(f.guard.mark_sent(5, Channel::Sms).await.is_err());
    }
}
