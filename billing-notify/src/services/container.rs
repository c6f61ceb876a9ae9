//! Service container for dependency injection.
//!
//! The ServiceContainer builds every pipeline component from a
//! [`PipelineConfig`] plus a set of [`Backends`], starts the consumer loops and
//! periodic jobs, and stops them through one cancellation token.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::broker::{InMemoryBroker, SharedBroker, SharedConsumer};
use crate::cache::{InMemoryCacheStore, SharedCacheStore};
use crate::clock::SharedClock;
use crate::config::PipelineConfig;
use crate::crypto::AesGcmCipher;
use crate::database::DbPool;
use crate::database::models::OutboxStatusCounts;
use crate::database::repositories::{
    NotificationRecordRepository, OutboxRepository, PreferenceRepository, SqlxBillRepository,
    SqlxNotificationRecordRepository, SqlxOutboxRepository, SqlxPreferenceRepository,
};
use crate::domain::{NotificationStatus, UserChannelPreference};
use crate::notification::{
    ChannelHandlers, ConsumerLoop, DeadLetterProcessor, DelayQueue, DispatchOrchestrator,
    DrainJob, IdempotencyGuard, MessageCodec, OutboxRelay, PreferenceResolver, QueueStats,
    RetryJob,
};
use crate::scheduler::{PeriodicJob, spawn_periodic};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// External systems the pipeline talks to.
#[derive(Clone)]
pub struct Backends {
    pub broker: SharedBroker,
    pub dispatch_consumer: SharedConsumer,
    pub dead_letter_consumer: SharedConsumer,
    pub cache: SharedCacheStore,
    pub clock: SharedClock,
}

impl Backends {
    /// Everything in process. Used by tests and single-node runs.
    pub fn in_memory(config: &PipelineConfig, broker: InMemoryBroker, clock: SharedClock) -> Self {
        let topics = &config.broker.topics;
        Self {
            dispatch_consumer: Arc::new(
                broker.consumer(config.broker.dispatch_group.clone(), topics.main.clone()),
            ),
            dead_letter_consumer: Arc::new(
                broker.consumer(config.broker.dead_letter_group.clone(), topics.dead_letter.clone()),
            ),
            broker: Arc::new(broker),
            cache: Arc::new(InMemoryCacheStore::new(clock.clone())),
            clock,
        }
    }

    /// Kafka and Redis when compiled in and configured, in-memory otherwise.
    #[allow(unused_mut)]
    pub async fn from_config(config: &PipelineConfig, clock: SharedClock) -> Result<Self> {
        let mut backends = Self::in_memory(config, InMemoryBroker::new(), clock);

        #[cfg(feature = "kafka")]
        if let Some(brokers) = config.broker.kafka_brokers.as_deref() {
            use crate::broker::{KafkaBroker, KafkaConsumer};
            let topics = &config.broker.topics;
            backends.broker = Arc::new(KafkaBroker::new(brokers)?);
            backends.dispatch_consumer = Arc::new(KafkaConsumer::new(
                brokers,
                &config.broker.dispatch_group,
                &topics.main,
            )?);
            backends.dead_letter_consumer = Arc::new(KafkaConsumer::new(
                brokers,
                &config.broker.dead_letter_group,
                &topics.dead_letter,
            )?);
            info!(brokers = %brokers, "Using Kafka broker");
        }

        #[cfg(feature = "redis")]
        if let Some(url) = config.broker.redis_url.as_deref() {
            backends.cache = Arc::new(crate::cache::RedisCacheStore::connect(url, 8).await?);
            info!("Using Redis cache store");
        }

        if config.broker.kafka_brokers.is_none() || config.broker.redis_url.is_none() {
            warn!("Running with in-process broker and/or cache; state is lost on restart");
        }
        Ok(backends)
    }
}

/// Operational counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub outbox: OutboxStatusCounts,
    pub records: Vec<(NotificationStatus, u64)>,
    pub deferred: QueueStats,
    pub scheduled: QueueStats,
}

/// Service container holding all pipeline services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: DbPool,
    pub config: PipelineConfig,
    pub backends: Backends,
    pub outbox: Arc<SqlxOutboxRepository>,
    pub records: Arc<SqlxNotificationRecordRepository>,
    pub preferences: Arc<SqlxPreferenceRepository>,
    pub bills: Arc<SqlxBillRepository>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub resolver: Arc<PreferenceResolver>,
    pub deferred: DelayQueue,
    pub scheduled: DelayQueue,
    pub handlers: Arc<ChannelHandlers>,
    pub relay: Arc<OutboxRelay>,
    pub retry: Arc<RetryJob>,
    pub deferred_drain: Arc<DrainJob>,
    pub scheduled_drain: Arc<DrainJob>,
    pub dispatch: Arc<ConsumerLoop<Arc<DispatchOrchestrator>>>,
    pub dead_letter: Arc<ConsumerLoop<DeadLetterProcessor>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    pub fn new(pool: DbPool, config: PipelineConfig, backends: Backends) -> Result<Self> {
        info!("Initializing service container");

        let outbox = Arc::new(SqlxOutboxRepository::new(pool.clone()));
        let records = Arc::new(SqlxNotificationRecordRepository::new(pool.clone()));
        let preferences = Arc::new(SqlxPreferenceRepository::new(pool.clone()));
        let bills = Arc::new(SqlxBillRepository::new(pool.clone()));

        let codec = match config.encryption_key.as_deref() {
            Some(key) => MessageCodec::new(Arc::new(AesGcmCipher::from_base64(key)?)),
            None => MessageCodec::plaintext(),
        };
        let clock = backends.clock.clone();
        let cache = backends.cache.clone();
        let topics = config.broker.topics.clone();

        let idempotency = Arc::new(IdempotencyGuard::new(
            cache.clone(),
            records.clone(),
            clock.clone(),
            config.idempotency.clone(),
        ));
        let resolver = Arc::new(PreferenceResolver::new(
            cache.clone(),
            preferences.clone(),
            config.quiet_policy,
            config.resolver.clone(),
        ));
        let deferred = DelayQueue::deferred(cache.clone(), clock.clone());
        let scheduled = DelayQueue::scheduled(cache, clock.clone());
        let handlers = Arc::new(ChannelHandlers::from_config(config.email.clone())?);

        let orchestrator = Arc::new(DispatchOrchestrator::new(
            codec.clone(),
            idempotency.clone(),
            resolver.clone(),
            deferred.clone(),
            scheduled.clone(),
            handlers.clone(),
            records.clone(),
            clock.clone(),
            config.max_workers,
        ));
        let dispatch = Arc::new(ConsumerLoop::new(
            backends.dispatch_consumer.clone(),
            orchestrator,
            config.consumer.clone(),
        ));
        let dead_letter = Arc::new(ConsumerLoop::new(
            backends.dead_letter_consumer.clone(),
            DeadLetterProcessor::new(
                codec.clone(),
                idempotency.clone(),
                handlers.clone(),
                records.clone(),
                clock.clone(),
            ),
            config.consumer.clone(),
        ));

        let relay = Arc::new(OutboxRelay::new(
            outbox.clone(),
            backends.broker.clone(),
            codec.clone(),
            topics.main.clone(),
            config.relay.batch_size,
        ));
        let retry = Arc::new(RetryJob::new(
            records.clone(),
            bills.clone(),
            backends.broker.clone(),
            codec.clone(),
            idempotency.clone(),
            topics.clone(),
            clock,
            config.retry.job.clone(),
        ));
        let deferred_drain = Arc::new(DrainJob::new(
            deferred.clone(),
            backends.broker.clone(),
            codec.clone(),
            records.clone(),
            topics.main.clone(),
            config.drain.batch_size,
        ));
        let scheduled_drain = Arc::new(DrainJob::new(
            scheduled.clone(),
            backends.broker.clone(),
            codec,
            records.clone(),
            topics.main,
            config.drain.batch_size,
        ));

        Ok(Self {
            pool,
            config,
            backends,
            outbox,
            records,
            preferences,
            bills,
            idempotency,
            resolver,
            deferred,
            scheduled,
            handlers,
            relay,
            retry,
            deferred_drain,
            scheduled_drain,
            dispatch,
            dead_letter,
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start both consumer loops and every periodic job.
    pub fn start(&self) {
        let token = self.cancellation_token.clone();
        let retry_interval = self.config.retry.active_interval();
        info!(
            profile = %self.config.retry.profile,
            retry_interval_secs = retry_interval.as_secs(),
            "Starting pipeline services"
        );

        let jobs: [(Arc<dyn PeriodicJob>, Duration); 4] = [
            (self.relay.clone(), self.config.relay.poll_interval),
            (self.retry.clone(), retry_interval),
            (self.deferred_drain.clone(), self.config.drain.interval),
            (self.scheduled_drain.clone(), self.config.drain.interval),
        ];

        let mut tasks = self.tasks.lock();
        for (job, period) in jobs {
            tasks.push(spawn_periodic(job, period, token.clone()));
        }

        let dispatch = self.dispatch.clone();
        let cancel = token.clone();
        tasks.push(tokio::spawn(async move { dispatch.run(cancel).await }));

        let dead_letter = self.dead_letter.clone();
        tasks.push(tokio::spawn(async move { dead_letter.run(token).await }));
    }

    /// Settings API hook: store a preference and drop its cached copies.
    pub async fn update_preference(&self, preference: &UserChannelPreference) -> Result<()> {
        self.preferences.upsert(preference).await?;
        self.resolver
            .invalidate(preference.user_id, preference.channel)
            .await;
        Ok(())
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        Ok(PipelineStats {
            outbox: self.outbox.status_counts().await?,
            records: self.records.count_by_status().await?,
            deferred: self.deferred.stats().await?,
            scheduled: self.scheduled.stats().await?,
        })
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let joined = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Background task ended abnormally: {}", e);
                    }
                }
            }
            Err(_) => warn!("Shutdown timeout reached, forcing shutdown"),
        }

        info!("Closing database pool...");
        self.pool.close().await;
        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system;
    use crate::database::init_memory_pool;
    use crate::domain::Channel;
    use crate::domain::preference::parse_hhmm;

    fn config() -> PipelineConfig {
        PipelineConfig::from_lookup(|_| None).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let pool = init_memory_pool().await.unwrap();
        let config = config();
        let backends = Backends::in_memory(&config, InMemoryBroker::new(), system());
        let container = ServiceContainer::new(pool, config, backends).unwrap();

        container.start();
        assert!(!container.is_shutting_down());
        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(container.is_shutting_down());
        assert!(container.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_update_preference_invalidates_cache() {
        let pool = init_memory_pool().await.unwrap();
        let config = config();
        let backends = Backends::in_memory(&config, InMemoryBroker::new(), system());
        let container = ServiceContainer::new(pool, config, backends).unwrap();

        let noon = chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2024, 3, 1, 12, 0, 0).unwrap();
        let before = container
            .resolver
            .resolve_quiet_time(1, Channel::Email, noon)
            .await;
        assert!(!before.is_quiet);

        container
            .update_preference(&UserChannelPreference {
                user_id: 1,
                channel: Channel::Email,
                enabled: true,
                priority: 0,
                quiet_start: Some(parse_hhmm("11:00").unwrap()),
                quiet_end: Some(parse_hhmm("13:00").unwrap()),
                preferred_day: None,
                preferred_hour: None,
                preferred_minute: None,
            })
            .await
            .unwrap();

        let after = container
            .resolver
            .resolve_quiet_time(1, Channel::Email, noon)
            .await;
        assert!(after.is_quiet);

        let stats = container.stats().await.unwrap();
        assert_eq!(stats.deferred.total, 0);
        assert!(stats.records.is_empty());
    }

    #[tokio::test]
    async fn test_bad_encryption_key_rejected() {
        let pool = init_memory_pool().await.unwrap();
        let mut config = config();
        config.encryption_key = Some("c2hvcnQ=".to_string());
        let backends = Backends::in_memory(&config, InMemoryBroker::new(), system());
        assert!(ServiceContainer::new(pool, config, backends).is_err());
    }
}
