//! Broker consumer loops.
//!
//! A [`ConsumerLoop`] polls bounded batches and hands each to a
//! [`BatchProcessor`]. The batch is acknowledged only when the processor
//! returns `Ok`; on error it is rewound and will be polled again.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::orchestrator::{BatchReport, DispatchOrchestrator};
use crate::Result;
use crate::broker::{BrokerRecord, SharedConsumer};

/// Handles one polled batch end to end, including persistence.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    type Report: Debug + Default + Send;

    fn name(&self) -> &'static str;

    async fn process(&self, batch: &[BrokerRecord]) -> Result<Self::Report>;
}

#[async_trait]
impl BatchProcessor for Arc<DispatchOrchestrator> {
    type Report = BatchReport;

    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn process(&self, batch: &[BrokerRecord]) -> Result<BatchReport> {
        self.process_batch(batch).await
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Pause after a failed cycle before polling again.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_timeout: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }
}

pub struct ConsumerLoop<P: BatchProcessor> {
    consumer: SharedConsumer,
    processor: P,
    config: ConsumerConfig,
}

impl<P: BatchProcessor> ConsumerLoop<P> {
    pub fn new(consumer: SharedConsumer, processor: P, config: ConsumerConfig) -> Self {
        Self {
            consumer,
            processor,
            config,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Poll one batch and process it. Returns `None` when nothing arrived.
    pub async fn poll_once(&self) -> Result<Option<P::Report>> {
        let batch = self
            .consumer
            .poll_batch(self.config.batch_size, self.config.poll_timeout)
            .await?;
        if batch.is_empty() {
            return Ok(None);
        }
        self.process(&batch).await.map(Some)
    }

    async fn process(&self, batch: &[BrokerRecord]) -> Result<P::Report> {
        match self.processor.process(batch).await {
            Ok(report) => {
                self.consumer.ack(batch).await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(nack_err) = self.consumer.nack(batch).await {
                    warn!(consumer = self.processor.name(), "Failed to rewind batch: {}", nack_err);
                }
                Err(e)
            }
        }
    }

    /// Consume until `cancel` fires. A batch already being processed is
    /// finished before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        let name = self.processor.name();
        info!(consumer = name, "Consumer started");
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.consumer.poll_batch(self.config.batch_size, self.config.poll_timeout) => polled,
            };

            let outcome = match polled {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => self.process(&batch).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(report) => debug!(consumer = name, ?report, "Batch acknowledged"),
                Err(e) => {
                    error!(consumer = name, "Batch failed, will be redelivered: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
        info!(consumer = name, "Consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerMessage, InMemoryBroker, MessageBroker};
    use crate::database::repositories::NotificationRecordRepository;
    use crate::domain::message::fixtures::message;
    use crate::domain::{Channel, NotificationStatus};
    use crate::notification::testing::{MAIN_TOPIC, harness};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FailsFirst {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchProcessor for FailsFirst {
        type Report = usize;

        fn name(&self) -> &'static str {
            "fails-first"
        }

        async fn process(&self, batch: &[BrokerRecord]) -> Result<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(crate::Error::Database("disk full".into()));
            }
            Ok(batch.len())
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 10,
            poll_timeout: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_acknowledged() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker
                .publish("t", BrokerMessage::new(format!("k{i}"), b"x".to_vec()))
                .await
                .unwrap();
        }
        let consumer = ConsumerLoop::new(
            Arc::new(broker.consumer("g", "t")),
            FailsFirst::default(),
            config(),
        );

        assert!(consumer.poll_once().await.is_err());
        assert_eq!(broker.committed_offset("g", "t"), 0);

        assert_eq!(consumer.poll_once().await.unwrap(), Some(3));
        assert_eq!(broker.committed_offset("g", "t"), 3);
        assert_eq!(consumer.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_dispatches_until_cancelled() {
        let h = harness(0.0).await;
        let consumer = Arc::new(ConsumerLoop::new(
            Arc::new(h.broker.consumer("dispatch", MAIN_TOPIC)),
            h.orchestrator.clone(),
            config(),
        ));
        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        let msg = message(21, Channel::Push);
        h.publish(
            MAIN_TOPIC,
            BrokerMessage::new("21", h.codec.seal(&msg).unwrap()),
        )
        .await;

        let mut sent = false;
        for _ in 0..100 {
            if let Some(record) = h.records.find(21, Channel::Push).await.unwrap() {
                sent = record.status == NotificationStatus::Sent;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sent);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(h.broker.committed_offset("dispatch", MAIN_TOPIC), 1);
    }
}
