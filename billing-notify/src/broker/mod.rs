//! Message broker abstraction.
//!
//! Producers publish [`BrokerMessage`]s to a named topic; consumers poll
//! bounded batches of [`BrokerRecord`]s and acknowledge them explicitly once
//! the batch's outcomes are durable. Acknowledgement is the commit point:
//! anything polled but not acked is delivered again to the group.

mod memory;
#[cfg(feature = "kafka")]
mod kafka;

pub use memory::{InMemoryBroker, InMemoryConsumer};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaConsumer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Header carrying the 1-based delivery attempt.
pub const HEADER_DELIVERY_ATTEMPT: &str = "delivery-attempt";
/// Header naming the path that produced the message.
pub const HEADER_ORIGIN: &str = "origin";

/// Which part of the pipeline put a message on the broker.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryOrigin {
    /// First publication by the outbox relay.
    Outbox,
    /// Released from the deferred (quiet-time) queue.
    Deferred,
    /// Released from the scheduled (preferred-time) queue.
    Scheduled,
    /// Re-published by the retry job.
    Retry,
    /// Escalated to the dead-letter topic.
    DeadLetter,
}

impl DeliveryOrigin {
    /// Released deliveries were parked by this pipeline and already hold a
    /// processing marker of their own.
    pub fn is_release(&self) -> bool {
        !matches!(self, Self::Outbox)
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub delivery_attempt: u32,
    pub origin: DeliveryOrigin,
}

impl BrokerMessage {
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            delivery_attempt: 1,
            origin: DeliveryOrigin::Outbox,
        }
    }

    pub fn with_attempt(mut self, delivery_attempt: u32) -> Self {
        self.delivery_attempt = delivery_attempt.max(1);
        self
    }

    pub fn with_origin(mut self, origin: DeliveryOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// A consumed message plus its position in the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub message: BrokerMessage,
}

/// Parse delivery headers, defaulting to a first delivery from the outbox.
pub fn parse_headers<'a>(
    headers: impl IntoIterator<Item = (&'a str, Option<&'a [u8]>)>,
) -> (u32, DeliveryOrigin) {
    let mut attempt = 1;
    let mut origin = DeliveryOrigin::Outbox;
    for (key, value) in headers {
        let Some(value) = value.and_then(|v| std::str::from_utf8(v).ok()) else {
            continue;
        };
        match key {
            HEADER_DELIVERY_ATTEMPT => attempt = value.trim().parse().unwrap_or(1).max(1),
            HEADER_ORIGIN => origin = value.parse().unwrap_or(DeliveryOrigin::Outbox),
            _ => {}
        }
    }
    (attempt, origin)
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish and wait for the broker's acknowledgement.
    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<()>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Up to `max` records, waiting at most `timeout` for the first one.
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BrokerRecord>>;

    /// Commit everything up to and including these records.
    async fn ack(&self, records: &[BrokerRecord]) -> Result<()>;

    /// Rewind so these records are polled again.
    async fn nack(&self, records: &[BrokerRecord]) -> Result<()>;
}

pub type SharedBroker = Arc<dyn MessageBroker>;
pub type SharedConsumer = Arc<dyn BrokerConsumer>;

/// Topic names used by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub main: String,
    pub dead_letter: String,
}

impl Topics {
    /// The dead-letter topic is always `<main>.DLT`.
    pub fn new(main: impl Into<String>) -> Self {
        let main = main.into();
        let dead_letter = format!("{main}.DLT");
        Self { main, dead_letter }
    }
}
