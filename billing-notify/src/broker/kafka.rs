//! Kafka broker (rdkafka).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::Offset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::time::Instant;

use super::{
    BrokerConsumer, BrokerMessage, BrokerRecord, HEADER_DELIVERY_ATTEMPT, HEADER_ORIGIN,
    MessageBroker, parse_headers,
};
use crate::{Error, Result};

fn broker_err(e: rdkafka::error::KafkaError) -> Error {
    Error::broker(e.to_string())
}

pub struct KafkaBroker {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaBroker {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("linger.ms", "5")
            .create()
            .map_err(broker_err)?;

        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<()> {
        let attempt = message.delivery_attempt.to_string();
        let origin = message.origin.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: HEADER_DELIVERY_ATTEMPT,
                value: Some(attempt.as_str()),
            })
            .insert(Header {
                key: HEADER_ORIGIN,
                value: Some(origin.as_str()),
            });

        let record = FutureRecord::to(topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| broker_err(e))?;
        Ok(())
    }
}

/// Manually committing consumer for one topic.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaConsumer {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .create()
            .map_err(broker_err)?;

        consumer.subscribe(&[topic]).map_err(broker_err)?;
        tracing::info!(topic = %topic, group = %group_id, "Kafka consumer subscribed");

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BrokerRecord>> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::with_capacity(max);

        while records.len() < max {
            let received = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(received) => received,
                Err(_) => break,
            };
            let message = received.map_err(broker_err)?;

            let headers: Vec<(String, Option<Vec<u8>>)> = message
                .headers()
                .map(|headers| {
                    headers
                        .iter()
                        .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec)))
                        .collect()
                })
                .unwrap_or_default();
            let (delivery_attempt, origin) =
                parse_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_deref())));

            records.push(BrokerRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                message: BrokerMessage {
                    key: message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .unwrap_or_default(),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    delivery_attempt,
                    origin,
                },
            });
        }

        Ok(records)
    }

    async fn ack(&self, records: &[BrokerRecord]) -> Result<()> {
        let mut next: HashMap<(String, i32), i64> = HashMap::new();
        for record in records {
            let entry = next
                .entry((record.topic.clone(), record.partition))
                .or_insert(record.offset + 1);
            *entry = (*entry).max(record.offset + 1);
        }
        if next.is_empty() {
            return Ok(());
        }

        let mut offsets = TopicPartitionList::new();
        for ((topic, partition), offset) in next {
            offsets
                .add_partition_offset(&topic, partition, Offset::Offset(offset))
                .map_err(broker_err)?;
        }
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(broker_err)?;
        tracing::debug!(topic = %self.topic, records = records.len(), "Committed offsets");
        Ok(())
    }

    async fn nack(&self, records: &[BrokerRecord]) -> Result<()> {
        let mut first: HashMap<(String, i32), i64> = HashMap::new();
        for record in records {
            let entry = first
                .entry((record.topic.clone(), record.partition))
                .or_insert(record.offset);
            *entry = (*entry).min(record.offset);
        }

        for ((topic, partition), offset) in first {
            self.consumer
                .seek(&topic, partition, Offset::Offset(offset), Duration::from_secs(5))
                .map_err(broker_err)?;
        }
        Ok(())
    }
}
