//! In-process broker with per-group committed offsets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{BrokerConsumer, BrokerMessage, BrokerRecord, MessageBroker};
use crate::{Error, Result};

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<BrokerMessage>>,
    /// (group, topic) -> next offset to deliver after a restart.
    committed: HashMap<(String, String), usize>,
}

/// A single-partition, log-structured broker living in memory.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    unavailable: Arc<AtomicBool>,
    failing_keys: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make publishes with this key fail until cleared.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.lock().insert(key.into());
    }

    pub fn clear_failures(&self) {
        self.failing_keys.lock().clear();
        self.set_unavailable(false);
    }

    /// Everything ever published to `topic`, in order.
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .lock()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// A consumer for `group` positioned at the group's committed offset.
    pub fn consumer(&self, group: impl Into<String>, topic: impl Into<String>) -> InMemoryConsumer {
        let group = group.into();
        let topic = topic.into();
        let position = self.committed_offset(&group, &topic);
        InMemoryConsumer {
            broker: self.clone(),
            group,
            topic,
            position: Arc::new(Mutex::new(position)),
        }
    }

    pub fn committed_offset(&self, group: &str, topic: &str) -> usize {
        self.state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::broker("broker unavailable"));
        }
        if self.failing_keys.lock().contains(&message.key) {
            return Err(Error::broker(format!(
                "publish of key {} was not acknowledged",
                message.key
            )));
        }

        self.state
            .lock()
            .logs
            .entry(topic.to_string())
            .or_default()
            .push(message);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Consumer handle for one group on one topic.
#[derive(Clone)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    topic: String,
    position: Arc<Mutex<usize>>,
}

impl InMemoryConsumer {
    /// Rewind to the committed offset, as a restarted consumer would.
    pub fn restart(&self) {
        *self.position.lock() = self.broker.committed_offset(&self.group, &self.topic);
    }

    fn take(&self, max: usize) -> Vec<BrokerRecord> {
        let state = self.broker.state.lock();
        let Some(log) = state.logs.get(&self.topic) else {
            return Vec::new();
        };
        let mut position = self.position.lock();
        let end = log.len().min(position.saturating_add(max));
        let records = log[(*position).min(end)..end]
            .iter()
            .enumerate()
            .map(|(i, message)| BrokerRecord {
                topic: self.topic.clone(),
                partition: 0,
                offset: (*position + i) as i64,
                message: message.clone(),
            })
            .collect();
        *position = end.max(*position);
        records
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BrokerRecord>> {
        let notified = self.broker.notify.notified();
        let records = self.take(max);
        if !records.is_empty() || timeout.is_zero() {
            return Ok(records);
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        Ok(self.take(max))
    }

    async fn ack(&self, records: &[BrokerRecord]) -> Result<()> {
        let Some(last) = records
            .iter()
            .filter(|r| r.topic == self.topic)
            .map(|r| r.offset)
            .max()
        else {
            return Ok(());
        };

        let mut state = self.broker.state.lock();
        let committed = state
            .committed
            .entry((self.group.clone(), self.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(last as usize + 1);
        Ok(())
    }

    async fn nack(&self, records: &[BrokerRecord]) -> Result<()> {
        if let Some(first) = records
            .iter()
            .filter(|r| r.topic == self.topic)
            .map(|r| r.offset)
            .min()
        {
            let mut position = self.position.lock();
            *position = (*position).min(first as usize);
        }
        Ok(())
    }
}
