//! Sorted-set delay queues.
//!
//! Two instances share this implementation: the deferred queue (quiet time)
//! and the scheduled queue (preferred delivery time). Every entry lives in a
//! per-channel set and in an aggregate set, scored by its release instant in
//! epoch seconds, with the serialized message as the member.
//!
//! Draining never removes. Callers remove an entry only after it has been
//! re-published, so a failed publish leaves it in place for the next drain.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::Result;
use crate::cache::{SharedCacheStore, keys};
use crate::clock::{Clock, SharedClock};
use crate::domain::{BillingNotificationMessage, Channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum QueueKind {
    Deferred,
    Scheduled,
}

impl QueueKind {
    fn key(&self, channel: Option<Channel>) -> String {
        match self {
            Self::Deferred => keys::deferred(channel),
            Self::Scheduled => keys::scheduled(channel),
        }
    }
}

/// An entry read back from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: BillingNotificationMessage,
    /// Raw member, needed to remove the exact entry.
    pub member: String,
    pub release_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub per_channel: BTreeMap<String, u64>,
    pub total: u64,
    /// Entries whose release time has passed.
    pub ready: u64,
}

#[derive(Clone)]
pub struct DelayQueue {
    kind: QueueKind,
    cache: SharedCacheStore,
    clock: SharedClock,
}

impl DelayQueue {
    pub fn new(kind: QueueKind, cache: SharedCacheStore, clock: SharedClock) -> Self {
        Self { kind, cache, clock }
    }

    pub fn deferred(cache: SharedCacheStore, clock: SharedClock) -> Self {
        Self::new(QueueKind::Deferred, cache, clock)
    }

    pub fn scheduled(cache: SharedCacheStore, clock: SharedClock) -> Self {
        Self::new(QueueKind::Scheduled, cache, clock)
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Park `message` until `release_at` on `channel`.
    pub async fn schedule(
        &self,
        message: &BillingNotificationMessage,
        release_at: DateTime<Utc>,
        channel: Channel,
    ) -> Result<()> {
        let member = message.to_json()?;
        let score = release_at.timestamp();
        self.cache
            .zadd(&self.kind.key(Some(channel)), score, &member)
            .await?;
        self.cache.zadd(&self.kind.key(None), score, &member).await?;
        Ok(())
    }

    /// Up to `limit` entries due now, oldest first. `None` reads all channels.
    pub async fn drain_ready(
        &self,
        channel: Option<Channel>,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>> {
        let now = self.clock.now().timestamp();
        let key = self.kind.key(channel);
        let entries = self
            .cache
            .zrange_by_score(&key, i64::MIN, now, Some(limit))
            .await?;
        Ok(self.decode(&key, entries).await)
    }

    /// Remove a drained entry from both of its sets.
    pub async fn remove(&self, entry: &QueuedMessage) -> Result<()> {
        let members = std::slice::from_ref(&entry.member);
        self.cache
            .zrem(&self.kind.key(Some(entry.message.channel)), members)
            .await?;
        self.cache.zrem(&self.kind.key(None), members).await?;
        Ok(())
    }

    /// Drop every entry for this bill on this channel.
    pub async fn cancel(&self, bill_id: i64, channel: Channel) -> Result<u64> {
        let entries = self.find(bill_id, channel).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let members: Vec<String> = entries.into_iter().map(|e| e.member).collect();
        let removed = self
            .cache
            .zrem(&self.kind.key(Some(channel)), &members)
            .await?;
        self.cache.zrem(&self.kind.key(None), &members).await?;
        Ok(removed)
    }

    /// Move this bill's entries to `release_at`. Returns whether any existed.
    pub async fn reschedule(
        &self,
        bill_id: i64,
        channel: Channel,
        release_at: DateTime<Utc>,
    ) -> Result<bool> {
        let entries = self.find(bill_id, channel).await?;
        let score = release_at.timestamp();
        for entry in &entries {
            self.cache
                .zadd(&self.kind.key(Some(channel)), score, &entry.member)
                .await?;
            self.cache
                .zadd(&self.kind.key(None), score, &entry.member)
                .await?;
        }
        Ok(!entries.is_empty())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for channel in Channel::ALL {
            let count = self.cache.zcard(&self.kind.key(Some(channel))).await?;
            stats.per_channel.insert(channel.as_str().to_string(), count);
        }
        let aggregate = self.kind.key(None);
        stats.total = self.cache.zcard(&aggregate).await?;
        stats.ready = self
            .cache
            .zcount(&aggregate, i64::MIN, self.clock.now().timestamp())
            .await?;
        Ok(stats)
    }

    async fn find(&self, bill_id: i64, channel: Channel) -> Result<Vec<QueuedMessage>> {
        let key = self.kind.key(Some(channel));
        let entries = self
            .cache
            .zrange_by_score(&key, i64::MIN, i64::MAX, None)
            .await?;
        Ok(self
            .decode(&key, entries)
            .await
            .into_iter()
            .filter(|e| e.message.bill_id == bill_id)
            .collect())
    }

    /// Parse members, evicting any that no longer deserialize.
    async fn decode(&self, key: &str, entries: Vec<(String, i64)>) -> Vec<QueuedMessage> {
        let mut decoded = Vec::with_capacity(entries.len());
        let mut corrupt = Vec::new();
        for (member, score) in entries {
            match BillingNotificationMessage::from_json(member.as_bytes()) {
                Ok(message) => decoded.push(QueuedMessage {
                    message,
                    member,
                    release_at: score,
                }),
                Err(e) => {
                    warn!(queue = %self.kind, key = %key, "Evicting unreadable queue entry: {}", e);
                    corrupt.push(member);
                }
            }
        }
        if !corrupt.is_empty() {
            if let Err(e) = self.cache.zrem(key, &corrupt).await {
                warn!(queue = %self.kind, "Failed to evict unreadable entries: {}", e);
            }
            if let Err(e) = self.cache.zrem(&self.kind.key(None), &corrupt).await {
                warn!(queue = %self.kind, "Failed to evict unreadable entries: {}", e);
            }
        }
        decoded
    }
}
