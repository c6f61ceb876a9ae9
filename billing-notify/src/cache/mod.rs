//! Key/value and sorted-set cache store.
//!
//! The pipeline only needs a small slice of a Redis-like API: string values
//! with a TTL, and scored sets for the delay queues. [`CacheStore`] captures
//! that slice so the dispatch path can run against [`InMemoryCacheStore`] in
//! tests and a Redis deployment (`redis` feature) in production.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryCacheStore;
#[cfg(feature = "redis")]
pub use redis::RedisCacheStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// A scored member read back from a sorted set.
pub type ScoredMember = (String, i64);

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write many entries in one round trip.
    async fn set_many(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Add or re-score a member.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>>;

    /// Remove members, returning how many existed.
    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64>;
}

/// Shared cache store handle.
pub type SharedCacheStore = Arc<dyn CacheStore>;

/// Cache key namespaces.
pub mod keys {
    use crate::domain::Channel;

    /// Idempotency marker for a bill on a channel.
    pub fn sent(bill_id: i64, channel: Channel) -> String {
        format!("sent:{}", crate::domain::dedup_key(bill_id, channel))
    }

    pub fn user_quiet(user_id: i64, channel: Channel) -> String {
        format!("user:quiet:{}:{}", user_id, channel.as_str())
    }

    pub fn user_schedule(user_id: i64, channel: Channel) -> String {
        format!("user:schedule:{}:{}", user_id, channel.as_str())
    }

    /// Deferred queue; `None` is the aggregate set.
    pub fn deferred(channel: Option<Channel>) -> String {
        match channel {
            Some(channel) => format!("queue:message:waiting:{}", channel.as_str()),
            None => "queue:message:waiting".to_string(),
        }
    }

    /// Scheduled queue; `None` is the aggregate set.
    pub fn scheduled(channel: Option<Channel>) -> String {
        match channel {
            Some(channel) => format!("scheduled:billing:{}", channel.as_str()),
            None => "scheduled:billing:all".to_string(),
        }
    }
}
