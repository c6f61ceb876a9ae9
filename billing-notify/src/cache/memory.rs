//! In-process cache store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{CacheStore, ScoredMember};
use crate::clock::SharedClock;
use crate::{Error, Result};

#[derive(Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl ValueEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn range(&self, min: i64, max: i64) -> impl Iterator<Item = &(i64, String)> {
        self.ordered
            .range((min, String::new())..)
            .take_while(move |(score, _)| *score <= max)
    }
}

/// DashMap-backed store with clock-driven expiry.
///
/// Can be switched to "unavailable" to exercise fallback paths.
#[derive(Clone)]
pub struct InMemoryCacheStore {
    values: Arc<DashMap<String, ValueEntry>>,
    sets: Arc<DashMap<String, SortedSet>>,
    clock: SharedClock,
    available: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl InMemoryCacheStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            values: Arc::new(DashMap::new()),
            sets: Arc::new(DashMap::new()),
            clock,
            available: Arc::new(AtomicBool::new(true)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of string writes accepted so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::cache("cache store unavailable"))
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| self.clock.now() + ttl)
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let now = self.clock.now();
        let Some(entry) = self.values.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            drop(entry);
            self.values.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: self.expiry(ttl),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        let expires_at = self.expiry(ttl);
        for (key, value) in entries {
            self.values.insert(
                key.clone(),
                ValueEntry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        self.writes.fetch_add(entries.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.values.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        self.check()?;
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(score, member);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        self.check()?;
        let Some(set) = self.sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .range(min, max)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64> {
        self.check()?;
        let Some(mut set) = self.sets.get_mut(key) else {
            return Ok(0);
        };
        Ok(members.iter().filter(|m| set.remove(m)).count() as u64)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.check()?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.scores.len() as u64)
            .unwrap_or(0))
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64> {
        self.check()?;
        Ok(self
            .sets
            .get(key)
            .map(|set| set.range(min, max).count() as u64)
            .unwrap_or(0))
    }
}
