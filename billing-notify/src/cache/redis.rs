//! Redis-backed cache store (fred).

use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Pool;
use fred::prelude::*;
use fred::types::{Builder, Expiration};

use super::{CacheStore, ScoredMember};
use crate::{Error, Result};

fn cache_err(e: fred::error::Error) -> Error {
    Error::cache(e.to_string())
}

pub struct RedisCacheStore {
    pool: Pool,
}

impl RedisCacheStore {
    pub async fn connect(redis_url: &str, pool_size: usize) -> Result<Self> {
        let config = Config::from_url(redis_url).map_err(cache_err)?;

        let pool = Builder::from_config(config)
            .with_connection_config(|cfg| {
                cfg.connection_timeout = Duration::from_secs(5);
                cfg.internal_command_timeout = Duration::from_secs(5);
                cfg.max_command_attempts = 3;
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 5_000, 2))
            .build_pool(pool_size.max(1))
            .map_err(cache_err)?;

        pool.init().await.map_err(cache_err)?;
        tracing::info!("Connected to Redis cache store with {} clients", pool_size.max(1));

        Ok(Self { pool })
    }

    fn expiration(ttl: Option<Duration>) -> Option<Expiration> {
        ttl.map(|d| {
            if d < Duration::from_secs(1) {
                Expiration::PX(d.as_millis() as i64)
            } else {
                Expiration::EX(d.as_secs() as i64)
            }
        })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.pool.get(key).await.map_err(cache_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.pool
            .set::<(), _, _>(key, value, Self::expiration(ttl), None, false)
            .await
            .map_err(cache_err)
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let pipeline = self.pool.next().pipeline();
        for (key, value) in entries {
            pipeline
                .set::<(), _, _>(key.as_str(), value.as_str(), Self::expiration(ttl), None, false)
                .await
                .map_err(cache_err)?;
        }
        pipeline.all::<Vec<Value>>().await.map_err(cache_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.pool.del::<i64, _>(key).await.map_err(cache_err)?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        self.pool
            .zadd::<i64, _, _>(key, None, None, false, false, (score as f64, member))
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        let limit = limit.map(|count| (0_i64, count as i64));
        let members: Vec<(String, f64)> = self
            .pool
            .zrangebyscore(key, min as f64, max as f64, true, limit)
            .await
            .map_err(cache_err)?;
        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let removed: i64 = self
            .pool
            .zrem(key, members.to_vec())
            .await
            .map_err(cache_err)?;
        Ok(removed.max(0) as u64)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let count: i64 = self.pool.zcard(key).await.map_err(cache_err)?;
        Ok(count.max(0) as u64)
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64> {
        let count: i64 = self
            .pool
            .zcount(key, min as f64, max as f64)
            .await
            .map_err(cache_err)?;
        Ok(count.max(0) as u64)
    }
}
