//! Cache-aside resolution of per-user quiet time and preferred schedule.
//!
//! Each lookup reads `user:quiet:*` / `user:schedule:*` first. On a miss the
//! preference row is loaded and cached, or a `NONE` sentinel is cached when
//! the user has nothing set. Any failure degrades: cache down means a direct
//! store read, store down means the system default. Resolution never fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::cache::{SharedCacheStore, keys};
use crate::database::repositories::PreferenceRepository;
use crate::domain::{Channel, PreferredSchedule, QuietTimePolicy, UserChannelPreference};

const NONE_SENTINEL: &str = "NONE";

/// Where a quiet-time decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum QuietSource {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietDecision {
    pub is_quiet: bool,
    pub source: QuietSource,
    /// When the applicable window next opens; set only when quiet.
    pub release_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_secs(300),
        }
    }
}

enum Cached<T> {
    Hit(Option<T>),
    Miss,
    Unavailable,
}

pub struct PreferenceResolver {
    cache: SharedCacheStore,
    preferences: Arc<dyn PreferenceRepository>,
    policy: QuietTimePolicy,
    config: ResolverConfig,
}

impl PreferenceResolver {
    pub fn new(
        cache: SharedCacheStore,
        preferences: Arc<dyn PreferenceRepository>,
        policy: QuietTimePolicy,
        config: ResolverConfig,
    ) -> Self {
        Self {
            cache,
            preferences,
            policy,
            config,
        }
    }

    pub fn policy(&self) -> &QuietTimePolicy {
        &self.policy
    }

    pub async fn resolve_quiet_time(
        &self,
        user_id: i64,
        channel: Channel,
        instant: DateTime<Utc>,
    ) -> QuietDecision {
        let key = keys::user_quiet(user_id, channel);
        let user_window = self
            .cached_or_load(&key, user_id, channel, |pref| pref.quiet_window())
            .await;

        let (window, source) = match user_window {
            Some(window) => (window, QuietSource::User),
            None => (self.policy.window, QuietSource::System),
        };

        let tz = self.policy.timezone;
        let is_quiet = window.is_quiet_at(instant, tz);
        QuietDecision {
            is_quiet,
            source,
            release_at: is_quiet.then(|| window.next_open_after(instant, tz)),
        }
    }

    /// The user's preferred instant for `billing_year_month`, if any.
    pub async fn resolve_scheduled_time(
        &self,
        user_id: i64,
        channel: Channel,
        billing_year_month: &str,
    ) -> Option<DateTime<Utc>> {
        let key = keys::user_schedule(user_id, channel);
        let schedule: Option<PreferredSchedule> = self
            .cached_or_load(&key, user_id, channel, |pref| pref.preferred_schedule())
            .await;

        let schedule = schedule?;
        match schedule.resolve(billing_year_month, self.policy.timezone) {
            Ok(instant) => Some(instant),
            Err(e) => {
                warn!(user_id, %channel, "Ignoring preferred schedule: {}", e);
                None
            }
        }
    }

    /// Drop cached entries after the settings API changes a preference.
    pub async fn invalidate(&self, user_id: i64, channel: Channel) {
        for key in [
            keys::user_quiet(user_id, channel),
            keys::user_schedule(user_id, channel),
        ] {
            if let Err(e) = self.cache.delete(&key).await {
                warn!(key = %key, "Failed to invalidate preference cache: {}", e);
            }
        }
    }

    async fn cached_or_load<T, F>(
        &self,
        key: &str,
        user_id: i64,
        channel: Channel,
        extract: F,
    ) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&UserChannelPreference) -> Option<T>,
    {
        let cached = self.read_cache::<T>(key).await;
        if let Cached::Hit(value) = cached {
            return value;
        }

        let value = match self.preferences.find(user_id, channel).await {
            Ok(pref) => pref.as_ref().and_then(&extract),
            Err(e) => {
                warn!(user_id, %channel, "Preference store unavailable, using system default: {}", e);
                return None;
            }
        };

        if matches!(cached, Cached::Miss) {
            self.write_cache(key, value.as_ref()).await;
        }
        value
    }

    async fn read_cache<T: DeserializeOwned>(&self, key: &str) -> Cached<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) if raw == NONE_SENTINEL => Cached::Hit(None),
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Cached::Hit(Some(value)),
                Err(e) => {
                    debug!(key = %key, "Discarding unreadable cache entry: {}", e);
                    Cached::Miss
                }
            },
            Ok(None) => Cached::Miss,
            Err(e) => {
                warn!(key = %key, "Preference cache unavailable: {}", e);
                Cached::Unavailable
            }
        }
    }

    async fn write_cache<T: Serialize>(&self, key: &str, value: Option<&T>) {
        let (raw, ttl) = match value.map(serde_json::to_string) {
            Some(Ok(json)) => (json, self.config.ttl),
            Some(Err(e)) => {
                warn!(key = %key, "Failed to encode preference for cache: {}", e);
                return;
            }
            None => (NONE_SENTINEL.to_string(), self.config.negative_ttl),
        };
        if let Err(e) = self.cache.set(key, &raw, Some(ttl)).await {
            debug!(key = %key, "Failed to populate preference cache: {}", e);
        }
    }
}
