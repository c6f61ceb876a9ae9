//! Process configuration.
//!
//! Everything is read from environment variables (after `dotenvy` has loaded
//! any `.env` file), with defaults for every setting. Parsing goes through a
//! lookup function so tests never touch the real environment.

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::broker::Topics;
use crate::domain::preference::QuietWindow;
use crate::domain::{DEFAULT_MAX_RETRIES, QuietTimePolicy};
use crate::notification::{
    ConsumerConfig, EmailConfig, IdempotencyConfig, ResolverConfig, RetryConfig,
};
use crate::{Error, Result};

/// Which cadence the retry job runs at.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum RetryProfile {
    Production,
    Test,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub topics: Topics,
    pub dispatch_group: String,
    pub dead_letter_group: String,
    /// Bootstrap servers; only used with the `kafka` feature.
    pub kafka_brokers: Option<String>,
    /// Only used with the `redis` feature.
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub batch_size: u32,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub profile: RetryProfile,
    pub interval: Duration,
    pub test_interval: Duration,
    pub job: RetryConfig,
}

impl RetrySettings {
    /// Interval for the active profile.
    pub fn active_interval(&self) -> Duration {
        match self.profile {
            RetryProfile::Production => self.interval,
            RetryProfile::Test => self.test_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub interval: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// `RUST_LOG`-style filter; `None` uses the built-in default.
    pub filter: Option<String>,
    pub json: bool,
    /// Directory for daily rolling log files.
    pub dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database: DatabaseSettings,
    pub broker: BrokerSettings,
    pub relay: RelaySettings,
    pub consumer: ConsumerConfig,
    pub max_workers: usize,
    pub retry: RetrySettings,
    pub drain: DrainSettings,
    pub quiet_policy: QuietTimePolicy,
    pub idempotency: IdempotencyConfig,
    pub resolver: ResolverConfig,
    pub email: EmailConfig,
    /// Base64 AES-256 key; payloads are plaintext when absent.
    pub encryption_key: Option<String>,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        let quiet_window = QuietWindow::parse(
            &env.string("QUIET_START", "22:00"),
            &env.string("QUIET_END", "08:00"),
        )?;
        let tz_name = env.string("POLICY_TIMEZONE", "UTC");
        let timezone: Tz = tz_name
            .parse()
            .map_err(|e| Error::config(format!("invalid POLICY_TIMEZONE '{tz_name}': {e}")))?;

        let email_defaults = EmailConfig::default();
        Ok(Self {
            database: DatabaseSettings {
                url: env.string("DATABASE_URL", "sqlite:billing.db?mode=rwc"),
                max_connections: env.parse(
                    "DATABASE_MAX_CONNECTIONS",
                    crate::database::default_pool_size(),
                )?,
            },
            broker: BrokerSettings {
                topics: Topics::new(env.string("BROKER_MAIN_TOPIC", "billing.notification")),
                dispatch_group: env.string("BROKER_DISPATCH_GROUP", "billing-dispatch"),
                dead_letter_group: env.string("BROKER_DLT_GROUP", "billing-dead-letter"),
                kafka_brokers: env.optional("KAFKA_BROKERS"),
                redis_url: env.optional("REDIS_URL"),
            },
            relay: RelaySettings {
                batch_size: env.parse("OUTBOX_BATCH_SIZE", 100)?,
                poll_interval: env.millis("OUTBOX_POLL_MS", 1000)?,
            },
            consumer: ConsumerConfig {
                batch_size: env.parse("CONSUMER_BATCH_SIZE", 100)?,
                poll_timeout: env.millis("CONSUMER_POLL_MS", 500)?,
                ..ConsumerConfig::default()
            },
            max_workers: env.parse("CONSUMER_MAX_WORKERS", 16)?,
            retry: RetrySettings {
                profile: env.parse("RETRY_PROFILE", RetryProfile::Production)?,
                interval: env.secs("RETRY_INTERVAL_SECS", 300)?,
                test_interval: env.secs("RETRY_TEST_INTERVAL_SECS", 60)?,
                job: RetryConfig {
                    batch_size: env.parse("RETRY_BATCH_SIZE", 100)?,
                    max_retries: env.parse("RETRY_MAX_ATTEMPTS", DEFAULT_MAX_RETRIES)?,
                },
            },
            drain: DrainSettings {
                interval: env.secs("DRAIN_INTERVAL_SECS", 60)?,
                batch_size: env.parse("DRAIN_BATCH_SIZE", 100)?,
            },
            quiet_policy: QuietTimePolicy {
                window: quiet_window,
                timezone,
            },
            idempotency: IdempotencyConfig {
                sent_ttl: env.secs("SENT_MARKER_TTL_SECS", 7 * 24 * 3600)?,
                processing_ttl: env.secs("PROCESSING_MARKER_TTL_SECS", 600)?,
            },
            resolver: ResolverConfig {
                ttl: env.secs("PREFERENCE_CACHE_TTL_SECS", 3600)?,
                negative_ttl: env.secs("PREFERENCE_NEGATIVE_TTL_SECS", 300)?,
            },
            email: EmailConfig {
                latency: env.millis("EMAIL_LATENCY_MS", 200)?,
                first_attempt_failure_rate: env.rate(
                    "EMAIL_FIRST_ATTEMPT_FAILURE_RATE",
                    email_defaults.first_attempt_failure_rate,
                )?,
                retry_failure_rate: env
                    .rate("EMAIL_RETRY_FAILURE_RATE", email_defaults.retry_failure_rate)?,
                relay_url: env.optional("EMAIL_RELAY_URL"),
                ..email_defaults
            },
            encryption_key: env.optional("PAYLOAD_ENCRYPTION_KEY"),
            logging: LoggingConfig {
                filter: env.optional("RUST_LOG"),
                json: env
                    .optional("LOG_FORMAT")
                    .is_some_and(|f| f.eq_ignore_ascii_case("json")),
                dir: env.optional("LOG_DIR"),
            },
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::config(format!("invalid {key} '{raw}': {e}"))),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: u64) -> Result<Duration> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn rate(&self, key: &str, default: f64) -> Result<f64> {
        let rate: f64 = self.parse(key, default)?;
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::config(format!("{key} must be within 0.0..=1.0, got {rate}")));
        }
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<PipelineConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.broker.topics.main, "billing.notification");
        assert_eq!(config.broker.topics.dead_letter, "billing.notification.DLT");
        assert_eq!(config.retry.profile, RetryProfile::Production);
        assert_eq!(config.retry.active_interval(), Duration::from_secs(300));
        assert_eq!(config.retry.job.max_retries, 3);
        assert_eq!(config.quiet_policy, QuietTimePolicy::default());
        assert_eq!(config.idempotency.sent_ttl, Duration::from_secs(604_800));
        assert!(config.encryption_key.is_none());
        assert!(!config.logging.json);
    }

    #[test]
    fn test_test_profile_uses_short_interval() {
        let config = config(&[("RETRY_PROFILE", "TEST"), ("RETRY_TEST_INTERVAL_SECS", "5")]).unwrap();
        assert_eq!(config.retry.active_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("BROKER_MAIN_TOPIC", "bills"),
            ("QUIET_START", "21:30"),
            ("QUIET_END", "07:00"),
            ("POLICY_TIMEZONE", "Asia/Seoul"),
            ("CONSUMER_MAX_WORKERS", "4"),
            ("LOG_FORMAT", "JSON"),
            ("EMAIL_RELAY_URL", " "),
        ])
        .unwrap();
        assert_eq!(config.broker.topics.dead_letter, "bills.DLT");
        assert_eq!(config.quiet_policy.timezone, chrono_tz::Asia::Seoul);
        assert_eq!(config.max_workers, 4);
        assert!(config.logging.json);
        assert!(config.email.relay_url.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config(&[("OUTBOX_BATCH_SIZE", "lots")]),
            Err(Error::Configuration(_))
        ));
        assert!(config(&[("POLICY_TIMEZONE", "Mars/Olympus")]).is_err());
        assert!(config(&[("QUIET_START", "25:00")]).is_err());
        assert!(config(&[("EMAIL_RETRY_FAILURE_RATE", "1.5")]).is_err());
        assert!(config(&[("RETRY_PROFILE", "staging")]).is_err());
    }
}
