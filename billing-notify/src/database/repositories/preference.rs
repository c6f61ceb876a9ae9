//! User channel preference repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::UserChannelPreferenceDbModel;
use crate::database::time::now_ms;
use crate::domain::{Channel, UserChannelPreference};

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn find(&self, user_id: i64, channel: Channel) -> Result<Option<UserChannelPreference>>;
    async fn upsert(&self, preference: &UserChannelPreference) -> Result<()>;
    async fn delete(&self, user_id: i64, channel: Channel) -> Result<()>;
}

pub struct SqlxPreferenceRepository {
    pool: SqlitePool,
}

impl SqlxPreferenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceRepository for SqlxPreferenceRepository {
    async fn find(&self, user_id: i64, channel: Channel) -> Result<Option<UserChannelPreference>> {
        sqlx::query_as::<_, UserChannelPreferenceDbModel>(
            "SELECT * FROM user_channel_preference WHERE user_id = ? AND channel = ?",
        )
        .bind(user_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(UserChannelPreference::try_from)
        .transpose()
    }

    async fn upsert(&self, preference: &UserChannelPreference) -> Result<()> {
        let row = UserChannelPreferenceDbModel::from_domain(preference, now_ms());
        sqlx::query(
            r#"
            INSERT INTO user_channel_preference (
                user_id, channel, enabled, priority, quiet_start, quiet_end,
                preferred_day, preferred_hour, preferred_minute, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, channel) DO UPDATE SET
                enabled = excluded.enabled,
                priority = excluded.priority,
                quiet_start = excluded.quiet_start,
                quiet_end = excluded.quiet_end,
                preferred_day = excluded.preferred_day,
                preferred_hour = excluded.preferred_hour,
                preferred_minute = excluded.preferred_minute,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.user_id)
        .bind(&row.channel)
        .bind(row.enabled)
        .bind(row.priority)
        .bind(&row.quiet_start)
        .bind(&row.quiet_end)
        .bind(row.preferred_day)
        .bind(row.preferred_hour)
        .bind(row.preferred_minute)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, user_id: i64, channel: Channel) -> Result<()> {
        sqlx::query("DELETE FROM user_channel_preference WHERE user_id = ? AND channel = ?")
            .bind(user_id)
            .bind(channel.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use chrono::NaiveTime;

    #[tokio::test]
    async fn test_preference_upsert_and_find() {
        let repo = SqlxPreferenceRepository::new(init_memory_pool().await.unwrap());
        assert!(repo.find(1, Channel::Email).await.unwrap().is_none());

        let mut pref = UserChannelPreference {
            user_id: 1,
            channel: Channel::Email,
            enabled: true,
            priority: 1,
            quiet_start: NaiveTime::from_hms_opt(21, 30, 0),
            quiet_end: NaiveTime::from_hms_opt(7, 0, 0),
            preferred_day: Some(31),
            preferred_hour: Some(10),
            preferred_minute: None,
        };
        repo.upsert(&pref).await.unwrap();
        assert_eq!(repo.find(1, Channel::Email).await.unwrap(), Some(pref.clone()));

        pref.preferred_day = None;
        repo.upsert(&pref).await.unwrap();
        let stored = repo.find(1, Channel::Email).await.unwrap().unwrap();
        assert_eq!(stored.preferred_day, None);

        repo.delete(1, Channel::Email).await.unwrap();
        assert!(repo.find(1, Channel::Email).await.unwrap().is_none());
    }
}
