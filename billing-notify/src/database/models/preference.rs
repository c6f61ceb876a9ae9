//! User channel preference database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::preference::parse_hhmm;
use crate::domain::{Channel, UserChannelPreference};
use crate::{Error, Result};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserChannelPreferenceDbModel {
    pub user_id: i64,
    pub channel: String,
    pub enabled: bool,
    pub priority: i64,
    /// `HH:MM`
    pub quiet_start: Option<String>,
    /// `HH:MM`
    pub quiet_end: Option<String>,
    pub preferred_day: Option<i64>,
    pub preferred_hour: Option<i64>,
    pub preferred_minute: Option<i64>,
    pub updated_at: i64,
}

impl UserChannelPreferenceDbModel {
    pub fn from_domain(pref: &UserChannelPreference, updated_at: i64) -> Self {
        Self {
            user_id: pref.user_id,
            channel: pref.channel.as_str().to_string(),
            enabled: pref.enabled,
            priority: i64::from(pref.priority),
            quiet_start: pref.quiet_start.map(|t| t.format("%H:%M").to_string()),
            quiet_end: pref.quiet_end.map(|t| t.format("%H:%M").to_string()),
            preferred_day: pref.preferred_day.map(i64::from),
            preferred_hour: pref.preferred_hour.map(i64::from),
            preferred_minute: pref.preferred_minute.map(i64::from),
            updated_at,
        }
    }
}

fn opt_u32(value: Option<i64>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

impl TryFrom<UserChannelPreferenceDbModel> for UserChannelPreference {
    type Error = Error;

    fn try_from(row: UserChannelPreferenceDbModel) -> Result<Self> {
        let channel = Channel::parse(&row.channel)
            .ok_or_else(|| Error::Database(format!("unknown channel '{}'", row.channel)))?;

        Ok(Self {
            user_id: row.user_id,
            channel,
            enabled: row.enabled,
            priority: i32::try_from(row.priority).unwrap_or_default(),
            quiet_start: row.quiet_start.as_deref().map(parse_hhmm).transpose()?,
            quiet_end: row.quiet_end.as_deref().map(parse_hhmm).transpose()?,
            preferred_day: opt_u32(row.preferred_day),
            preferred_hour: opt_u32(row.preferred_hour),
            preferred_minute: opt_u32(row.preferred_minute),
        })
    }
}
