//! Per-user delivery preferences and the system-wide quiet-time policy.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::Channel;
use crate::{Error, Result};

/// A daily window during which a channel must not be used.
///
/// The window is half-open: `start` is quiet, `end` is already open. A window
/// whose start is after its end wraps midnight (e.g. 22:00 - 08:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `HH:MM` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self::new(parse_hhmm(start)?, parse_hhmm(end)?))
    }

    /// Whether a local wall-clock time falls inside the window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    /// Whether `instant` is quiet when read in `tz`.
    pub fn is_quiet_at(&self, instant: DateTime<Utc>, tz: Tz) -> bool {
        self.contains(instant.with_timezone(&tz).time())
    }

    /// The first instant strictly after `instant` at which the window closes.
    pub fn next_open_after(&self, instant: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = instant.with_timezone(&tz);
        let mut date = local.date_naive();
        // Two days always suffice; a third guards against DST gaps on the boundary.
        for _ in 0..3 {
            if let Some(candidate) = tz.from_local_datetime(&date.and_time(self.end)).earliest() {
                let candidate = candidate.with_timezone(&Utc);
                if candidate > instant {
                    return candidate;
                }
            }
            date = date.succ_opt().unwrap_or(date);
        }
        instant + Duration::days(1)
    }
}

/// User-chosen delivery slot inside the billing month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredSchedule {
    /// Day of month; values past the month's length clamp to its last day.
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl PreferredSchedule {
    /// Resolve the slot against a `YYYY-MM` billing month in `tz`.
    pub fn resolve(&self, billing_year_month: &str, tz: Tz) -> Result<DateTime<Utc>> {
        let (year, month) = parse_year_month(billing_year_month)?;
        let day = self.day.clamp(1, days_in_month(year, month));
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| Error::validation(format!("invalid date {year}-{month}-{day}")))?;
        let time = NaiveTime::from_hms_opt(self.hour.min(23), self.minute.min(59), 0)
            .ok_or_else(|| Error::validation("invalid preferred time"))?;

        let local = date.and_time(time);
        tz.from_local_datetime(&local)
            .earliest()
            // Nonexistent local time (DST gap): shift forward an hour.
            .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| Error::validation(format!("unrepresentable local time {local}")))
    }
}

/// Settings row maintained by the external settings API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChannelPreference {
    pub user_id: i64,
    pub channel: Channel,
    pub enabled: bool,
    pub priority: i32,
    pub quiet_start: Option<NaiveTime>,
    pub quiet_end: Option<NaiveTime>,
    pub preferred_day: Option<u32>,
    pub preferred_hour: Option<u32>,
    pub preferred_minute: Option<u32>,
}

impl UserChannelPreference {
    /// The user's own quiet window, if both bounds are set.
    pub fn quiet_window(&self) -> Option<QuietWindow> {
        match (self.quiet_start, self.quiet_end) {
            (Some(start), Some(end)) => Some(QuietWindow::new(start, end)),
            _ => None,
        }
    }

    /// The user's preferred delivery slot, if a day is set.
    pub fn preferred_schedule(&self) -> Option<PreferredSchedule> {
        self.preferred_day.map(|day| PreferredSchedule {
            day,
            hour: self.preferred_hour.unwrap_or(9),
            minute: self.preferred_minute.unwrap_or(0),
        })
    }
}

/// System-wide quiet-time policy applied when a user has no window of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietTimePolicy {
    pub window: QuietWindow,
    pub timezone: Tz,
}

impl Default for QuietTimePolicy {
    fn default() -> Self {
        Self {
            window: QuietWindow::new(
                NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
                NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            ),
            timezone: Tz::UTC,
        }
    }
}

/// Parse an `HH:MM` (or `HH:MM:SS`) string.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| Error::validation(format!("invalid time '{s}': {e}")))
}

/// Parse a `YYYY-MM` (or `YYYYMM`) billing month.
pub fn parse_year_month(s: &str) -> Result<(i32, u32)> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 6 {
        return Err(Error::validation(format!("invalid billing month '{s}'")));
    }
    let year: i32 = digits[..4]
        .parse()
        .map_err(|_| Error::validation(format!("invalid billing month '{s}'")))?;
    let month: u32 = digits[4..]
        .parse()
        .map_err(|_| Error::validation(format!("invalid billing month '{s}'")))?;
    if !(1..=12).contains(&month) {
        return Err(Error::validation(format!("invalid billing month '{s}'")));
    }
    Ok((year, month))
}

/// Number of days in the given month.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_overnight_window() {
        let window = QuietWindow::new(hm(22, 0), hm(8, 0));
        assert!(window.contains(hm(23, 0)));
        assert!(window.contains(hm(22, 0)));
        assert!(window.contains(hm(3, 30)));
        assert!(!window.contains(hm(8, 0)));
        assert!(!window.contains(hm(12, 0)));
    }

    #[test]
    fn test_daytime_window() {
        let window = QuietWindow::new(hm(12, 0), hm(13, 0));
        assert!(window.contains(hm(12, 30)));
        assert!(!window.contains(hm(13, 0)));
        assert!(!window.contains(hm(11, 59)));
    }

    #[test]
    fn test_empty_window_never_quiet() {
        let window = QuietWindow::new(hm(9, 0), hm(9, 0));
        assert!(!window.contains(hm(9, 0)));
    }

    #[test]
    fn test_next_open_after_crosses_midnight() {
        let window = QuietWindow::new(hm(22, 0), hm(8, 0));
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        assert_eq!(
            window.next_open_after(at, Tz::UTC),
            Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap()
        );

        let early = Utc.with_ymd_and_hms(2024, 3, 2, 3, 0, 0).unwrap();
        assert_eq!(
            window.next_open_after(early, Tz::UTC),
            Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_open_respects_timezone() {
        let window = QuietWindow::new(hm(22, 0), hm(8, 0));
        // 23:00 in Seoul is 14:00 UTC.
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        assert!(window.is_quiet_at(at, chrono_tz::Asia::Seoul));
        // Opens at 08:00 KST = 23:00 UTC.
        assert_eq!(
            window.next_open_after(at, chrono_tz::Asia::Seoul),
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_preferred_day_clamped_to_february() {
        let schedule = PreferredSchedule {
            day: 31,
            hour: 10,
            minute: 30,
        };
        assert_eq!(
            schedule.resolve("2023-02", Tz::UTC).unwrap(),
            Utc.with_ymd_and_hms(2023, 2, 28, 10, 30, 0).unwrap()
        );
        // leap year
        assert_eq!(
            schedule.resolve("2024-02", Tz::UTC).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 10, 30, 0).unwrap()
        );
        assert_eq!(
            schedule.resolve("2024-04", Tz::UTC).unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 30, 10, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_year_month() {
        assert_eq!(parse_year_month("2024-02").unwrap(), (2024, 2));
        assert_eq!(parse_year_month("202412").unwrap(), (2024, 12));
        assert!(parse_year_month("2024-13").is_err());
        assert!(parse_year_month("24-1").is_err());
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 11), 30);
    }

    #[test]
    fn test_preference_helpers() {
        let pref = UserChannelPreference {
            user_id: 1,
            channel: Channel::Email,
            enabled: true,
            priority: 0,
            quiet_start: Some(hm(21, 0)),
            quiet_end: None,
            preferred_day: Some(5),
            preferred_hour: None,
            preferred_minute: None,
        };
        assert!(pref.quiet_window().is_none());
        assert_eq!(
            pref.preferred_schedule(),
            Some(PreferredSchedule {
                day: 5,
                hour: 9,
                minute: 0
            })
        );
    }
}
