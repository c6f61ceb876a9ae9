//! Timestamp helpers for the database layer.
//!
//! We store timestamps as `INTEGER` Unix epoch milliseconds (UTC) in SQLite.

use chrono::{DateTime, TimeZone, Utc};

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert an optional `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn opt_datetime_to_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(datetime_to_ms)
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Values outside chrono's supported range clamp to the nearest representable timestamp.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_round_trip_preserves_millis() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 29, 10, 30, 0).unwrap();
        assert_eq!(ms_to_datetime(datetime_to_ms(dt)), dt);
    }

    #[test]
    fn test_out_of_range_clamps() {
        assert_eq!(ms_to_datetime(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(ms_to_datetime(i64::MIN), DateTime::<Utc>::MIN_UTC);
    }
}
