//! Time source abstraction.
//!
//! Quiet-time decisions, delay-queue scores and cache TTLs all read the
//! current instant through [`Clock`] so tests can pin the time of day.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Source of the current UTC instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write() = instant;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Shared clock handle passed to components at construction.
pub type SharedClock = Arc<dyn Clock>;

/// Convenience constructor for the wall clock.
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::hours(9));
        assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap());

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
