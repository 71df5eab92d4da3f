use std::sync::Mutex;

use chrono::{FixedOffset, NaiveDateTime, Offset, TimeDelta, Utc};

/// The server's canonical clock. Every refund and bookability decision reads it,
/// never a client-supplied time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock shifted into the schedule's local time.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn utc() -> Self {
        Self::with_offset_minutes(0)
    }

    /// Out-of-range offsets fall back to UTC.
    pub fn with_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn manual_clock_advances() {
        let start = NaiveDate::from_ymd_opt(2024, 6, 9)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::hours(3));
        assert_eq!(clock.now(), start + TimeDelta::hours(3));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn system_clock_applies_offset() {
        let utc = SystemClock::utc().now();
        let plus_two = SystemClock::with_offset_minutes(120).now();
        let diff = plus_two - utc;
        assert!(diff >= TimeDelta::minutes(119) && diff <= TimeDelta::minutes(121));
    }
}
