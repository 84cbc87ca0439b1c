//! Period bounds in the library's local time
//!
//! The live metric counts events since local midnight. Batch windows
//! (last 7 days, month-to-date, year-to-date) are derived from the same
//! clock so both sides agree on where a day starts.

use crate::source::TimeRange;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use std::sync::Arc;

pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// One local calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub date: NaiveDate,
    pub range: TimeRange,
}

#[derive(Clone)]
pub struct PeriodClock {
    offset: FixedOffset,
    now_fn: NowFn,
}

impl PeriodClock {
    /// Clock on system time
    pub fn new(offset: FixedOffset) -> Self {
        Self::with_now_fn(offset, Arc::new(Utc::now))
    }

    /// Clock with a custom time source (deterministic tests)
    pub fn with_now_fn(offset: FixedOffset, now_fn: NowFn) -> Self {
        Self { offset, now_fn }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_fn)()
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// UTC instant of local midnight starting `date`
    pub fn start_of(&self, date: NaiveDate) -> DateTime<Utc> {
        let local_midnight = date.and_time(NaiveTime::default());
        let utc_naive = local_midnight - Duration::seconds(self.offset.local_minus_utc() as i64);
        Utc.from_utc_datetime(&utc_naive)
    }

    /// The local day containing `at`
    pub fn period_at(&self, at: DateTime<Utc>) -> Period {
        let date = self.local_date(at);
        Period {
            date,
            range: TimeRange::new(self.start_of(date), self.start_of(date + Duration::days(1))),
        }
    }

    pub fn today(&self) -> Period {
        self.period_at(self.now())
    }

    /// The last `days` local days, today included
    pub fn last_days(&self, today: NaiveDate, days: i64) -> TimeRange {
        let first = today - Duration::days(days.max(1) - 1);
        TimeRange::new(self.start_of(first), self.start_of(today + Duration::days(1)))
    }

    /// From the first of the current month through the end of today
    pub fn month_to_date(&self, today: NaiveDate) -> TimeRange {
        let first = today.with_day(1).unwrap_or(today);
        TimeRange::new(self.start_of(first), self.start_of(today + Duration::days(1)))
    }

    /// From January 1st `years_back` years ago through the end of today
    pub fn years_to_date(&self, today: NaiveDate, years_back: i32) -> TimeRange {
        let first = NaiveDate::from_yo_opt(today.year() - years_back, 1).unwrap_or(today);
        TimeRange::new(self.start_of(first), self.start_of(today + Duration::days(1)))
    }
}

impl std::fmt::Debug for PeriodClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodClock").field("offset", &self.offset).finish()
    }
}
