//! Day bucketing: `DayKey`, the pure `day_key` function, and injectable clocks.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, Offset, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Calendar date bucket in `YYYY-MM-DD` form.
///
/// Lexicographic order of the string form equals chronological order, so the
/// derived `Ord` is the calendar order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayKey(String);

impl DayKey {
    /// Parse a strict `YYYY-MM-DD` key. Anything else (including valid dates
    /// in other spellings, like `2024-1-01`) is rejected.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let date = NaiveDate::parse_from_str(raw, DAY_FORMAT).ok()?;
        let key = Self::from_date(date);
        (key.0 == raw).then_some(key)
    }

    #[must_use]
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.format(DAY_FORMAT).to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DayKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid day key {value:?}"))
    }
}

impl From<DayKey> for String {
    fn from(value: DayKey) -> Self {
        value.0
    }
}

/// The single place where an instant becomes a day bucket.
#[must_use]
pub fn day_key(instant: DateTime<Utc>, offset: FixedOffset) -> DayKey {
    DayKey::from_date(instant.with_timezone(&offset).date_naive())
}

/// Time source shared by the aggregator, batcher and scheduler.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// UTC offset in effect at `instant` for day bucketing.
    fn offset_at(&self, instant: DateTime<Utc>) -> FixedOffset;

    fn today(&self) -> DayKey {
        let now = self.now();
        day_key(now, self.offset_at(now))
    }
}

/// Wall clock in the process-local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset_at(&self, instant: DateTime<Utc>) -> FixedOffset {
        Local.offset_from_utc_datetime(&instant.naive_utc()).fix()
    }
}

/// Settable clock for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    /// Manual clock bucketing days in UTC.
    #[must_use]
    pub fn utc(now: DateTime<Utc>) -> Self {
        Self::new(now, Utc.fix())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn offset_at(&self, _instant: DateTime<Utc>) -> FixedOffset {
        self.offset
    }
}
