//! Nanosecond wall-clock timestamps and time-range helpers shared by the
//! segment store, the listener, and the timeline planner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in time with nanosecond precision, measured since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds since Unix epoch
    nanos: i64,
}

impl Timestamp {
    /// Create a timestamp from nanoseconds since Unix epoch
    pub fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    /// Create a timestamp from milliseconds since Unix epoch
    pub fn from_millis(millis: i64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    /// Create a timestamp from seconds since Unix epoch
    pub fn from_secs(secs: i64) -> Self {
        Self {
            nanos: secs * 1_000_000_000,
        }
    }

    /// Get current timestamp
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            nanos: now.timestamp_nanos_opt().unwrap_or(0),
        }
    }

    /// Get nanoseconds since Unix epoch
    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }

    /// Get milliseconds since Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.nanos / 1_000_000
    }

    /// Get seconds since Unix epoch
    pub fn as_secs(&self) -> i64 {
        self.nanos / 1_000_000_000
    }

    /// Convert to chrono DateTime
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.as_secs(), (self.nanos.rem_euclid(1_000_000_000)) as u32)
            .unwrap_or_else(Utc::now)
    }

    /// Add a duration in nanoseconds
    pub fn add_nanos(&self, nanos: i64) -> Self {
        Self {
            nanos: self.nanos + nanos,
        }
    }

    /// The half-open bucket `[floor(self/duration)*duration, +duration)` this
    /// timestamp falls into, for a given bucket duration in nanoseconds.
    /// Mirrors `spec.md` §4.2 step 1.
    pub fn bucket_start(&self, bucket_duration_nanos: i64) -> Self {
        debug_assert!(bucket_duration_nanos > 0);
        let floor = self.nanos.div_euclid(bucket_duration_nanos) * bucket_duration_nanos;
        Self { nanos: floor }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            nanos: dt.timestamp_nanos_opt().unwrap_or(0),
        }
    }
}

/// A half-open time range `[start, end)` used for query windows and status
/// segments. `end` is `None` for an open-ended ("still ongoing") range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Option<Timestamp>,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Option<Timestamp>) -> Self {
        Self { start, end }
    }

    pub fn closed(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn open(start: Timestamp) -> Self {
        Self { start, end: None }
    }

    /// Whether `ts` falls within `[start, end)` (or `[start, +inf)` if open).
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && self.end.map(|e| ts < e).unwrap_or(true)
    }

    /// Whether this range intersects `other` at all.
    pub fn intersects(&self, other: &TimeRange) -> bool {
        let self_end = self.end.unwrap_or(Timestamp::from_nanos(i64::MAX));
        let other_end = other.end.unwrap_or(Timestamp::from_nanos(i64::MAX));
        self.start < other_end && other.start < self_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_creation() {
        let ts = Timestamp::now();
        assert!(ts.as_nanos() > 0);

        let ts2 = Timestamp::from_secs(1000);
        assert_eq!(ts2.as_secs(), 1000);
        assert_eq!(ts2.as_millis(), 1_000_000);
    }

    #[test]
    fn bucket_start_floors_to_duration() {
        let hour = 3_600_000_000_000i64;
        let ts = Timestamp::from_secs(3_599);
        assert_eq!(ts.bucket_start(hour), Timestamp::from_nanos(0));

        let ts2 = Timestamp::from_secs(3_601);
        assert_eq!(ts2.bucket_start(hour), Timestamp::from_nanos(hour));
    }

    #[test]
    fn time_range_contains_and_intersects() {
        let range = TimeRange::closed(Timestamp::from_secs(1000), Timestamp::from_secs(2000));
        assert!(range.contains(Timestamp::from_secs(1500)));
        assert!(!range.contains(Timestamp::from_secs(500)));
        assert!(!range.contains(Timestamp::from_secs(2500)));

        let open = TimeRange::open(Timestamp::from_secs(1000));
        assert!(open.contains(Timestamp::from_secs(10_000)));

        let other = TimeRange::closed(Timestamp::from_secs(1800), Timestamp::from_secs(2500));
        assert!(range.intersects(&other));

        let disjoint = TimeRange::closed(Timestamp::from_secs(3000), Timestamp::from_secs(4000));
        assert!(!range.intersects(&disjoint));
    }
}
