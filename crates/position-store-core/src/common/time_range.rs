//! Closed time ranges and the microsecond timestamp encoding.
//!
//! All range filters in this crate are *inclusive* on both ends, matching the
//! `[start, end]` semantics the query surface exposes. Timestamps are stored
//! with microsecond precision; bounds carrying sub-microsecond components are
//! rounded inward so a range never admits a row that lies outside it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Errors produced while building ranges or decoding stored timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum TimeRangeError {
    /// The lower bound lies after the upper bound.
    #[snafu(display("Invalid time range: start={start}, end={end} (expect start <= end)"))]
    Inverted {
        /// Inclusive lower bound supplied by the caller.
        start: DateTime<Utc>,
        /// Inclusive upper bound supplied by the caller.
        end: DateTime<Utc>,
    },

    /// A stored microsecond value cannot be represented as a `DateTime<Utc>`.
    #[snafu(display("Stored timestamp {micros}us is outside the representable range"))]
    OutOfRange {
        /// The raw microsecond value read from storage.
        micros: i64,
    },
}

/// Encode a timestamp as microseconds since the Unix epoch (floor).
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Decode microseconds since the Unix epoch into a `DateTime<Utc>`.
pub fn from_micros(micros: i64) -> Result<DateTime<Utc>, TimeRangeError> {
    DateTime::<Utc>::from_timestamp_micros(micros).context(OutOfRangeSnafu { micros })
}

/// Microsecond encoding rounded up, used for inclusive lower bounds.
fn ceil_micros(ts: DateTime<Utc>) -> i64 {
    let floor = ts.timestamp_micros();
    if ts.timestamp_subsec_nanos() % 1_000 == 0 {
        floor
    } else {
        floor.saturating_add(1)
    }
}

/// An inclusive `[start, end]` interval of UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    /// Build a range, rejecting `start > end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TimeRangeError> {
        ensure!(start <= end, InvertedSnafu { start, end });
        Ok(Self { start, end })
    }

    /// A degenerate range holding exactly one instant.
    pub fn instant(ts: DateTime<Utc>) -> Self {
        Self { start: ts, end: ts }
    }

    /// Build a range from already-encoded microsecond bounds.
    pub(crate) fn from_micros_bounds(start: i64, end: i64) -> Result<Self, TimeRangeError> {
        Self::new(from_micros(start)?, from_micros(end)?)
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Inclusive upper bound.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Length of the interval.
    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// True when `ts` lies inside the interval.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// True when the two closed intervals share at least one instant.
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// The overlapping part of two ranges, if any.
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.intersects(other) {
            return None;
        }
        Some(TimeRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// Inclusive lower bound in storage microseconds.
    pub(crate) fn start_micros(&self) -> i64 {
        ceil_micros(self.start)
    }

    /// Inclusive upper bound in storage microseconds.
    pub(crate) fn end_micros(&self) -> i64 {
        to_micros(self.end)
    }
}
