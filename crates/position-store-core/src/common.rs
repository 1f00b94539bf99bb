//! Shared value types used by both the hot store and the archive.
//!
//! Both stores persist timestamps as UTC microseconds since the Unix epoch,
//! so the conversion helpers live here rather than in either backend.

pub mod time_range;

pub use time_range::{TimeRange, TimeRangeError, from_micros, to_micros};
