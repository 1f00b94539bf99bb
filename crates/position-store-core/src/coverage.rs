//! In-memory archive coverage and gap analysis over microsecond timestamps.
//!
//! This module is intentionally small and generic:
//!
//! - It stores a normalized set of closed `i64` intervals (sorted, disjoint,
//!   and never adjacent).
//! - It does not know about series, partitions, or storage.
//! - Callers map their own domain (archive partitions) into closed intervals
//!   of storage microseconds.
//!
//! Timestamps are signed so instants before 1970 are first-class members of
//! the domain.
//!
//! ```
//! use position_store_core::coverage::Coverage;
//!
//! let cov = Coverage::from_intervals([0..=9, 20..=29]);
//!
//! assert_eq!(cov.missing_runs(0..=29), vec![10..=19]);
//! assert!(cov.covers(20..=29));
//! ```

use std::ops::RangeInclusive;

/// Closed interval of storage microseconds.
pub type MicrosRange = RangeInclusive<i64>;

/// Normalized union of closed intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    intervals: Vec<MicrosRange>,
}

impl Coverage {
    /// Build coverage from arbitrary (possibly overlapping) intervals.
    ///
    /// Empty intervals (`start > end`) are ignored.
    pub fn from_intervals<I>(intervals: I) -> Self
    where
        I: IntoIterator<Item = MicrosRange>,
    {
        let mut ranges: Vec<MicrosRange> = intervals
            .into_iter()
            .filter(|r| r.start() <= r.end())
            .collect();
        ranges.sort_by_key(|r| *r.start());

        let mut merged: Vec<MicrosRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                // Adjacent intervals merge as well: the domain is discrete.
                Some(last) if i128::from(*range.start()) <= i128::from(*last.end()) + 1 => {
                    if range.end() > last.end() {
                        *last = *last.start()..=*range.end();
                    }
                }
                _ => merged.push(range),
            }
        }
        Self { intervals: merged }
    }

    /// Borrow the normalized intervals in ascending order.
    pub fn intervals(&self) -> &[MicrosRange] {
        &self.intervals
    }

    /// True when no instant is covered.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Sub-ranges of `expected` that are covered, ascending.
    pub fn covered_runs(&self, expected: MicrosRange) -> Vec<MicrosRange> {
        let (lo, hi) = (*expected.start(), *expected.end());
        if lo > hi {
            return Vec::new();
        }
        self.intervals
            .iter()
            .filter(|r| *r.start() <= hi && lo <= *r.end())
            .map(|r| (*r.start()).max(lo)..=(*r.end()).min(hi))
            .collect()
    }

    /// Sub-ranges of `expected` that are not covered, ascending.
    ///
    /// Each returned range is inclusive.
    pub fn missing_runs(&self, expected: MicrosRange) -> Vec<MicrosRange> {
        let (lo, hi) = (*expected.start(), *expected.end());
        if lo > hi {
            return Vec::new();
        }

        let mut missing = Vec::new();
        let mut cursor = i128::from(lo);
        for run in self.covered_runs(expected) {
            let start = i128::from(*run.start());
            if start > cursor {
                missing.push(cursor as i64..=(start - 1) as i64);
            }
            cursor = i128::from(*run.end()) + 1;
        }
        if cursor <= i128::from(hi) {
            missing.push(cursor as i64..=hi);
        }
        missing
    }

    /// True when every instant in `expected` is covered.
    pub fn covers(&self, expected: MicrosRange) -> bool {
        self.missing_runs(expected).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_and_adjacent_intervals_are_merged() {
        let cov = Coverage::from_intervals([5..=9, 0..=4, 12..=15, 14..=20, 30..=29]);
        assert_eq!(cov.intervals(), &[0..=9, 12..=20]);
    }

    #[test]
    fn missing_runs_cover_leading_inner_and_trailing_gaps() {
        let cov = Coverage::from_intervals([10..=19, 30..=39]);
        assert_eq!(cov.missing_runs(0..=49), vec![0..=9, 20..=29, 40..=49]);
        assert_eq!(cov.missing_runs(12..=15), Vec::<MicrosRange>::new());
        assert!(cov.covers(30..=39));
        assert!(!cov.covers(30..=40));
    }

    #[test]
    fn negative_domain_and_extremes_are_handled() {
        let cov = Coverage::from_intervals([i64::MIN..=-1]);
        assert_eq!(cov.missing_runs(-10..=i64::MAX), vec![0..=i64::MAX]);

        let full = Coverage::from_intervals([i64::MIN..=-1, 0..=i64::MAX]);
        assert_eq!(full.intervals(), &[i64::MIN..=i64::MAX]);
        assert!(full.covers(i64::MIN..=i64::MAX));
    }
}
