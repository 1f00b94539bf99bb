//! Relative values of a moving series against a reference snapshot.
//!
//! The reference series is treated as timestamp-invariant: its earliest
//! instant holding `is_reference` rows is fetched once and joined against
//! every matching row of the moving series.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    common::time_range::TimeRange,
    derived::{normalize_angle, signed_delta},
    error::{EmptyReferenceSnafu, NoLinkedReferenceSnafu, StoreResult},
    hot_store::{HotStore, SampleFilter},
};

/// Which moving rows to compare, and how objects are paired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelativeOptions {
    /// Only this instant of the moving series.
    pub at_timestamp: Option<DateTime<Utc>>,
    /// Only this closed range of the moving series.
    pub time_range: Option<TimeRange>,
    /// Pair each moving object with the same reference object only,
    /// instead of with every reference object.
    pub match_objects: bool,
}

impl RelativeOptions {
    /// Restrict to one instant.
    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.at_timestamp = Some(ts);
        self
    }

    /// Restrict to a closed range.
    pub fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Pair equal object ids only.
    pub fn matching_objects(mut self) -> Self {
        self.match_objects = true;
        self
    }

    /// The effective moving-series range, or `Err(())` when the instant and
    /// the range do not intersect.
    fn effective_range(&self) -> Result<Option<TimeRange>, ()> {
        match (self.at_timestamp, self.time_range) {
            (None, range) => Ok(range),
            (Some(ts), None) => Ok(Some(TimeRange::instant(ts))),
            (Some(ts), Some(range)) => range
                .intersection(&TimeRange::instant(ts))
                .map(Some)
                .ok_or(()),
        }
    }
}

/// One moving row compared with one reference row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeSample {
    /// Instant of the moving row.
    pub timestamp: DateTime<Utc>,
    /// Object of the moving row.
    pub moving_object: String,
    /// Object of the reference row.
    pub reference_object: String,
    /// Primary value of the moving row.
    pub moving_value: f64,
    /// Primary value of the reference row.
    pub reference_value: f64,
    /// `(moving - reference) mod circle`, in `[0, circle)`.
    pub relative_angle: f64,
    /// Same difference wrapped into `(-circle / 2, circle / 2]`.
    pub signed_delta: f64,
    /// Declination difference, when both rows carry one.
    pub declination_delta: Option<f64>,
    /// Distance difference, when both rows carry one.
    pub distance_delta: Option<f64>,
}

/// Result of a relative query.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativeReport {
    /// Reference series that was joined.
    pub reference_series: String,
    /// Instant of the reference snapshot.
    pub reference_timestamp: DateTime<Utc>,
    /// Ordered by `(timestamp, moving_object, reference_object)`.
    pub samples: Vec<RelativeSample>,
    /// Pairs skipped because a primary value was missing or not finite.
    pub skipped_pairs: u64,
}

fn diff(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) if a.is_finite() && b.is_finite() => Some(a - b),
        _ => None,
    }
}

/// Compare `moving_series` against the reference snapshot of
/// `reference_series`.
///
/// Fails with [`crate::error::ErrorKind::EmptyReference`] when the reference
/// series has no `is_reference` rows.
pub fn query_relative(
    hot: &HotStore,
    moving_series: &str,
    reference_series: &str,
    options: &RelativeOptions,
    circle: f64,
) -> StoreResult<RelativeReport> {
    let reference_ts = hot
        .reference_timestamp(reference_series)?
        .ok_or_else(|| {
            EmptyReferenceSnafu {
                series_id: reference_series,
            }
            .build()
        })?;

    let mut report = RelativeReport {
        reference_series: reference_series.to_string(),
        reference_timestamp: reference_ts,
        samples: Vec::new(),
        skipped_pairs: 0,
    };
    let Ok(range) = options.effective_range() else {
        return Ok(report);
    };

    let moving = SampleFilter {
        series_id: Some(moving_series.to_string()),
        time_range: range,
        ..SampleFilter::default()
    };
    for row in hot.relative_rows(&moving, reference_series, reference_ts, options.match_objects)? {
        let (Some(m), Some(r)) = (row.moving_value, row.reference_value) else {
            report.skipped_pairs += 1;
            continue;
        };
        if !(m.is_finite() && r.is_finite()) {
            report.skipped_pairs += 1;
            continue;
        }

        report.samples.push(RelativeSample {
            timestamp: row.timestamp,
            moving_object: row.moving_object,
            reference_object: row.reference_object,
            moving_value: m,
            reference_value: r,
            relative_angle: normalize_angle(m - r, circle),
            signed_delta: signed_delta(r, m, circle),
            declination_delta: diff(row.moving_declination, row.reference_declination),
            distance_delta: diff(row.moving_distance, row.reference_distance),
        });
    }

    debug!(
        "relative query {moving_series:?} vs {reference_series:?}@{reference_ts}: {} rows",
        report.samples.len()
    );
    Ok(report)
}

/// [`query_relative`] against the reference series recorded on the moving
/// series' rows (`relates_to_series`).
pub fn query_relative_linked(
    hot: &HotStore,
    moving_series: &str,
    options: &RelativeOptions,
    circle: f64,
) -> StoreResult<RelativeReport> {
    let reference = hot.linked_reference(moving_series)?.ok_or_else(|| {
        NoLinkedReferenceSnafu {
            series_id: moving_series,
        }
        .build()
    })?;
    query_relative(hot, moving_series, &reference, options, circle)
}
