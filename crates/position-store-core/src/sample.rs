//! The row model persisted by both stores.
//!
//! A [`Sample`] is one observation of one tracked object within one series at
//! one instant. The triple `(series_id, timestamp, object_id)` is its identity;
//! writing a colliding triple replaces the whole row.
//!
//! The `has_*` summary flags are never stored on the struct: they are derived
//! from the optional fields every time a row is written, so a sample can not
//! carry a flag that disagrees with its columns.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::common::time_range::to_micros;

/// Provenance recorded when the caller does not name an engine.
pub const UNKNOWN_SOURCE_ENGINE: &str = "unknown";

/// Reasons a sample is rejected before it reaches storage.
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum SampleValidationError {
    /// `series_id` is empty or whitespace.
    #[snafu(display("series_id must not be empty (object {object_id:?})"))]
    EmptySeriesId {
        /// Object id of the offending sample.
        object_id: String,
    },

    /// `object_id` is empty or whitespace.
    #[snafu(display("object_id must not be empty (series {series_id:?})"))]
    EmptyObjectId {
        /// Series id of the offending sample.
        series_id: String,
    },

    /// `primary_value` is NaN or infinite.
    #[snafu(display("primary_value for {series_id:?}/{object_id:?} is not finite: {value}"))]
    NonFinitePrimary {
        /// Series id of the offending sample.
        series_id: String,
        /// Object id of the offending sample.
        object_id: String,
        /// The rejected value.
        value: f64,
    },

    /// A secondary value is NaN (which SQLite would silently turn into NULL).
    #[snafu(display("secondary value {field} for {series_id:?}/{object_id:?} is NaN"))]
    NanSecondary {
        /// Series id of the offending sample.
        series_id: String,
        /// Object id of the offending sample.
        object_id: String,
        /// Name of the offending secondary field.
        field: &'static str,
    },
}

/// Named auxiliary scalars; each one independently nullable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondaryValues {
    /// Secondary angular coordinate (ecliptic latitude).
    pub latitude: Option<f64>,
    /// Equatorial declination.
    pub declination: Option<f64>,
    /// Equatorial right ascension.
    pub right_ascension: Option<f64>,
    /// Radial distance.
    pub distance: Option<f64>,
    /// Topocentric altitude.
    pub altitude: Option<f64>,
    /// Topocentric azimuth.
    pub azimuth: Option<f64>,
    /// Physical observation: apparent magnitude.
    pub apparent_magnitude: Option<f64>,
    /// Physical observation: phase angle.
    pub phase_angle: Option<f64>,
    /// Physical observation: elongation.
    pub elongation: Option<f64>,
    /// Physical observation: light travel time.
    pub light_time: Option<f64>,
    /// Signed rate of change of the primary value.
    pub speed: Option<f64>,
}

impl SecondaryValues {
    /// Field names in storage column order.
    pub const FIELD_NAMES: [&'static str; 11] = [
        "latitude",
        "declination",
        "right_ascension",
        "distance",
        "altitude",
        "azimuth",
        "apparent_magnitude",
        "phase_angle",
        "elongation",
        "light_time",
        "speed",
    ];

    /// Values in the same order as [`Self::FIELD_NAMES`].
    pub fn to_array(&self) -> [Option<f64>; 11] {
        [
            self.latitude,
            self.declination,
            self.right_ascension,
            self.distance,
            self.altitude,
            self.azimuth,
            self.apparent_magnitude,
            self.phase_angle,
            self.elongation,
            self.light_time,
            self.speed,
        ]
    }

    /// Inverse of [`Self::to_array`].
    pub fn from_array(values: [Option<f64>; 11]) -> Self {
        let [
            latitude,
            declination,
            right_ascension,
            distance,
            altitude,
            azimuth,
            apparent_magnitude,
            phase_angle,
            elongation,
            light_time,
            speed,
        ] = values;
        Self {
            latitude,
            declination,
            right_ascension,
            distance,
            altitude,
            azimuth,
            apparent_magnitude,
            phase_angle,
            elongation,
            light_time,
            speed,
        }
    }

    /// Both equatorial coordinates are present.
    pub fn has_equatorial(&self) -> bool {
        self.declination.is_some() && self.right_ascension.is_some()
    }

    /// Both topocentric coordinates are present.
    pub fn has_topocentric(&self) -> bool {
        self.altitude.is_some() && self.azimuth.is_some()
    }

    /// At least one physical observation scalar is present.
    pub fn has_physical(&self) -> bool {
        self.apparent_magnitude.is_some() || self.phase_angle.is_some() || self.elongation.is_some()
    }
}

/// The values an external computation yields for one object at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionValues {
    /// The principal scalar (for example, ecliptic longitude).
    pub primary_value: f64,
    /// Auxiliary scalars.
    #[serde(default)]
    pub secondary: SecondaryValues,
    /// Whether the object appears to move backwards.
    #[serde(default)]
    pub is_retrograde: Option<bool>,
}

impl PositionValues {
    /// Values carrying only a primary scalar.
    pub fn primary(primary_value: f64) -> Self {
        Self {
            primary_value,
            ..Self::default()
        }
    }

    /// Attach secondary scalars.
    pub fn with_secondary(mut self, secondary: SecondaryValues) -> Self {
        self.secondary = secondary;
        self
    }

    /// Attach a retrograde marker.
    pub fn with_retrograde(mut self, is_retrograde: bool) -> Self {
        self.is_retrograde = Some(is_retrograde);
        self
    }
}

/// One observation of one object in one series at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Owning computation context (a base chart, a transit run, ...).
    pub series_id: String,
    /// Observation instant. Persisted with microsecond precision.
    pub timestamp: DateTime<Utc>,
    /// Tracked entity within the series.
    pub object_id: String,
    /// The principal scalar; always present.
    pub primary_value: f64,
    /// Auxiliary scalars.
    pub secondary: SecondaryValues,
    /// Retrograde marker, when known.
    pub is_retrograde: Option<bool>,
    /// Engine that produced the values.
    pub source_engine: String,
    /// Data file used by the producing engine, if any.
    pub source_file: Option<String>,
    /// Reference series this (moving) series is compared against.
    pub relates_to_series: Option<String>,
    /// True for rows forming a reference snapshot.
    pub is_reference: bool,
}

impl Sample {
    /// A reference-less sample with only a primary value.
    ///
    /// `is_reference` defaults to `true` because the sample does not relate
    /// to any other series; see [`Sample::relating_to`].
    pub fn new(
        series_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        object_id: impl Into<String>,
        primary_value: f64,
    ) -> Self {
        Self {
            series_id: series_id.into(),
            timestamp,
            object_id: object_id.into(),
            primary_value,
            secondary: SecondaryValues::default(),
            is_retrograde: None,
            source_engine: UNKNOWN_SOURCE_ENGINE.to_string(),
            source_file: None,
            relates_to_series: None,
            is_reference: true,
        }
    }

    /// Build a sample from computed values.
    pub fn from_values(
        series_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        object_id: impl Into<String>,
        values: PositionValues,
    ) -> Self {
        let mut sample = Self::new(series_id, timestamp, object_id, values.primary_value);
        sample.secondary = values.secondary;
        sample.is_retrograde = values.is_retrograde;
        sample
    }

    /// Replace the secondary scalars.
    pub fn with_secondary(mut self, secondary: SecondaryValues) -> Self {
        self.secondary = secondary;
        self
    }

    /// Record provenance.
    pub fn with_source(
        mut self,
        source_engine: impl Into<String>,
        source_file: Option<String>,
    ) -> Self {
        self.source_engine = source_engine.into();
        self.source_file = source_file;
        self
    }

    /// Mark this sample as part of a moving series compared against `series`.
    pub fn relating_to(mut self, series: impl Into<String>) -> Self {
        self.relates_to_series = Some(series.into());
        self.is_reference = false;
        self
    }

    /// Explicitly set the reference flag.
    pub fn with_reference(mut self, is_reference: bool) -> Self {
        self.is_reference = is_reference;
        self
    }

    /// Derived flag: both equatorial coordinates are populated.
    pub fn has_equatorial(&self) -> bool {
        self.secondary.has_equatorial()
    }

    /// Derived flag: both topocentric coordinates are populated.
    pub fn has_topocentric(&self) -> bool {
        self.secondary.has_topocentric()
    }

    /// Derived flag: at least one physical scalar is populated.
    pub fn has_physical(&self) -> bool {
        self.secondary.has_physical()
    }

    /// Timestamp in storage microseconds.
    pub fn timestamp_micros(&self) -> i64 {
        to_micros(self.timestamp)
    }

    /// Identity key, ordered `(timestamp, object_id, series_id)`.
    pub fn key(&self) -> SampleKey {
        SampleKey {
            timestamp_micros: self.timestamp_micros(),
            object_id: self.object_id.clone(),
            series_id: self.series_id.clone(),
        }
    }

    /// Check the shape rules every write enforces.
    pub fn validate(&self) -> Result<(), SampleValidationError> {
        ensure!(
            !self.series_id.trim().is_empty(),
            EmptySeriesIdSnafu {
                object_id: self.object_id.clone(),
            }
        );
        ensure!(
            !self.object_id.trim().is_empty(),
            EmptyObjectIdSnafu {
                series_id: self.series_id.clone(),
            }
        );
        ensure!(
            self.primary_value.is_finite(),
            NonFinitePrimarySnafu {
                series_id: self.series_id.clone(),
                object_id: self.object_id.clone(),
                value: self.primary_value,
            }
        );

        let values = self.secondary.to_array();
        for (field, value) in SecondaryValues::FIELD_NAMES.iter().zip(values) {
            ensure!(
                !value.is_some_and(f64::is_nan),
                NanSecondarySnafu {
                    series_id: self.series_id.clone(),
                    object_id: self.object_id.clone(),
                    field: *field,
                }
            );
        }
        Ok(())
    }
}

/// The uniqueness key of a sample.
///
/// Ordering is `(timestamp, object_id, series_id)`, the row order every query
/// surface returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    /// Timestamp in storage microseconds.
    pub timestamp_micros: i64,
    /// Tracked entity.
    pub object_id: String,
    /// Owning series.
    pub series_id: String,
}

impl Ord for SampleKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp_micros
            .cmp(&other.timestamp_micros)
            .then_with(|| self.object_id.cmp(&other.object_id))
            .then_with(|| self.series_id.cmp(&other.series_id))
    }
}

impl PartialOrd for SampleKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
