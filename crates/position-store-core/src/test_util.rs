//! Shared fixtures for unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use crate::{
    config::DEFAULT_BUSY_TIMEOUT_MS,
    error::StoreResult,
    hot_store::HotStore,
    sample::{Sample, SecondaryValues},
    storage::layout,
};

/// `2024-01-01T00:00:00Z` plus `m` minutes.
pub(crate) fn minute(m: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(m)
}

pub(crate) fn sample_at(series: &str, ts: DateTime<Utc>, object: &str, value: f64) -> Sample {
    Sample::new(series, ts, object, value)
}

pub(crate) fn full_secondary() -> SecondaryValues {
    SecondaryValues {
        latitude: Some(1.5),
        declination: Some(-12.25),
        right_ascension: Some(201.0),
        distance: Some(0.9833),
        altitude: Some(45.0),
        azimuth: Some(180.5),
        apparent_magnitude: Some(-26.7),
        phase_angle: Some(0.0),
        elongation: Some(0.0),
        light_time: Some(499.0),
        speed: Some(0.9856),
    }
}

pub(crate) fn open_store(tmp: &TempDir) -> StoreResult<HotStore> {
    HotStore::open(layout::hot_store_path(tmp.path()), DEFAULT_BUSY_TIMEOUT_MS)
}
