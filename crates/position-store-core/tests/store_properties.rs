#![allow(missing_docs)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use position_store_core::{
    batch_writer::SeriesOptions,
    config::EngineConfig,
    derived::{RelationshipDefinition, RelativeOptions},
    engine::PositionStore,
    error::{ErrorKind, StoreError},
    hot_store::SampleFilter,
    sample::{PositionValues, Sample, SecondaryValues},
};
use proptest::prelude::*;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn t0() -> Result<DateTime<Utc>, &'static str> {
    Utc.with_ymd_and_hms(1955, 3, 21, 12, 0, 0)
        .single()
        .ok_or("invalid timestamp")
}

fn open(tmp: &TempDir) -> Result<PositionStore, StoreError> {
    PositionStore::open(EngineConfig::for_workspace(tmp.path()).with_auto_export(false))
}

#[test]
fn second_write_of_a_key_replaces_the_first() -> TestResult {
    let tmp = TempDir::new()?;
    let mut store = open(&tmp)?;
    let ts = t0()?;

    store.upsert(&Sample::new("s1", ts, "moon", 10.0))?;
    store.upsert(&Sample::new("s1", ts, "moon", 11.5))?;

    let key = SampleFilter::for_series("s1").with_object("moon");
    assert_eq!(store.count(&key)?, 1);
    let rows: Vec<_> = store.scan(&key).collect::<Result<_, _>>()?;
    assert_eq!(rows[0].primary_value, 11.5);
    assert_eq!(rows[0].timestamp, ts);
    Ok(())
}

#[test]
fn one_invalid_sample_rejects_the_batch() -> TestResult {
    let tmp = TempDir::new()?;
    let mut store = open(&tmp)?;
    let ts = t0()?;
    store.upsert(&Sample::new("s1", ts, "sun", 0.0))?;

    let mut batch: Vec<_> = (1..=9)
        .map(|m| Sample::new("s1", ts + Duration::minutes(m), "sun", m as f64))
        .collect();
    batch.insert(4, Sample::new("", ts, "sun", 1.0));

    let err = store.upsert_batch(&batch).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(store.count(&SampleFilter::all())?, 1);
    Ok(())
}

#[test]
fn replacing_a_row_recomputes_flags() -> TestResult {
    let tmp = TempDir::new()?;
    let mut store = open(&tmp)?;
    let ts = t0()?;
    let full = SecondaryValues {
        declination: Some(1.0),
        right_ascension: Some(2.0),
        altitude: Some(3.0),
        azimuth: Some(4.0),
        phase_angle: Some(5.0),
        ..SecondaryValues::default()
    };

    store.upsert(&Sample::new("s1", ts, "mars", 1.0).with_secondary(full))?;
    assert_eq!(store.count(&SampleFilter::all().with_topocentric(true))?, 1);

    store.upsert(&Sample::new("s1", ts, "mars", 1.0))?;
    assert_eq!(store.count(&SampleFilter::all().with_topocentric(true))?, 0);
    assert_eq!(store.count(&SampleFilter::all().with_equatorial(false))?, 1);
    assert_eq!(store.count(&SampleFilter::all().with_physical(false))?, 1);
    Ok(())
}

#[test]
fn trine_pair_matches_once_with_zero_orb() -> TestResult {
    let trine = [RelationshipDefinition::new("trine", 120.0, 1.0)];
    let ts = t0()?;

    for (a, b) in [(0.0, 120.0), (120.0, 0.0)] {
        let tmp = TempDir::new()?;
        let mut store = open(&tmp)?;
        store.upsert_batch(&[Sample::new("s1", ts, "A", a), Sample::new("s1", ts, "B", b)])?;

        let report = store.compute_relationships("s1", Some(ts), &trine)?;

        assert_eq!(report.relationships.len(), 1);
        let rel = &report.relationships[0];
        assert_eq!(rel.orb, 0.0);
        assert_eq!(rel.measured_angle, 120.0);
        assert_eq!((rel.from.as_str(), rel.to.as_str()), ("A", "B"));
        assert_eq!(rel.applying, None);
        assert_eq!(report.skipped_pairs, 0);
    }
    Ok(())
}

#[test]
fn relative_angle_against_reference_snapshot() -> TestResult {
    let tmp = TempDir::new()?;
    let mut store = open(&tmp)?;
    let natal = t0()?;
    let now = natal + Duration::days(365 * 60);

    store.store_reference_snapshot("natal", natal, "test", [("x", PositionValues::primary(170.0))])?;
    let report = store.ingest(
        "transit",
        &SeriesOptions::from_engine("test").relating_to("natal"),
        [position_store_core::batch_writer::SourceRecord::new(now, "x", PositionValues::primary(200.0))],
    );
    assert_eq!(report.written_count, 1);

    let relative = store.query_relative("transit", "natal", &RelativeOptions::default().at(now))?;
    assert_eq!(relative.samples.len(), 1);
    assert_eq!(relative.samples[0].relative_angle, 30.0);
    assert_eq!(relative.reference_timestamp, natal);

    let linked = store.query_relative_linked("transit", &RelativeOptions::default())?;
    assert_eq!(linked.samples, relative.samples);
    Ok(())
}

#[test]
fn relative_query_without_reference_rows_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let mut store = open(&tmp)?;
    store.upsert(&Sample::new("transit", t0()?, "x", 200.0).relating_to("natal"))?;

    let err = store
        .query_relative("transit", "natal", &RelativeOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyReference);
    Ok(())
}

fn opt_value() -> impl Strategy<Value = Option<f64>> {
    proptest::option::of(-1000.0f64..1000.0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn stored_flags_follow_populated_fields(
        rows in proptest::collection::vec(
            (opt_value(), opt_value(), opt_value(), opt_value(), opt_value(), opt_value(), opt_value()),
            1..24,
        )
    ) {
        let tmp = TempDir::new().unwrap();
        let mut store = open(&tmp).unwrap();
        let base = t0().unwrap();

        let samples: Vec<Sample> = rows
            .iter()
            .enumerate()
            .map(|(i, &(dec, ra, alt, az, mag, phase, elong))| {
                Sample::new("p2", base + Duration::minutes(i as i64), "obj", 1.0).with_secondary(
                    SecondaryValues {
                        declination: dec,
                        right_ascension: ra,
                        altitude: alt,
                        azimuth: az,
                        apparent_magnitude: mag,
                        phase_angle: phase,
                        elongation: elong,
                        ..SecondaryValues::default()
                    },
                )
            })
            .collect();
        store.upsert_batch(&samples).unwrap();

        let topo: Vec<i64> = samples
            .iter()
            .filter(|s| s.secondary.altitude.is_some() && s.secondary.azimuth.is_some())
            .map(Sample::timestamp_micros)
            .collect();
        let stored_topo: Vec<i64> = store
            .scan(&SampleFilter::all().with_topocentric(true))
            .map(|s| s.unwrap().timestamp_micros())
            .collect();
        prop_assert_eq!(topo, stored_topo);

        let equatorial = samples
            .iter()
            .filter(|s| s.secondary.declination.is_some() && s.secondary.right_ascension.is_some())
            .count() as u64;
        prop_assert_eq!(store.count(&SampleFilter::all().with_equatorial(true)).unwrap(), equatorial);

        let physical = samples
            .iter()
            .filter(|s| {
                s.secondary.apparent_magnitude.is_some()
                    || s.secondary.phase_angle.is_some()
                    || s.secondary.elongation.is_some()
            })
            .count() as u64;
        prop_assert_eq!(store.count(&SampleFilter::all().with_physical(true)).unwrap(), physical);
    }
}
