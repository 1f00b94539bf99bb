//! Chunked ingestion into the hot store.
//!
//! [`BatchWriter`] pulls records from a caller-supplied iterator, turns them
//! into [`Sample`]s and commits them in fixed-size chunks, one transaction
//! per chunk. A failure or cancellation stops the ingest on a chunk boundary
//! and the [`WriteReport`] says how many rows were committed before it.
//!
//! When auto-export is configured and an ingest writes more rows than the
//! threshold, the written interval of the series is exported right away.
//! Export problems are reported but never undo committed rows.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::{
    archive::export::{self, ExportOptions, ExportReport, ExportSelection},
    cancel::CancellationToken,
    common::time_range::TimeRange,
    error::{InvalidConfigSnafu, StoreError, StoreResult},
    hot_store::HotStore,
    sample::{PositionValues, Sample, UNKNOWN_SOURCE_ENGINE},
    storage::ArchiveLocation,
};

/// Provenance and linkage applied to every sample of one ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesOptions {
    /// Engine that produced the values.
    pub source_engine: String,
    /// Data file used by the engine.
    pub source_file: Option<String>,
    /// Reference series this series is compared against.
    pub relates_to_series: Option<String>,
    /// Explicit reference flag; defaults to "not linked to another series".
    pub is_reference: Option<bool>,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            source_engine: UNKNOWN_SOURCE_ENGINE.to_string(),
            source_file: None,
            relates_to_series: None,
            is_reference: None,
        }
    }
}

impl SeriesOptions {
    /// Options with the given engine name.
    pub fn from_engine(source_engine: impl Into<String>) -> Self {
        Self {
            source_engine: source_engine.into(),
            ..Self::default()
        }
    }

    /// Record the engine's data file.
    pub fn with_source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = Some(source_file.into());
        self
    }

    /// Link the series to a reference series.
    pub fn relating_to(mut self, series_id: impl Into<String>) -> Self {
        self.relates_to_series = Some(series_id.into());
        self
    }

    /// Override the reference flag.
    pub fn with_reference(mut self, is_reference: bool) -> Self {
        self.is_reference = Some(is_reference);
        self
    }

    /// The `is_reference` value written on every row.
    pub fn resolved_is_reference(&self) -> bool {
        self.is_reference
            .unwrap_or(self.relates_to_series.is_none())
    }

    fn build(&self, series_id: &str, record: SourceRecord) -> Sample {
        let mut sample = Sample::from_values(series_id, record.timestamp, record.object_id, record.values)
            .with_source(self.source_engine.clone(), self.source_file.clone());
        sample.relates_to_series = self.relates_to_series.clone();
        sample.is_reference = self.resolved_is_reference();
        sample
    }
}

/// One caller-supplied observation.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Observation instant.
    pub timestamp: DateTime<Utc>,
    /// Tracked object.
    pub object_id: String,
    /// Computed values.
    pub values: PositionValues,
}

impl SourceRecord {
    /// Bundle one observation.
    pub fn new(timestamp: DateTime<Utc>, object_id: impl Into<String>, values: PositionValues) -> Self {
        Self {
            timestamp,
            object_id: object_id.into(),
            values,
        }
    }
}

/// Evenly spaced instants over a closed range: `start, start + step, ...`
/// up to and including `end` when it lies on the grid.
#[derive(Debug, Clone)]
pub struct TimeSteps {
    next: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    step: Duration,
}

impl TimeSteps {
    /// Steps across `range`; `step` must be positive.
    pub fn new(range: TimeRange, step: Duration) -> StoreResult<Self> {
        if step <= Duration::zero() {
            return InvalidConfigSnafu {
                message: format!("time step must be positive, got {step}"),
            }
            .fail();
        }
        Ok(Self {
            next: Some(range.start()),
            end: range.end(),
            step,
        })
    }
}

impl Iterator for TimeSteps {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.filter(|ts| *ts <= self.end)?;
        self.next = current.checked_add_signed(self.step);
        Some(current)
    }
}

/// Outcome of an ingest.
#[derive(Debug, Default)]
pub struct WriteReport {
    /// Rows committed to the hot store.
    pub written_count: u64,
    /// The error that stopped the ingest, if any.
    pub failed: Option<StoreError>,
    /// Computations that failed or produced unusable values.
    pub skipped: u64,
    /// True if a cancellation request stopped the ingest.
    pub cancelled: bool,
    /// Earliest and latest committed timestamp.
    pub written_span: Option<TimeRange>,
    /// Result of the automatic export, when one ran.
    pub export: Option<ExportReport>,
}

impl WriteReport {
    /// True when the source was consumed without failure or cancellation.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && !self.cancelled
    }

    fn extend_span(&mut self, chunk: &[Sample]) {
        let Some(lo) = chunk.iter().map(|s| s.timestamp).min() else {
            return;
        };
        let hi = chunk.iter().map(|s| s.timestamp).max().unwrap_or(lo);
        let (lo, hi) = match self.written_span {
            Some(span) => (span.start().min(lo), span.end().max(hi)),
            None => (lo, hi),
        };
        self.written_span = Some(TimeRange::new(lo, hi).unwrap_or(TimeRange::instant(lo)));
    }
}

impl fmt::Display for WriteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} written, {} skipped", self.written_count, self.skipped)?;
        if self.cancelled {
            f.write_str(", cancelled")?;
        }
        if let Some(err) = &self.failed {
            write!(f, ", failed: {err}")?;
        }
        Ok(())
    }
}

/// Where and when ingests export automatically.
#[derive(Debug, Clone)]
pub struct AutoExport {
    /// Archive root.
    pub location: ArchiveLocation,
    /// Export when an ingest writes more rows than this.
    pub threshold: u64,
    /// Layout of the exported partitions.
    pub options: ExportOptions,
}

/// Chunked writer bound to one hot store.
pub struct BatchWriter<'a> {
    hot: &'a mut HotStore,
    batch_size: usize,
    auto_export: Option<AutoExport>,
    cancel: Option<CancellationToken>,
}

impl<'a> BatchWriter<'a> {
    /// Writer committing `batch_size` rows per transaction.
    pub fn new(hot: &'a mut HotStore, batch_size: usize) -> Self {
        Self {
            hot,
            batch_size: batch_size.max(1),
            auto_export: None,
            cancel: None,
        }
    }

    /// Enable automatic export after large ingests.
    pub fn with_auto_export(mut self, auto_export: Option<AutoExport>) -> Self {
        self.auto_export = auto_export;
        self
    }

    /// Check `token` between chunks.
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn check_reference_link(&self, options: &SeriesOptions) {
        let Some(reference) = &options.relates_to_series else {
            return;
        };
        match self.hot.reference_timestamp(reference) {
            Ok(Some(_)) => {}
            Ok(None) => warn!(
                "series links to {reference:?}, which has no reference rows yet; relative queries will be empty"
            ),
            Err(e) => warn!("could not check reference series {reference:?}: {e}"),
        }
    }

    /// Returns false when the ingest must stop.
    fn commit(&mut self, chunk: &mut Vec<Sample>, report: &mut WriteReport) -> bool {
        if chunk.is_empty() {
            return true;
        }
        if self.is_cancelled() {
            report.cancelled = true;
            warn!("ingest cancelled after {} rows", report.written_count);
            return false;
        }
        match self.hot.upsert_batch(chunk) {
            Ok(n) => {
                report.written_count += n as u64;
                report.extend_span(chunk);
                debug!("ingest chunk committed, {} rows so far", report.written_count);
                chunk.clear();
                true
            }
            Err(e) => {
                warn!("ingest stopped after {} rows: {e}", report.written_count);
                report.failed = Some(e);
                false
            }
        }
    }

    /// Write `source` into `series_id`, one transaction per chunk.
    pub fn ingest<I>(&mut self, series_id: &str, options: &SeriesOptions, source: I) -> WriteReport
    where
        I: IntoIterator<Item = SourceRecord>,
    {
        self.check_reference_link(options);

        let mut report = WriteReport::default();
        let mut chunk = Vec::with_capacity(self.batch_size);
        let mut stopped = false;
        for record in source {
            chunk.push(options.build(series_id, record));
            if chunk.len() >= self.batch_size && !self.commit(&mut chunk, &mut report) {
                stopped = true;
                break;
            }
        }
        if !stopped {
            self.commit(&mut chunk, &mut report);
        }

        self.maybe_export(series_id, &mut report);
        info!("ingest into {series_id:?}: {report}");
        report
    }

    /// Drive `compute` over every `(timestamp, object)` pair and ingest the
    /// results.
    ///
    /// Failed computations and unusable values (for example a NaN primary
    /// value) are logged, counted in [`WriteReport::skipped`] and left out;
    /// they never abort the ingest.
    pub fn ingest_computed<T, O, F, E>(
        &mut self,
        series_id: &str,
        options: &SeriesOptions,
        timestamps: T,
        objects: &[O],
        mut compute: F,
    ) -> WriteReport
    where
        T: IntoIterator<Item = DateTime<Utc>>,
        O: AsRef<str>,
        F: FnMut(&str, DateTime<Utc>) -> Result<PositionValues, E>,
        E: fmt::Display,
    {
        let mut skipped = 0u64;
        let records = timestamps.into_iter().flat_map(|ts| {
            objects
                .iter()
                .map(move |object| (ts, object.as_ref()))
        });
        let source = records.filter_map(|(ts, object)| match compute(object, ts) {
            Ok(values) => {
                let record = SourceRecord::new(ts, object, values);
                match options.build(series_id, record.clone()).validate() {
                    Ok(()) => Some(record),
                    Err(e) => {
                        warn!("skipping {object:?} at {ts}: {e}");
                        skipped += 1;
                        None
                    }
                }
            }
            Err(e) => {
                warn!("computation failed for {object:?} at {ts}: {e}");
                skipped += 1;
                None
            }
        });

        let mut report = self.ingest(series_id, options, source);
        report.skipped = skipped;
        report
    }

    /// Store a base snapshot: every row at `timestamp` flagged `is_reference`.
    ///
    /// Applied as one transaction.
    pub fn store_reference_snapshot<I, O>(
        &mut self,
        series_id: &str,
        timestamp: DateTime<Utc>,
        source_engine: &str,
        values: I,
    ) -> StoreResult<usize>
    where
        I: IntoIterator<Item = (O, PositionValues)>,
        O: Into<String>,
    {
        let options = SeriesOptions::from_engine(source_engine).with_reference(true);
        let samples: Vec<Sample> = values
            .into_iter()
            .map(|(object, values)| options.build(series_id, SourceRecord::new(timestamp, object, values)))
            .collect();
        let n = self.hot.upsert_batch(&samples)?;
        info!("stored reference snapshot of {n} objects for {series_id:?} at {timestamp}");
        Ok(n)
    }

    fn maybe_export(&self, series_id: &str, report: &mut WriteReport) {
        let Some(auto) = &self.auto_export else {
            return;
        };
        if report.cancelled || report.written_count <= auto.threshold {
            return;
        }
        let Some(span) = report.written_span else {
            return;
        };

        debug!(
            "auto-export of {series_id:?}: {} rows exceed threshold {}",
            report.written_count, auto.threshold
        );
        let exported = export::export(
            &*self.hot,
            &auto.location,
            &ExportSelection::series(series_id, Some(span)),
            &auto.options,
            self.cancel.as_ref(),
        );
        if let Some(e) = &exported.failed {
            warn!("auto-export of {series_id:?} failed: {e}");
        }
        report.export = Some(exported);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hot_store::SampleFilter;
    use crate::test_util::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn records(n: i64) -> Vec<SourceRecord> {
        (0..n)
            .map(|m| SourceRecord::new(minute(m), "sun", PositionValues::primary(m as f64)))
            .collect()
    }

    #[test]
    fn time_steps_include_end_on_grid() -> TestResult {
        let steps: Vec<_> = TimeSteps::new(TimeRange::new(minute(0), minute(3))?, Duration::minutes(1))?.collect();
        assert_eq!(steps, vec![minute(0), minute(1), minute(2), minute(3)]);

        let steps = TimeSteps::new(TimeRange::new(minute(0), minute(3))?, Duration::minutes(2))?;
        assert_eq!(steps.count(), 2);

        assert!(TimeSteps::new(TimeRange::instant(minute(0)), Duration::zero()).is_err());
        Ok(())
    }

    #[test]
    fn ingest_commits_in_chunks_and_tracks_span() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;

        let report = BatchWriter::new(&mut hot, 7).ingest("s1", &SeriesOptions::default(), records(20));

        assert!(report.is_complete());
        assert_eq!(report.written_count, 20);
        assert_eq!(report.written_span, Some(TimeRange::new(minute(0), minute(19))?));
        assert!(report.export.is_none());
        assert_eq!(hot.count(&SampleFilter::for_series("s1"))?, 20);
        Ok(())
    }

    #[test]
    fn failing_chunk_keeps_earlier_chunks() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        let mut source = records(10);
        source[6].values.primary_value = f64::NAN;

        let report = BatchWriter::new(&mut hot, 5).ingest("s1", &SeriesOptions::default(), source);

        assert_eq!(report.written_count, 5);
        assert!(report.failed.is_some());
        assert_eq!(hot.count(&SampleFilter::all())?, 5);
        Ok(())
    }

    #[test]
    fn cancellation_stops_on_chunk_boundary() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        let token = CancellationToken::new();
        let trigger = token.clone();

        let source = records(30).into_iter().inspect(move |r| {
            if r.timestamp == minute(12) {
                trigger.cancel();
            }
        });
        let report = BatchWriter::new(&mut hot, 10)
            .with_cancellation(Some(token))
            .ingest("s1", &SeriesOptions::default(), source);

        assert!(report.cancelled);
        assert_eq!(report.written_count, 10);
        assert_eq!(hot.count(&SampleFilter::all())?, 10);
        Ok(())
    }

    #[test]
    fn computed_ingest_skips_failures() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        let steps = TimeSteps::new(TimeRange::new(minute(0), minute(4))?, Duration::minutes(1))?;

        let report = BatchWriter::new(&mut hot, 100).ingest_computed(
            "transit",
            &SeriesOptions::from_engine("test").relating_to("natal"),
            steps,
            &["sun", "moon", "pluto"],
            |object, ts| match object {
                "pluto" => Err(format!("no ephemeris for {object}")),
                "moon" if ts == minute(2) => Ok(PositionValues::primary(f64::INFINITY)),
                _ => Ok(PositionValues::primary(1.0)),
            },
        );

        assert!(report.is_complete());
        assert_eq!(report.written_count, 9);
        assert_eq!(report.skipped, 6);

        let rows = hot.scan(&SampleFilter::for_series("transit")).collect::<StoreResult<Vec<_>>>()?;
        assert!(rows.iter().all(|s| !s.is_reference));
        assert!(rows.iter().all(|s| s.relates_to_series.as_deref() == Some("natal")));
        assert!(rows.iter().all(|s| s.source_engine == "test"));
        Ok(())
    }

    #[test]
    fn reference_snapshot_is_flagged() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;

        let n = BatchWriter::new(&mut hot, 10).store_reference_snapshot(
            "natal",
            minute(0),
            "test",
            [("sun", PositionValues::primary(170.0)), ("moon", PositionValues::primary(10.0))],
        )?;

        assert_eq!(n, 2);
        assert_eq!(hot.count(&SampleFilter::for_series("natal").reference_rows())?, 2);
        Ok(())
    }
}
