//! The engine facade.
//!
//! [`PositionStore`] owns the hot-store connection and the archive location
//! of one workspace. Opening it is the only way to reach either store, and
//! dropping (or [`PositionStore::close`]-ing) it releases both. Mutating
//! operations take `&mut self`; concurrent readers use
//! [`PositionStore::reader`], which opens an independent read-only handle.

use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;

use crate::{
    archive::export::{self, ExportOptions, ExportReport, ExportSelection},
    batch_writer::{AutoExport, BatchWriter, SeriesOptions, SourceRecord, WriteReport},
    cancel::CancellationToken,
    config::EngineConfig,
    derived::{
        RelationshipDefinition, RelationshipReport, RelativeOptions, RelativeReport,
        compute_relationships, query_relative, query_relative_linked,
    },
    error::{StoreError, StoreResult},
    hot_store::{HotStore, SampleFilter, Scan},
    query::{QueryRequest, QueryResult, QueryRouter},
    sample::{PositionValues, Sample},
    storage::ArchiveLocation,
};

/// Read operations shared by the writer and reader handles.
struct Reads<'a> {
    hot: &'a HotStore,
    archive: Option<&'a ArchiveLocation>,
    config: &'a EngineConfig,
}

impl Reads<'_> {
    fn query(&self, request: &QueryRequest) -> StoreResult<QueryResult> {
        QueryRouter::new(self.hot, self.archive.cloned(), self.config.route_row_threshold)
            .query(request)
    }

    fn relationships(
        &self,
        series_id: &str,
        at: Option<DateTime<Utc>>,
        definitions: &[RelationshipDefinition],
    ) -> StoreResult<RelationshipReport> {
        compute_relationships(self.hot, series_id, at, definitions, self.config.circle_size)
    }

    fn relative(
        &self,
        moving_series: &str,
        reference_series: &str,
        options: &RelativeOptions,
    ) -> StoreResult<RelativeReport> {
        query_relative(
            self.hot,
            moving_series,
            reference_series,
            options,
            self.config.circle_size,
        )
    }

    fn relative_linked(
        &self,
        moving_series: &str,
        options: &RelativeOptions,
    ) -> StoreResult<RelativeReport> {
        query_relative_linked(self.hot, moving_series, options, self.config.circle_size)
    }
}

/// Hybrid hot/archive position store for one workspace.
#[derive(Debug)]
pub struct PositionStore {
    config: EngineConfig,
    hot: HotStore,
    archive: Option<ArchiveLocation>,
}

impl PositionStore {
    /// Open the stores described by `config`.
    pub fn open(config: EngineConfig) -> StoreResult<Self> {
        config.validate()?;
        let hot = HotStore::open(&config.hot_store_path, config.busy_timeout_ms)?;
        let archive = config.archive_dir.clone().map(ArchiveLocation::local);
        info!(
            "opened position store: hot={}, archive={}",
            config.hot_store_path.display(),
            archive
                .as_ref()
                .map(|a| a.root().display().to_string())
                .unwrap_or_else(|| "<none>".to_string())
        );
        Ok(Self {
            config,
            hot,
            archive,
        })
    }

    /// Open the fixed layout under `workspace_dir` with default settings.
    pub fn open_workspace(workspace_dir: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(EngineConfig::for_workspace(workspace_dir))
    }

    /// Release the hot-store connection.
    pub fn close(self) -> StoreResult<()> {
        self.hot.close()
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying hot store.
    pub fn hot_store(&self) -> &HotStore {
        &self.hot
    }

    /// Configured archive, if any.
    pub fn archive_location(&self) -> Option<&ArchiveLocation> {
        self.archive.as_ref()
    }

    fn reads(&self) -> Reads<'_> {
        Reads {
            hot: &self.hot,
            archive: self.archive.as_ref(),
            config: &self.config,
        }
    }

    /// Layout used for automatic exports.
    pub fn auto_export_options(&self) -> ExportOptions {
        ExportOptions {
            partition_by_date: true,
            partition_by_hour: self.config.auto_export_partition_by_hour,
            compression: self.config.compression,
        }
    }

    /// A batch writer honouring the configured batch size and auto-export.
    pub fn writer(&mut self) -> BatchWriter<'_> {
        let auto_export = match (&self.archive, self.config.auto_export) {
            (Some(location), true) => Some(AutoExport {
                location: location.clone(),
                threshold: self.config.parquet_threshold,
                options: self.auto_export_options(),
            }),
            _ => None,
        };
        BatchWriter::new(&mut self.hot, self.config.batch_size).with_auto_export(auto_export)
    }

    // ---- hot store ----

    /// Insert or fully replace one sample.
    pub fn upsert(&mut self, sample: &Sample) -> StoreResult<()> {
        self.hot.upsert(sample)
    }

    /// Insert or replace all samples atomically.
    pub fn upsert_batch(&mut self, samples: &[Sample]) -> StoreResult<usize> {
        self.hot.upsert_batch(samples)
    }

    /// Lazily scan the hot store.
    pub fn scan(&self, filter: &SampleFilter) -> Scan<'_> {
        self.hot.scan(filter)
    }

    /// Count matching hot-store rows.
    pub fn count(&self, filter: &SampleFilter) -> StoreResult<u64> {
        self.hot.count(filter)
    }

    // ---- ingest ----

    /// Chunked ingest of caller-supplied records.
    pub fn ingest<I>(&mut self, series_id: &str, options: &SeriesOptions, source: I) -> WriteReport
    where
        I: IntoIterator<Item = SourceRecord>,
    {
        self.writer().ingest(series_id, options, source)
    }

    /// [`PositionStore::ingest`] checking `token` between chunks.
    pub fn ingest_cancellable<I>(
        &mut self,
        series_id: &str,
        options: &SeriesOptions,
        source: I,
        token: &CancellationToken,
    ) -> WriteReport
    where
        I: IntoIterator<Item = SourceRecord>,
    {
        self.writer()
            .with_cancellation(Some(token.clone()))
            .ingest(series_id, options, source)
    }

    /// Ingest the output of an external computation; see
    /// [`BatchWriter::ingest_computed`].
    pub fn ingest_computed<T, O, F, E>(
        &mut self,
        series_id: &str,
        options: &SeriesOptions,
        timestamps: T,
        objects: &[O],
        compute: F,
    ) -> WriteReport
    where
        T: IntoIterator<Item = DateTime<Utc>>,
        O: AsRef<str>,
        F: FnMut(&str, DateTime<Utc>) -> Result<PositionValues, E>,
        E: std::fmt::Display,
    {
        self.writer()
            .ingest_computed(series_id, options, timestamps, objects, compute)
    }

    /// Store a reference snapshot of `series_id` at `timestamp`.
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
        self.writer()
            .store_reference_snapshot(series_id, timestamp, source_engine, values)
    }

    // ---- archive ----

    /// Export hot-store rows into the configured archive.
    ///
    /// Without a configured archive the report carries an
    /// `ArchiveUnavailable` failure.
    pub fn export(&self, selection: &ExportSelection, options: &ExportOptions) -> ExportReport {
        self.export_inner(selection, options, None)
    }

    /// [`PositionStore::export`] checking `token` between partitions.
    pub fn export_cancellable(
        &self,
        selection: &ExportSelection,
        options: &ExportOptions,
        token: &CancellationToken,
    ) -> ExportReport {
        self.export_inner(selection, options, Some(token))
    }

    fn export_inner(
        &self,
        selection: &ExportSelection,
        options: &ExportOptions,
        token: Option<&CancellationToken>,
    ) -> ExportReport {
        match &self.archive {
            Some(location) => export::export(&self.hot, location, selection, options, token),
            None => ExportReport {
                failed: Some(StoreError::ArchiveUnavailable {
                    path: "<none>".to_string(),
                    reason: "no archive location configured".to_string(),
                }),
                ..ExportReport::default()
            },
        }
    }

    // ---- reads ----

    /// Routed read over both stores.
    pub fn query(&self, request: &QueryRequest) -> StoreResult<QueryResult> {
        self.reads().query(request)
    }

    /// Pairwise relationships within one series.
    pub fn compute_relationships(
        &self,
        series_id: &str,
        at: Option<DateTime<Utc>>,
        definitions: &[RelationshipDefinition],
    ) -> StoreResult<RelationshipReport> {
        self.reads().relationships(series_id, at, definitions)
    }

    /// Moving series relative to a reference snapshot.
    pub fn query_relative(
        &self,
        moving_series: &str,
        reference_series: &str,
        options: &RelativeOptions,
    ) -> StoreResult<RelativeReport> {
        self.reads().relative(moving_series, reference_series, options)
    }

    /// Moving series relative to its linked reference series.
    pub fn query_relative_linked(
        &self,
        moving_series: &str,
        options: &RelativeOptions,
    ) -> StoreResult<RelativeReport> {
        self.reads().relative_linked(moving_series, options)
    }

    /// An independent read-only handle, usable from another thread.
    pub fn reader(&self) -> StoreResult<PositionReader> {
        Ok(PositionReader {
            config: self.config.clone(),
            hot: self.hot.reader()?,
            archive: self.archive.clone(),
        })
    }
}

/// Read-only view of a [`PositionStore`] over its own connection.
#[derive(Debug)]
pub struct PositionReader {
    config: EngineConfig,
    hot: HotStore,
    archive: Option<ArchiveLocation>,
}

impl PositionReader {
    fn reads(&self) -> Reads<'_> {
        Reads {
            hot: &self.hot,
            archive: self.archive.as_ref(),
            config: &self.config,
        }
    }

    /// Count matching hot-store rows.
    pub fn count(&self, filter: &SampleFilter) -> StoreResult<u64> {
        self.hot.count(filter)
    }

    /// Routed read over both stores.
    pub fn query(&self, request: &QueryRequest) -> StoreResult<QueryResult> {
        self.reads().query(request)
    }

    /// Pairwise relationships within one series.
    pub fn compute_relationships(
        &self,
        series_id: &str,
        at: Option<DateTime<Utc>>,
        definitions: &[RelationshipDefinition],
    ) -> StoreResult<RelationshipReport> {
        self.reads().relationships(series_id, at, definitions)
    }

    /// Moving series relative to a reference snapshot.
    pub fn query_relative(
        &self,
        moving_series: &str,
        reference_series: &str,
        options: &RelativeOptions,
    ) -> StoreResult<RelativeReport> {
        self.reads().relative(moving_series, reference_series, options)
    }

    /// Moving series relative to its linked reference series.
    pub fn query_relative_linked(
        &self,
        moving_series: &str,
        options: &RelativeOptions,
    ) -> StoreResult<RelativeReport> {
        self.reads().relative_linked(moving_series, options)
    }
}
