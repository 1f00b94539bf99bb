//! Export hot-store ranges into partitioned Parquet files.
//!
//! Rows are streamed series by series from a hot-store scan, which yields
//! them in timestamp order, so rows sharing a partition key arrive
//! contiguously and only one partition is buffered at a time. Each finished
//! partition is written with create-new semantics and then recorded in the
//! manifest before the next one starts.

use chrono::{NaiveDate, Timelike, Utc};
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    archive::manifest::{ArchiveManifest, PartitionMeta, rel_path_string},
    cancel::CancellationToken,
    common::time_range::TimeRange,
    error::{ArchiveStorageSnafu, StoreError, StoreResult},
    formats::parquet::{ArchiveCompression, encode_samples},
    hot_store::{HotStore, SampleFilter},
    sample::Sample,
    storage::{self, ArchiveLocation, StorageError, layout},
};

/// Which hot-store rows to export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSelection {
    /// Export only this series.
    pub series_id: Option<String>,
    /// Export only rows inside this closed range.
    pub time_range: Option<TimeRange>,
}

impl ExportSelection {
    /// Everything in the hot store.
    pub fn all() -> Self {
        Self::default()
    }

    /// One series, optionally bounded in time.
    pub fn series(series_id: impl Into<String>, time_range: Option<TimeRange>) -> Self {
        Self {
            series_id: Some(series_id.into()),
            time_range,
        }
    }

    pub(crate) fn to_filter(&self) -> SampleFilter {
        SampleFilter {
            series_id: self.series_id.clone(),
            time_range: self.time_range,
            ..SampleFilter::default()
        }
    }
}

/// How exported rows are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    /// Group rows by UTC day.
    pub partition_by_date: bool,
    /// Further group rows by UTC hour. Implies date partitioning.
    pub partition_by_hour: bool,
    /// Codec for every file written.
    pub compression: ArchiveCompression,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            partition_by_date: true,
            partition_by_hour: false,
            compression: ArchiveCompression::default(),
        }
    }
}

/// Outcome of an export call.
///
/// Partitions listed here are on disk and in the manifest even when `failed`
/// is set or the export was cancelled.
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Partitions written by this call, in write order.
    pub partitions: Vec<PartitionMeta>,
    /// Rows across `partitions`.
    pub rows_exported: u64,
    /// The error that stopped the export, if any.
    pub failed: Option<StoreError>,
    /// True if a cancellation request stopped the export.
    pub cancelled: bool,
}

impl ExportReport {
    /// Archive-relative paths of the written partitions.
    pub fn paths(&self) -> Vec<&str> {
        self.partitions.iter().map(|p| p.path.as_str()).collect()
    }

    /// True when every selected row was exported.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && !self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartitionKey {
    date: Option<NaiveDate>,
    hour: Option<u32>,
}

impl PartitionKey {
    fn of(sample: &Sample, options: &ExportOptions) -> Self {
        let ts = sample.timestamp;
        if options.partition_by_hour {
            PartitionKey {
                date: Some(ts.date_naive()),
                hour: Some(ts.hour()),
            }
        } else if options.partition_by_date {
            PartitionKey {
                date: Some(ts.date_naive()),
                hour: None,
            }
        } else {
            PartitionKey {
                date: None,
                hour: None,
            }
        }
    }
}

struct Exporter<'a> {
    location: &'a ArchiveLocation,
    options: &'a ExportOptions,
    hot_write_seq: i64,
    manifest: ArchiveManifest,
    report: ExportReport,
}

impl Exporter<'_> {
    fn write_partition(&mut self, series_id: &str, key: PartitionKey, rows: &[Sample]) -> StoreResult<()> {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(());
        };
        let dir = layout::partition_dir_rel(series_id, key.date, key.hour);

        let mut id = self.manifest.next_partition_id;
        let mut rel = layout::partition_file_rel(&dir, id);
        let bytes = encode_samples(rows, self.options.compression, &rel_path_string(&rel))?;
        loop {
            match storage::write_new(self.location, &rel, &bytes) {
                Ok(()) => break,
                // A file the manifest does not know about; never overwrite it.
                Err(StorageError::AlreadyExists { .. }) => {
                    warn!("partition file {} already exists; skipping id {id}", rel.display());
                    id += 1;
                    rel = layout::partition_file_rel(&dir, id);
                }
                Err(e) => return Err(e).context(ArchiveStorageSnafu),
            }
        }

        let meta = PartitionMeta {
            id,
            series_id: series_id.to_string(),
            date: key.date,
            hour: key.hour,
            path: rel_path_string(&rel),
            compression: self.options.compression,
            ts_min: first.timestamp_micros(),
            ts_max: last.timestamp_micros(),
            row_count: rows.len() as u64,
            file_size: bytes.len() as u64,
            exported_at: Utc::now(),
            hot_write_seq: Some(self.hot_write_seq),
        };

        self.manifest.next_partition_id = id + 1;
        self.manifest.partitions.push(meta.clone());
        self.manifest.save(self.location)?;

        debug!("wrote partition {} ({} rows)", meta.path, meta.row_count);
        self.report.rows_exported += meta.row_count;
        self.report.partitions.push(meta);
        Ok(())
    }

    fn flush(
        &mut self,
        series_id: &str,
        key: PartitionKey,
        rows: &mut Vec<Sample>,
        cancel: Option<&CancellationToken>,
    ) -> StoreResult<bool> {
        if rows.is_empty() {
            return Ok(true);
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            self.report.cancelled = true;
            return Ok(false);
        }
        self.write_partition(series_id, key, rows)?;
        rows.clear();
        Ok(true)
    }

    fn export_series(
        &mut self,
        hot: &HotStore,
        series_id: &str,
        base: &SampleFilter,
        cancel: Option<&CancellationToken>,
    ) -> StoreResult<bool> {
        let filter = SampleFilter {
            series_id: Some(series_id.to_string()),
            ..base.clone()
        };

        let mut current: Option<PartitionKey> = None;
        let mut rows: Vec<Sample> = Vec::new();
        for sample in hot.scan(&filter) {
            let sample = sample?;
            let key = PartitionKey::of(&sample, self.options);
            if let Some(prev) = current.filter(|prev| *prev != key) {
                if !self.flush(series_id, prev, &mut rows, cancel)? {
                    return Ok(false);
                }
            }
            current = Some(key);
            rows.push(sample);
        }

        match current {
            Some(key) => self.flush(series_id, key, &mut rows, cancel),
            None => Ok(true),
        }
    }
}

/// Export the rows matched by `selection` into `location`.
///
/// Never returns an error directly: failures and cancellation are recorded on
/// the report next to the partitions that were written before them.
pub fn export(
    hot: &HotStore,
    location: &ArchiveLocation,
    selection: &ExportSelection,
    options: &ExportOptions,
    cancel: Option<&CancellationToken>,
) -> ExportReport {
    let mut report = ExportReport::default();

    if let Err(e) = storage::ensure_root(location).context(ArchiveStorageSnafu) {
        report.failed = Some(e);
        return report;
    }
    let manifest = match ArchiveManifest::load(location) {
        Ok(manifest) => manifest,
        Err(e) => {
            report.failed = Some(e);
            return report;
        }
    };

    // Taken before any row is read: everything at or below it is visible to
    // the scans that follow.
    let hot_write_seq = match hot.write_watermark() {
        Ok(seq) => seq,
        Err(e) => {
            report.failed = Some(e);
            return report;
        }
    };

    let filter = selection.to_filter();
    let series_ids = match hot.series_ids(&filter) {
        Ok(ids) => ids,
        Err(e) => {
            report.failed = Some(e);
            return report;
        }
    };

    let mut exporter = Exporter {
        location,
        options,
        hot_write_seq,
        manifest,
        report,
    };
    for series_id in &series_ids {
        match exporter.export_series(hot, series_id, &filter, cancel) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "export cancelled after {} partitions",
                    exporter.report.partitions.len()
                );
                break;
            }
            Err(e) => {
                warn!("export stopped at series {series_id:?}: {e}");
                exporter.report.failed = Some(e);
                break;
            }
        }
    }

    let report = exporter.report;
    info!(
        "exported {} rows into {} partitions under {}",
        report.rows_exported,
        report.partitions.len(),
        location.root().display()
    );
    report
}
