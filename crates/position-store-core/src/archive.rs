//! The columnar archive: immutable Parquet partitions plus a manifest.
//!
//! Writing happens through [`export::export`]; reading goes through
//! [`read_series`], which consults the manifest to prune partitions by time
//! range before decoding any file. Re-exporting an interval produces new
//! partitions next to the old ones; readers resolve duplicate keys in favour
//! of the partition with the higher id.

pub mod export;
pub mod manifest;

use std::collections::BTreeMap;

use bytes::Bytes;
use log::debug;

use crate::{
    error::{ArchiveUnavailableSnafu, StoreResult},
    formats::parquet::{DecodeFilter, decode_samples},
    sample::{Sample, SampleKey},
    storage::{self, ArchiveLocation},
};

pub use export::{ExportOptions, ExportReport, ExportSelection};
pub use manifest::{ArchiveManifest, MANIFEST_FORMAT_VERSION, PartitionMeta};

/// Decode every partition of `series_id` overlapping `bounds` into `out`.
///
/// `bounds` are inclusive storage microseconds. Rows from later partitions
/// replace rows with the same key from earlier ones.
pub(crate) fn read_series_into(
    location: &ArchiveLocation,
    manifest: &ArchiveManifest,
    series_id: &str,
    bounds: Option<(i64, i64)>,
    object_id: Option<&str>,
    out: &mut BTreeMap<SampleKey, Sample>,
) -> StoreResult<()> {
    let filter = DecodeFilter {
        time_bounds: bounds,
        object_id,
    };

    for partition in manifest.partitions_for(series_id) {
        if let Some((lo, hi)) = bounds {
            if !partition.overlaps(lo, hi) {
                continue;
            }
        }

        let bytes = storage::read_all_bytes(location, &partition.rel_path()).map_err(|e| {
            ArchiveUnavailableSnafu {
                path: e.path().to_string(),
                reason: e.to_string(),
            }
            .build()
        })?;
        let rows = decode_samples(Bytes::from(bytes), &filter, &partition.path)?;
        debug!("partition {} yielded {} rows", partition.path, rows.len());
        for row in rows {
            out.insert(row.key(), row);
        }
    }
    Ok(())
}

/// Read the archived rows of one series, ordered by
/// `(timestamp, object_id)`.
pub fn read_series(
    location: &ArchiveLocation,
    series_id: &str,
    bounds: Option<(i64, i64)>,
    object_id: Option<&str>,
) -> StoreResult<Vec<Sample>> {
    let manifest = ArchiveManifest::load(location)?;
    let mut rows = BTreeMap::new();
    read_series_into(location, &manifest, series_id, bounds, object_id, &mut rows)?;
    Ok(rows.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::common::time_range::TimeRange;
    use crate::error::ErrorKind;
    use crate::formats::parquet::ArchiveCompression;
    use crate::hot_store::SampleFilter;
    use crate::test_util::*;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn export_groups_rows_by_day() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();
        let batch: Vec<_> = (0..4)
            .map(|h| sample_at("s1", start + Duration::hours(h), "sun", h as f64))
            .collect();
        hot.upsert_batch(&batch)?;

        let location = ArchiveLocation::local(tmp.path().join("archive"));
        let report = export::export(
            &hot,
            &location,
            &ExportSelection::series("s1", None),
            &ExportOptions::default(),
            None,
        );

        assert!(report.is_complete(), "{:?}", report.failed);
        assert_eq!(report.rows_exported, 4);
        assert_eq!(
            report.paths(),
            vec![
                "series/s1/date=2024-03-01/part-0000000001.parquet",
                "series/s1/date=2024-03-02/part-0000000002.parquet",
            ]
        );

        let back = read_series(&location, "s1", None, None)?;
        assert_eq!(back, batch);
        Ok(())
    }

    #[test]
    fn hour_partitioning_and_codec_are_honoured() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        let batch: Vec<_> = (0..120)
            .map(|m| sample_at("s1", minute(m), "moon", m as f64))
            .collect();
        hot.upsert_batch(&batch)?;

        let location = ArchiveLocation::local(tmp.path().join("archive"));
        let options = ExportOptions {
            partition_by_hour: true,
            compression: ArchiveCompression::Zstd,
            ..ExportOptions::default()
        };
        let report = export::export(&hot, &location, &ExportSelection::all(), &options, None);

        assert_eq!(report.partitions.len(), 2);
        assert!(report.partitions.iter().all(|p| p.hour.is_some()));
        assert!(report.partitions.iter().all(|p| p.compression == ArchiveCompression::Zstd));
        assert_eq!(report.partitions[0].row_count, 60);
        Ok(())
    }

    #[test]
    fn empty_selection_writes_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let hot = open_store(&tmp)?;
        let location = ArchiveLocation::local(tmp.path().join("archive"));

        let report = export::export(&hot, &location, &ExportSelection::all(), &ExportOptions::default(), None);

        assert!(report.is_complete());
        assert!(report.partitions.is_empty());
        assert_eq!(ArchiveManifest::load(&location)?.partitions.len(), 0);
        Ok(())
    }

    #[test]
    fn reexport_appends_a_new_partition() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        hot.upsert(&sample_at("s1", minute(0), "sun", 1.0))?;
        let location = ArchiveLocation::local(tmp.path().join("archive"));
        let selection = ExportSelection::all();

        export::export(&hot, &location, &selection, &ExportOptions::default(), None);
        hot.upsert(&sample_at("s1", minute(0), "sun", 2.0))?;
        export::export(&hot, &location, &selection, &ExportOptions::default(), None);

        let manifest = ArchiveManifest::load(&location)?;
        assert_eq!(manifest.partitions.len(), 2);
        assert_eq!(manifest.next_partition_id, 3);
        let marks: Vec<_> = manifest.partitions.iter().map(|p| p.hot_write_seq).collect();
        assert_eq!(marks, vec![Some(1), Some(2)]);

        let rows = read_series(&location, "s1", None, None)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].primary_value, 2.0);
        Ok(())
    }

    #[test]
    fn cancelled_export_keeps_written_partitions_listed() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        hot.upsert(&sample_at("s1", minute(0), "sun", 1.0))?;
        let location = ArchiveLocation::local(tmp.path().join("archive"));

        let token = CancellationToken::new();
        token.cancel();
        let report = export::export(
            &hot,
            &location,
            &ExportSelection::all(),
            &ExportOptions::default(),
            Some(&token),
        );

        assert!(report.cancelled);
        assert!(report.partitions.is_empty());
        assert_eq!(hot.count(&SampleFilter::all())?, 1);
        Ok(())
    }

    #[test]
    fn missing_partition_file_is_archive_unavailable() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        hot.upsert(&sample_at("s1", minute(0), "sun", 1.0))?;
        let location = ArchiveLocation::local(tmp.path().join("archive"));
        let report = export::export(&hot, &location, &ExportSelection::all(), &ExportOptions::default(), None);
        std::fs::remove_file(location.resolve(&report.partitions[0].rel_path()))?;

        let range = TimeRange::instant(minute(0));
        let bounds = Some((range.start_micros(), range.end_micros()));
        let err = read_series(&location, "s1", bounds, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveUnavailable);
        Ok(())
    }
}
