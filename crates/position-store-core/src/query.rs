//! Read routing over the hot store and the archive.
//!
//! A query names an optional series, object and closed time range plus a
//! [`SourcePreference`]. Under [`SourcePreference::Auto`] the router asks the
//! hot store for a row count and hands it to [`estimate_and_route`]; large
//! reads go to the archive, and every sub-range the archive does not cover
//! is filled from the hot store. Inside covered ranges the hot store is still
//! consulted for rows committed after the covering partition was exported.
//! Rows are merged by `(series_id, timestamp, object_id)` with the hot copy
//! winning, and come back ordered by `(timestamp, object_id, series_id)`
//! whatever their source.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    archive::{self, ArchiveManifest, PartitionMeta},
    common::time_range::TimeRange,
    error::{ArchiveUnavailableSnafu, InvalidTimeRangeSnafu, StoreResult},
    hot_store::{HotStore, SampleFilter},
    sample::{Sample, SampleKey},
    storage::ArchiveLocation,
};

/// Caller's choice of physical source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePreference {
    /// Let [`estimate_and_route`] decide.
    #[default]
    Auto,
    /// Read the hot store only.
    HotOnly,
    /// Read the archive only; fail if it is unavailable.
    ArchiveOnly,
}

/// Everything the routing policy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingInputs {
    /// Caller preference.
    pub preference: SourcePreference,
    /// Matching rows according to the hot store.
    pub estimated_rows: u64,
    /// Estimates below this are served from the hot store.
    pub row_threshold: u64,
    /// Whether an archive location is configured for the query.
    pub archive_configured: bool,
}

/// Physical plan chosen for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Serve everything from the hot store.
    Hot,
    /// Serve covered ranges from the archive and the rest from the hot store.
    ArchiveWithHotFill,
    /// Serve from the archive alone.
    ArchiveOnly,
}

/// The routing policy.
///
/// Pure: it performs no I/O, so it can be tested in isolation.
pub fn estimate_and_route(inputs: &RoutingInputs) -> RouteDecision {
    match inputs.preference {
        SourcePreference::HotOnly => RouteDecision::Hot,
        SourcePreference::ArchiveOnly => RouteDecision::ArchiveOnly,
        SourcePreference::Auto => {
            if !inputs.archive_configured || inputs.estimated_rows < inputs.row_threshold {
                RouteDecision::Hot
            } else {
                RouteDecision::ArchiveWithHotFill
            }
        }
    }
}

/// Split `[lo, hi]` into windows of uniform archive freshness.
///
/// A window carries the highest hot-store watermark among the partitions
/// covering it; hot rows committed above it are newer than every archived
/// copy. Windows no partition covers are left out. A `None` watermark means
/// no covering partition recorded one, so every hot row in the window counts.
fn late_write_windows<'p>(
    partitions: impl Iterator<Item = &'p PartitionMeta>,
    (lo, hi): (i64, i64),
) -> Vec<(i64, i64, Option<i64>)> {
    let spans: Vec<(i64, i64, Option<i64>)> = partitions
        .filter(|p| p.overlaps(lo, hi))
        .map(|p| (p.ts_min.max(lo), p.ts_max.min(hi), p.hot_write_seq))
        .collect();

    let mut cuts: Vec<i128> = spans
        .iter()
        .flat_map(|&(start, end, _)| [i128::from(start), i128::from(end) + 1])
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut windows: Vec<(i64, i64, Option<i64>)> = Vec::new();
    for pair in cuts.windows(2) {
        // Cuts lie in [lo, hi + 1], so both ends fit in i64.
        let (start, end) = (pair[0] as i64, (pair[1] - 1) as i64);
        let marks: Vec<Option<i64>> = spans
            .iter()
            .filter(|&&(s, e, _)| s <= start && end <= e)
            .map(|&(_, _, mark)| mark)
            .collect();
        let Some(mark) = marks.into_iter().max() else {
            continue;
        };
        match windows.last_mut() {
            Some(last) if last.2 == mark && i128::from(last.1) + 1 == i128::from(start) => {
                last.1 = end;
            }
            _ => windows.push((start, end, mark)),
        }
    }
    windows
}

/// One logical read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    /// Restrict to one series.
    pub series_id: Option<String>,
    /// Restrict to one object.
    pub object_id: Option<String>,
    /// Restrict to a closed time range.
    pub time_range: Option<TimeRange>,
    /// Physical source preference.
    pub preference: SourcePreference,
    /// Read this archive instead of the configured one.
    pub archive_location: Option<PathBuf>,
}

impl QueryRequest {
    /// Everything, routed automatically.
    pub fn all() -> Self {
        Self::default()
    }

    /// One series, routed automatically.
    pub fn series(series_id: impl Into<String>) -> Self {
        Self {
            series_id: Some(series_id.into()),
            ..Self::default()
        }
    }

    /// Restrict to one object.
    pub fn with_object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    /// Restrict to a closed time range.
    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Set the source preference.
    pub fn with_preference(mut self, preference: SourcePreference) -> Self {
        self.preference = preference;
        self
    }

    /// Read a specific archive directory.
    pub fn with_archive_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_location = Some(path.into());
        self
    }

    fn filter(&self) -> SampleFilter {
        SampleFilter {
            series_id: self.series_id.clone(),
            object_id: self.object_id.clone(),
            time_range: self.time_range,
            ..SampleFilter::default()
        }
    }
}

/// Which store(s) produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    /// Only the hot store.
    Hot,
    /// Only the archive.
    Archive,
    /// Both.
    Merged,
}

/// Rows returned by [`QueryRouter::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Matching samples ordered by `(timestamp, object_id, series_id)`.
    pub samples: Vec<Sample>,
    /// Physical source of the rows.
    pub served_from: ServedFrom,
    /// Non-fatal problems, such as an archive fall-back.
    pub warnings: Vec<String>,
}

impl QueryResult {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no row matched.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Default)]
struct Merge {
    rows: BTreeMap<SampleKey, Sample>,
    used_hot: bool,
    used_archive: bool,
}

impl Merge {
    fn finish(self, warnings: Vec<String>) -> QueryResult {
        let served_from = match (self.used_hot, self.used_archive) {
            (_, false) => ServedFrom::Hot,
            (false, true) => ServedFrom::Archive,
            (true, true) => ServedFrom::Merged,
        };
        QueryResult {
            samples: self.rows.into_values().collect(),
            served_from,
            warnings,
        }
    }
}

/// Single logical read interface over both stores.
#[derive(Debug)]
pub struct QueryRouter<'a> {
    hot: &'a HotStore,
    archive: Option<ArchiveLocation>,
    row_threshold: u64,
}

impl<'a> QueryRouter<'a> {
    /// Router over `hot` and the optional archive at `archive`.
    pub fn new(hot: &'a HotStore, archive: Option<ArchiveLocation>, row_threshold: u64) -> Self {
        Self {
            hot,
            archive,
            row_threshold,
        }
    }

    /// Serve `request`.
    pub fn query(&self, request: &QueryRequest) -> StoreResult<QueryResult> {
        let location = request
            .archive_location
            .clone()
            .map(ArchiveLocation::local)
            .or_else(|| self.archive.clone());
        let filter = request.filter();

        let estimated_rows = match request.preference {
            SourcePreference::Auto => self.hot.count(&filter)?,
            _ => 0,
        };
        let decision = estimate_and_route(&RoutingInputs {
            preference: request.preference,
            estimated_rows,
            row_threshold: self.row_threshold,
            archive_configured: location.is_some(),
        });
        debug!("routing query {request:?}: {estimated_rows} rows estimated, {decision:?}");

        match (decision, location) {
            (RouteDecision::Hot, _) | (RouteDecision::ArchiveWithHotFill, None) => {
                self.hot_only(&filter, Vec::new())
            }
            (RouteDecision::ArchiveOnly, None) => ArchiveUnavailableSnafu {
                path: "<none>",
                reason: "no archive location configured",
            }
            .fail(),
            (RouteDecision::ArchiveOnly, Some(location)) => self.archive_only(request, &location),
            (RouteDecision::ArchiveWithHotFill, Some(location)) if !location.is_available() => {
                debug!(
                    "archive at {} not created yet, serving from hot store",
                    location.root().display()
                );
                self.hot_only(&filter, Vec::new())
            }
            (RouteDecision::ArchiveWithHotFill, Some(location)) => {
                match self.archive_with_fill(request, &location) {
                    Ok(result) => Ok(result),
                    Err(e) => {
                        warn!("archive at {} unusable, serving from hot store: {e}", location.root().display());
                        self.hot_only(&filter, vec![format!("archive unavailable, served from hot store: {e}")])
                    }
                }
            }
        }
    }

    fn hot_only(&self, filter: &SampleFilter, warnings: Vec<String>) -> StoreResult<QueryResult> {
        let mut merge = Merge::default();
        self.fill_from_hot(filter, &mut merge)?;
        merge.used_hot = true;
        Ok(merge.finish(warnings))
    }

    fn fill_from_hot(&self, filter: &SampleFilter, merge: &mut Merge) -> StoreResult<()> {
        for sample in self.hot.scan(filter) {
            let sample = sample?;
            merge.used_hot = true;
            merge.rows.insert(sample.key(), sample);
        }
        Ok(())
    }

    fn request_bounds(request: &QueryRequest) -> Option<(i64, i64)> {
        request
            .time_range
            .map(|r| (r.start_micros(), r.end_micros()))
    }

    fn archive_only(&self, request: &QueryRequest, location: &ArchiveLocation) -> StoreResult<QueryResult> {
        let manifest = ArchiveManifest::load(location)?;
        let series: BTreeSet<String> = match &request.series_id {
            Some(id) => BTreeSet::from([id.clone()]),
            None => manifest.series_ids(),
        };

        let mut merge = Merge {
            used_archive: true,
            ..Merge::default()
        };
        for series_id in &series {
            archive::read_series_into(
                location,
                &manifest,
                series_id,
                Self::request_bounds(request),
                request.object_id.as_deref(),
                &mut merge.rows,
            )?;
        }
        Ok(merge.finish(Vec::new()))
    }

    /// Closed bounds the series must be served over.
    fn series_bounds(
        &self,
        request: &QueryRequest,
        manifest: &ArchiveManifest,
        series_id: &str,
    ) -> StoreResult<Option<(i64, i64)>> {
        if let Some(bounds) = Self::request_bounds(request) {
            return Ok(Some(bounds));
        }
        let hot = self
            .hot
            .time_bounds(&SampleFilter::for_series(series_id))?
            .map(|r| (r.start_micros(), r.end_micros()));
        let archived = manifest
            .partitions_for(series_id)
            .map(|p| (p.ts_min, p.ts_max))
            .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1)));
        Ok(match (hot, archived) {
            (Some(a), Some(b)) => Some((a.0.min(b.0), a.1.max(b.1))),
            (a, b) => a.or(b),
        })
    }

    /// Re-read hot rows committed after the archive copy of their range.
    ///
    /// Inserted after the archive rows, so they replace archived copies of
    /// the same key and add objects the archive never saw.
    fn overlay_late_writes(
        &self,
        base: &SampleFilter,
        manifest: &ArchiveManifest,
        series_id: &str,
        bounds: (i64, i64),
        merge: &mut Merge,
    ) -> StoreResult<()> {
        for (start, end, watermark) in late_write_windows(manifest.partitions_for(series_id), bounds) {
            let range = TimeRange::from_micros_bounds(start, end).context(InvalidTimeRangeSnafu)?;
            let filter = SampleFilter {
                series_id: Some(series_id.to_string()),
                time_range: Some(range),
                written_after: watermark,
                ..base.clone()
            };
            self.fill_from_hot(&filter, merge)?;
        }
        Ok(())
    }

    fn archive_with_fill(&self, request: &QueryRequest, location: &ArchiveLocation) -> StoreResult<QueryResult> {
        let manifest = ArchiveManifest::load(location)?;
        let base = request.filter();

        let mut series: BTreeSet<String> = self.hot.series_ids(&base)?.into_iter().collect();
        match &request.series_id {
            Some(id) => {
                if manifest.partitions_for(id).next().is_some() {
                    series.insert(id.clone());
                }
            }
            None => series.extend(manifest.series_ids()),
        }

        let mut merge = Merge::default();
        for series_id in &series {
            let Some((lo, hi)) = self.series_bounds(request, &manifest, series_id)? else {
                continue;
            };
            let coverage = manifest.coverage(series_id);
            if !coverage.covered_runs(lo..=hi).is_empty() {
                archive::read_series_into(
                    location,
                    &manifest,
                    series_id,
                    Some((lo, hi)),
                    request.object_id.as_deref(),
                    &mut merge.rows,
                )?;
                merge.used_archive = true;
                self.overlay_late_writes(&base, &manifest, series_id, (lo, hi), &mut merge)?;
            }
            if coverage.covers(lo..=hi) {
                continue;
            }

            for gap in coverage.missing_runs(lo..=hi) {
                let range = TimeRange::from_micros_bounds(*gap.start(), *gap.end())
                    .context(InvalidTimeRangeSnafu)?;
                let filter = SampleFilter {
                    series_id: Some(series_id.clone()),
                    time_range: Some(range),
                    ..base.clone()
                };
                self.fill_from_hot(&filter, &mut merge)?;
            }
        }

        debug!(
            "merged query over {} series: hot={}, archive={}",
            series.len(),
            merge.used_hot,
            merge.used_archive
        );
        Ok(merge.finish(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(preference: SourcePreference, estimated_rows: u64, archive_configured: bool) -> RoutingInputs {
        RoutingInputs {
            preference,
            estimated_rows,
            row_threshold: 1_000,
            archive_configured,
        }
    }

    fn partition(id: u64, lo: i64, hi: i64, mark: Option<i64>) -> PartitionMeta {
        PartitionMeta {
            id,
            series_id: "s1".to_string(),
            date: None,
            hour: None,
            path: format!("series/s1/all/part-{id:010}.parquet"),
            compression: Default::default(),
            ts_min: lo,
            ts_max: hi,
            row_count: 1,
            file_size: 1,
            exported_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            hot_write_seq: mark,
        }
    }

    #[test]
    fn newest_covering_partition_sets_the_window_watermark() {
        let parts = [
            partition(1, 0, 99, Some(3)),
            partition(2, 50, 149, Some(8)),
            partition(3, 300, 399, None),
        ];

        let windows = late_write_windows(parts.iter(), (10, 349));

        assert_eq!(
            windows,
            vec![(10, 49, Some(3)), (50, 149, Some(8)), (300, 349, None)]
        );
    }

    #[test]
    fn unrecorded_watermark_defers_to_a_recorded_one() {
        let parts = [partition(1, 0, 9, None), partition(2, 0, 9, Some(4))];
        assert_eq!(late_write_windows(parts.iter(), (0, 9)), vec![(0, 9, Some(4))]);
        assert!(late_write_windows(parts.iter(), (20, 29)).is_empty());
    }

    #[test]
    fn explicit_preferences_win() {
        assert_eq!(
            estimate_and_route(&inputs(SourcePreference::HotOnly, 1_000_000, true)),
            RouteDecision::Hot
        );
        assert_eq!(
            estimate_and_route(&inputs(SourcePreference::ArchiveOnly, 0, false)),
            RouteDecision::ArchiveOnly
        );
    }

    #[test]
    fn auto_uses_threshold_and_archive_presence() {
        assert_eq!(
            estimate_and_route(&inputs(SourcePreference::Auto, 999, true)),
            RouteDecision::Hot
        );
        assert_eq!(
            estimate_and_route(&inputs(SourcePreference::Auto, 1_000, true)),
            RouteDecision::ArchiveWithHotFill
        );
        assert_eq!(
            estimate_and_route(&inputs(SourcePreference::Auto, 1_000_000, false)),
            RouteDecision::Hot
        );
    }
}
