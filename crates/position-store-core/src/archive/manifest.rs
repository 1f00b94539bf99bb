//! The archive manifest: the list of partition files and their bounds.
//!
//! The manifest lives at `_archive/manifest.json` under the archive root and
//! is replaced atomically after every partition written, so it always lists
//! every partition that made it to disk. Partition ids are allocated from a
//! monotonic counter stored alongside the list.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    coverage::Coverage,
    error::{
        ArchiveStorageSnafu, ArchiveUnavailableSnafu, ManifestCorruptSnafu, ManifestEncodeSnafu,
        StoreResult,
    },
    formats::parquet::ArchiveCompression,
    storage::{self, ArchiveLocation, StorageError, layout},
};

/// Manifest layout version written by this crate.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Metadata for one immutable partition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    /// Monotonic partition id; also the file sequence number.
    pub id: u64,
    /// The single series stored in the file.
    pub series_id: String,
    /// Day partition key, when date partitioning was on.
    pub date: Option<NaiveDate>,
    /// Hour partition key, when hour partitioning was on.
    pub hour: Option<u32>,
    /// Archive-relative path, `/`-separated.
    pub path: String,
    /// Codec used for the file.
    pub compression: ArchiveCompression,
    /// Smallest timestamp in the file (storage microseconds).
    pub ts_min: i64,
    /// Largest timestamp in the file (storage microseconds).
    pub ts_max: i64,
    /// Number of rows.
    pub row_count: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Wall-clock time the file was written.
    pub exported_at: DateTime<Utc>,
    /// Hot-store write watermark taken before the export scanned its rows.
    ///
    /// Every hot row of the series inside `[ts_min, ts_max]` committed at or
    /// below this watermark is in the file. `None` for partitions written
    /// without one; readers then trust none of the range.
    #[serde(default)]
    pub hot_write_seq: Option<i64>,
}

impl PartitionMeta {
    /// Closed microsecond interval spanned by the file.
    pub fn micros_range(&self) -> RangeInclusive<i64> {
        self.ts_min..=self.ts_max
    }

    /// Archive-relative path as a [`PathBuf`].
    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// True when the file may hold rows inside `[lo, hi]`.
    pub fn overlaps(&self, lo: i64, hi: i64) -> bool {
        self.ts_min <= hi && lo <= self.ts_max
    }
}

/// Root metadata document of an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Layout version.
    pub format_version: u32,
    /// Id handed to the next partition written.
    pub next_partition_id: u64,
    /// Every partition, in id order.
    pub partitions: Vec<PartitionMeta>,
}

impl Default for ArchiveManifest {
    fn default() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            next_partition_id: 1,
            partitions: Vec::new(),
        }
    }
}

pub(crate) fn rel_path_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl ArchiveManifest {
    /// Load the manifest of an existing archive.
    ///
    /// A missing archive root is [`crate::error::ErrorKind::ArchiveUnavailable`];
    /// an existing root without a manifest is an empty archive.
    pub fn load(location: &ArchiveLocation) -> StoreResult<Self> {
        let root = location.root().display().to_string();
        ensure!(
            location.is_available(),
            ArchiveUnavailableSnafu {
                path: root,
                reason: "archive directory does not exist",
            }
        );

        let rel = layout::manifest_rel_path();
        let text = match storage::read_to_string(location, &rel) {
            Ok(text) => text,
            Err(StorageError::NotFound { .. }) => return Ok(Self::default()),
            Err(e) => {
                return ArchiveUnavailableSnafu {
                    path: e.path().to_string(),
                    reason: e.to_string(),
                }
                .fail();
            }
        };

        let path = location.resolve(&rel).display().to_string();
        let manifest: ArchiveManifest =
            serde_json::from_str(&text).context(ManifestCorruptSnafu { path: path.clone() })?;
        ensure!(
            manifest.format_version <= MANIFEST_FORMAT_VERSION,
            ArchiveUnavailableSnafu {
                path,
                reason: format!(
                    "unsupported manifest format version {}",
                    manifest.format_version
                ),
            }
        );
        Ok(manifest)
    }

    /// Atomically replace the manifest on disk.
    pub(crate) fn save(&self, location: &ArchiveLocation) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(self).context(ManifestEncodeSnafu)?;
        storage::write_atomic(location, &layout::manifest_rel_path(), &bytes)
            .context(ArchiveStorageSnafu)
    }

    /// Partitions holding rows of `series_id`, in id order.
    pub fn partitions_for<'a>(
        &'a self,
        series_id: &'a str,
    ) -> impl Iterator<Item = &'a PartitionMeta> + 'a {
        self.partitions
            .iter()
            .filter(move |p| p.series_id == series_id)
    }

    /// Union of the intervals spanned by the partitions of `series_id`.
    pub fn coverage(&self, series_id: &str) -> Coverage {
        Coverage::from_intervals(self.partitions_for(series_id).map(PartitionMeta::micros_range))
    }

    /// Distinct series present in the archive.
    pub fn series_ids(&self) -> BTreeSet<String> {
        self.partitions.iter().map(|p| p.series_id.clone()).collect()
    }

    /// Total rows across all partitions.
    pub fn total_rows(&self) -> u64 {
        self.partitions.iter().map(|p| p.row_count).sum()
    }
}
