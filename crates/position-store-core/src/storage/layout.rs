//! On-disk layout conventions.
//!
//! This module centralizes every *relative* path convention:
//! - the workspace data directory holding the hot-store file and the archive,
//! - the archive manifest (`_archive/manifest.json`),
//! - partition directories (`series/<series>/date=YYYY-MM-DD[/hour=HH]`) and
//!   partition file names (`part-<seq>.parquet`).
//!
//! The functions here return relative [`PathBuf`] values. Callers join them
//! with a workspace directory or an [`crate::storage::ArchiveLocation`].

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

// ====================
// Workspace layout
// ====================

/// Directory under a workspace holding all persisted engine state.
pub const WORKSPACE_DATA_DIR: &str = "data";

/// File name of the hot store inside the data directory.
pub const HOT_STORE_FILE_NAME: &str = "workspace.db";

/// Directory name of the archive inside the data directory.
pub const ARCHIVE_DIR_NAME: &str = "parquet";

/// `<workspace>/data/workspace.db`
pub fn hot_store_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir
        .join(WORKSPACE_DATA_DIR)
        .join(HOT_STORE_FILE_NAME)
}

/// `<workspace>/data/parquet`
pub fn archive_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(WORKSPACE_DATA_DIR).join(ARCHIVE_DIR_NAME)
}

// ====================
// Archive layout
// ====================

/// Directory holding archive bookkeeping files.
pub const ARCHIVE_META_DIR: &str = "_archive";

/// File name of the archive manifest.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Directory holding per-series partition trees.
pub const SERIES_DIR_NAME: &str = "series";

/// Directory used when date partitioning is disabled.
pub const UNPARTITIONED_DIR_NAME: &str = "all";

/// Number of digits used in zero-padded partition file names.
pub const PARTITION_SEQ_DIGITS: usize = 10;

/// Extension of partition files.
pub const PARTITION_EXT: &str = "parquet";

/// Relative path: `_archive/manifest.json`
pub fn manifest_rel_path() -> PathBuf {
    PathBuf::from(ARCHIVE_META_DIR).join(MANIFEST_FILE_NAME)
}

/// Encode a series id into a single safe path component.
///
/// ASCII letters, digits, `-` and `_` pass through, as does `.` anywhere but
/// the first position. Every other byte is percent-encoded, which keeps the
/// mapping injective and rules out `..` and path separators.
pub fn encode_path_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, byte) in raw.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Relative directory of one logical partition.
///
/// - `series/<series>/all` without date partitioning,
/// - `series/<series>/date=YYYY-MM-DD` with date partitioning,
/// - `series/<series>/date=YYYY-MM-DD/hour=HH` with hour sub-partitioning.
pub fn partition_dir_rel(series_id: &str, date: Option<NaiveDate>, hour: Option<u32>) -> PathBuf {
    let mut dir = PathBuf::from(SERIES_DIR_NAME).join(encode_path_component(series_id));
    match date {
        None => dir.push(UNPARTITIONED_DIR_NAME),
        Some(date) => {
            dir.push(format!("date={}", date.format("%Y-%m-%d")));
            if let Some(hour) = hour {
                dir.push(format!("hour={hour:02}"));
            }
        }
    }
    dir
}

/// Relative path of a partition file inside its partition directory.
pub fn partition_file_rel(partition_dir: &Path, seq: u64) -> PathBuf {
    partition_dir.join(format!(
        "part-{:0width$}.{PARTITION_EXT}",
        seq,
        width = PARTITION_SEQ_DIGITS
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_paths_use_data_directory() {
        let ws = Path::new("/tmp/ws");
        assert_eq!(hot_store_path(ws), Path::new("/tmp/ws/data/workspace.db"));
        assert_eq!(archive_dir(ws), Path::new("/tmp/ws/data/parquet"));
    }

    #[test]
    fn series_ids_are_encoded_into_one_component() {
        assert_eq!(encode_path_component("transit_2024"), "transit_2024");
        assert_eq!(encode_path_component("a/b"), "a%2Fb");
        assert_eq!(encode_path_component(".."), "%2E.");
        assert_eq!(encode_path_component("natal chart"), "natal%20chart");
    }

    #[test]
    fn partition_paths_follow_date_and_hour() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();

        assert_eq!(
            partition_dir_rel("s1", None, None),
            Path::new("series/s1/all")
        );
        assert_eq!(
            partition_dir_rel("s1", Some(date), None),
            Path::new("series/s1/date=2024-05-17")
        );

        let dir = partition_dir_rel("s1", Some(date), Some(7));
        assert_eq!(dir, Path::new("series/s1/date=2024-05-17/hour=07"));
        assert_eq!(
            partition_file_rel(&dir, 42),
            Path::new("series/s1/date=2024-05-17/hour=07/part-0000000042.parquet")
        );
    }
}
