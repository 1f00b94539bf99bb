//! Engine configuration.
//!
//! [`EngineConfig`] deserializes from any serde format with every field
//! defaulted, so an embedding application may persist only the settings it
//! overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{InvalidConfigSnafu, StoreResult},
    formats::parquet::ArchiveCompression,
    storage::layout,
};

/// Default number of samples committed per hot-store transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Default number of rows one ingest must exceed before it auto-exports.
pub const DEFAULT_PARQUET_THRESHOLD: u64 = 100;

/// Default estimated row count at or above which AUTO reads the archive.
pub const DEFAULT_ROUTE_ROW_THRESHOLD: u64 = 1_000;

/// Default size of the angular circle used by derived computations.
pub const DEFAULT_CIRCLE_SIZE: f64 = 360.0;

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Settings for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite hot-store file.
    pub hot_store_path: PathBuf,
    /// Archive root directory; `None` disables archival and archive routing.
    pub archive_dir: Option<PathBuf>,
    /// Samples per hot-store transaction during ingest.
    pub batch_size: usize,
    /// Rows an ingest must exceed to trigger an automatic export.
    pub parquet_threshold: u64,
    /// Export automatically after large ingests.
    pub auto_export: bool,
    /// Sub-partition automatic exports by hour.
    pub auto_export_partition_by_hour: bool,
    /// Codec used by automatic exports.
    pub compression: ArchiveCompression,
    /// Row estimate at or above which AUTO queries read the archive.
    pub route_row_threshold: u64,
    /// Angular circle size for derived computations.
    pub circle_size: f64,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hot_store_path: PathBuf::from(layout::WORKSPACE_DATA_DIR)
                .join(layout::HOT_STORE_FILE_NAME),
            archive_dir: Some(
                PathBuf::from(layout::WORKSPACE_DATA_DIR).join(layout::ARCHIVE_DIR_NAME),
            ),
            batch_size: DEFAULT_BATCH_SIZE,
            parquet_threshold: DEFAULT_PARQUET_THRESHOLD,
            auto_export: true,
            auto_export_partition_by_hour: false,
            compression: ArchiveCompression::default(),
            route_row_threshold: DEFAULT_ROUTE_ROW_THRESHOLD,
            circle_size: DEFAULT_CIRCLE_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at a workspace directory:
    /// `<dir>/data/workspace.db` and `<dir>/data/parquet`.
    pub fn for_workspace(workspace_dir: impl AsRef<Path>) -> Self {
        let dir = workspace_dir.as_ref();
        Self {
            hot_store_path: layout::hot_store_path(dir),
            archive_dir: Some(layout::archive_dir(dir)),
            ..Self::default()
        }
    }

    /// Override the ingest chunk size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Override the auto-export threshold.
    pub fn with_parquet_threshold(mut self, threshold: u64) -> Self {
        self.parquet_threshold = threshold;
        self
    }

    /// Enable or disable automatic export.
    pub fn with_auto_export(mut self, enabled: bool) -> Self {
        self.auto_export = enabled;
        self
    }

    /// Override the AUTO routing threshold.
    pub fn with_route_row_threshold(mut self, threshold: u64) -> Self {
        self.route_row_threshold = threshold;
        self
    }

    /// Override or disable the archive directory.
    pub fn with_archive_dir(mut self, archive_dir: Option<PathBuf>) -> Self {
        self.archive_dir = archive_dir;
        self
    }

    /// Override the auto-export codec.
    pub fn with_compression(mut self, compression: ArchiveCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Reject settings no engine can run with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.batch_size == 0 {
            return InvalidConfigSnafu {
                message: "batch_size must be greater than zero",
            }
            .fail();
        }
        if !(self.circle_size.is_finite() && self.circle_size > 0.0) {
            return InvalidConfigSnafu {
                message: format!("circle_size must be positive, got {}", self.circle_size),
            }
            .fail();
        }
        if self.hot_store_path.as_os_str().is_empty() {
            return InvalidConfigSnafu {
                message: "hot_store_path must not be empty",
            }
            .fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn partial_json_keeps_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "batch_size": 250, "compression": "zstd" }"#)?;

        assert_eq!(cfg.batch_size, 250);
        assert_eq!(cfg.compression, ArchiveCompression::Zstd);
        assert_eq!(cfg.parquet_threshold, DEFAULT_PARQUET_THRESHOLD);
        assert!(cfg.auto_export);
        Ok(())
    }

    #[test]
    fn workspace_config_uses_fixed_layout() {
        let cfg = EngineConfig::for_workspace("/srv/ws");
        assert_eq!(cfg.hot_store_path, Path::new("/srv/ws/data/workspace.db"));
        assert_eq!(cfg.archive_dir.as_deref(), Some(Path::new("/srv/ws/data/parquet")));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = EngineConfig::default()
            .with_batch_size(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
