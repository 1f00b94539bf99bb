//! Error taxonomy for the public engine surface.
//!
//! Every fallible public operation returns [`StoreError`]. Each variant maps
//! onto exactly one [`ErrorKind`], which is what callers branch on when
//! deciding whether to retry, fix their input, or report a missing archive.
//! Context selectors are `pub(crate)` so sibling modules attach context
//! without re-exporting them.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::{Backtrace, prelude::*};

use crate::{
    common::time_range::TimeRangeError, sample::SampleValidationError, storage::StorageError,
};

/// Convenience alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input shape. A caller error; never retried automatically.
    Validation,
    /// Filesystem or transactional failure. Retryable by the caller.
    StorageIo,
    /// The archive is missing or corrupt where it was explicitly required.
    ArchiveUnavailable,
    /// A relative query named a reference series with no reference rows.
    EmptyReference,
}

/// Errors from engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// A sample failed shape validation. `index` is its position inside a
    /// batch, when the sample came from one.
    #[snafu(display("Invalid sample{}: {source}", index.map(|i| format!(" at batch index {i}")).unwrap_or_default()))]
    InvalidSample {
        /// Position within the rejected batch.
        index: Option<usize>,
        /// What was wrong with the sample.
        source: SampleValidationError,
    },

    /// A caller-supplied time range is malformed.
    #[snafu(display("Invalid time range: {source}"))]
    InvalidTimeRange {
        /// Underlying range error.
        source: TimeRangeError,
    },

    /// The engine configuration is unusable.
    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig {
        /// Which setting is wrong and why.
        message: String,
    },

    /// A relationship definition is unusable (for example, a negative orb).
    #[snafu(display("Invalid relationship definition {name:?}: {message}"))]
    InvalidDefinition {
        /// Name of the offending definition.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// The SQLite hot store failed.
    #[snafu(display("Hot store error while {operation}: {source}"))]
    HotStore {
        /// Short description of the failing operation.
        operation: &'static str,
        /// Underlying SQLite error.
        source: rusqlite::Error,
        /// Captured backtrace.
        backtrace: Backtrace,
    },

    /// The hot-store file's directory could not be created.
    #[snafu(display("Failed to prepare hot store directory {path}: {source}"))]
    HotStorePath {
        /// Directory that could not be created.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
        /// Captured backtrace.
        backtrace: Backtrace,
    },

    /// Reading or writing archive files failed.
    #[snafu(display("Archive storage error: {source}"))]
    ArchiveStorage {
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// Encoding a partition file failed.
    #[snafu(display("Parquet write error for partition {path}: {source}"))]
    ParquetWrite {
        /// Archive-relative partition path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
        /// Captured backtrace.
        backtrace: Backtrace,
    },

    /// Building the Arrow batch for a partition failed.
    #[snafu(display("Arrow error while encoding partition {path}: {source}"))]
    ArrowEncode {
        /// Archive-relative partition path.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
        /// Captured backtrace.
        backtrace: Backtrace,
    },

    /// Decoding a partition file failed.
    #[snafu(display("Parquet read error for partition {path}: {source}"))]
    ParquetRead {
        /// Archive-relative partition path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
        /// Captured backtrace.
        backtrace: Backtrace,
    },

    /// Filtering or converting a decoded batch failed.
    #[snafu(display("Arrow error while reading partition {path}: {source}"))]
    ArrowRead {
        /// Archive-relative partition path.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
        /// Captured backtrace.
        backtrace: Backtrace,
    },

    /// A partition file does not carry the expected columns.
    #[snafu(display("Partition {path} has an unexpected layout: {detail}"))]
    PartitionSchema {
        /// Archive-relative partition path.
        path: String,
        /// What did not match.
        detail: String,
    },

    /// The archive cannot serve a request that explicitly requires it.
    #[snafu(display("Archive unavailable at {path}: {reason}"))]
    ArchiveUnavailable {
        /// Archive root.
        path: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// The archive manifest exists but cannot be parsed.
    #[snafu(display("Archive manifest at {path} is corrupt: {source}"))]
    ManifestCorrupt {
        /// Manifest path.
        path: String,
        /// JSON decoding failure.
        source: serde_json::Error,
    },

    /// The archive manifest could not be serialized.
    #[snafu(display("Failed to encode archive manifest: {source}"))]
    ManifestEncode {
        /// JSON encoding failure.
        source: serde_json::Error,
    },

    /// The reference series has no rows flagged `is_reference`.
    #[snafu(display("Reference series {series_id:?} has no rows flagged is_reference"))]
    EmptyReference {
        /// The reference series that was queried.
        series_id: String,
    },

    /// A moving series carries no `relates_to_series` link to resolve.
    #[snafu(display("Series {series_id:?} is not linked to a reference series"))]
    NoLinkedReference {
        /// The moving series.
        series_id: String,
    },
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidSample { .. }
            | StoreError::InvalidTimeRange { .. }
            | StoreError::InvalidConfig { .. }
            | StoreError::InvalidDefinition { .. } => ErrorKind::Validation,

            StoreError::HotStore { .. }
            | StoreError::HotStorePath { .. }
            | StoreError::ArchiveStorage { .. }
            | StoreError::ParquetWrite { .. }
            | StoreError::ArrowEncode { .. }
            | StoreError::ManifestEncode { .. } => ErrorKind::StorageIo,

            StoreError::ParquetRead { .. }
            | StoreError::ArrowRead { .. }
            | StoreError::PartitionSchema { .. }
            | StoreError::ArchiveUnavailable { .. }
            | StoreError::ManifestCorrupt { .. } => ErrorKind::ArchiveUnavailable,

            StoreError::EmptyReference { .. } | StoreError::NoLinkedReference { .. } => {
                ErrorKind::EmptyReference
            }
        }
    }
}
