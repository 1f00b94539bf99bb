//! Columnar encodings used by the archive.
//!
//! Partition files are Parquet; see [`parquet`] for the column layout and
//! the read-side filter pushdown.

pub mod parquet;
