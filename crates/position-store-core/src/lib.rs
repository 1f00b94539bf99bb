//! Hybrid storage engine for time-series position samples.
//!
//! This crate provides the engine behind `position-store`:
//!
//! - A [`sample::Sample`] row model keyed by `(series_id, timestamp,
//!   object_id)` with derived summary flags (`sample` module).
//! - A transactional SQLite hot store with upserts, atomic batches and lazy
//!   keyset scans (`hot_store` module).
//! - Chunked, cancellable ingestion with automatic export once a threshold
//!   is crossed (`batch_writer` module).
//! - An archive of immutable, date/hour-partitioned Parquet files described
//!   by a JSON manifest (`archive`, `formats` and `storage` modules).
//! - Interval coverage utilities for reasoning about which time ranges the
//!   archive holds (`coverage` module).
//! - A query router that picks the hot store, the archive, or both, and
//!   merges results deterministically (`query` module).
//! - Pairwise relationship detection and cross-series relative queries
//!   computed from stored rows (`derived` module).
//!
//! [`engine::PositionStore`] ties the pieces together for one workspace.
//! Higher-level crates (a CLI, a UI) are expected to depend on the facade
//! crate rather than on these modules directly.
#![deny(missing_docs)]
pub mod archive;
pub mod batch_writer;
pub mod cancel;
pub mod common;
pub mod config;
pub mod coverage;
pub mod derived;
pub mod engine;
pub mod error;
pub mod formats;
pub mod hot_store;
pub mod query;
pub mod sample;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_util;
