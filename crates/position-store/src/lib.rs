//! # position-store
//!
//! Embedded storage for computed object positions: a transactional hot store
//! with date-partitioned Parquet archival, routed reads and derived queries.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust,no_run
//! use position_store::prelude::*;
//!
//! # fn main() -> Result<(), StoreError> {
//! let mut store = PositionStore::open_workspace("my-workspace")?;
//! let report = store.ingest("s1", &SeriesOptions::default(), Vec::<SourceRecord>::new());
//! assert!(report.is_complete());
//!
//! let rows = store.query(&QueryRequest::series("s1"))?;
//! println!("{} rows from {:?}", rows.len(), rows.served_from);
//! # Ok(())
//! # }
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Coverage namespace (wrapper-only).
pub mod coverage {
    pub use position_store_core::coverage::{Coverage, MicrosRange};
}

/// Angle helpers used by the derived queries.
pub mod angles {
    pub use position_store_core::derived::{normalize_angle, separation, signed_delta};
}

pub use position_store_core::archive::{
    ArchiveManifest, ExportOptions, ExportReport, ExportSelection, PartitionMeta,
};
pub use position_store_core::batch_writer::{SeriesOptions, SourceRecord, TimeSteps, WriteReport};
pub use position_store_core::cancel::CancellationToken;
pub use position_store_core::common::{TimeRange, TimeRangeError};
pub use position_store_core::config::EngineConfig;
pub use position_store_core::derived::{
    Relationship, RelationshipDefinition, RelationshipReport, RelativeOptions, RelativeReport,
    RelativeSample, default_definitions,
};
pub use position_store_core::engine::{PositionReader, PositionStore};
pub use position_store_core::error::{ErrorKind, StoreError, StoreResult};
pub use position_store_core::formats::parquet::{ArchiveCompression, ParseCompressionError};
pub use position_store_core::hot_store::SampleFilter;
pub use position_store_core::query::{
    QueryRequest, QueryResult, RouteDecision, RoutingInputs, ServedFrom, SourcePreference,
    estimate_and_route,
};
pub use position_store_core::sample::{PositionValues, Sample, SecondaryValues};
pub use position_store_core::storage::ArchiveLocation;
