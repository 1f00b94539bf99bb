//! Wrapper prelude.
//!
//! The `position-store` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on internal core module paths.

pub use crate::coverage;
pub use crate::{
    ArchiveCompression, CancellationToken, EngineConfig, ErrorKind, ExportOptions, ExportReport,
    ExportSelection, PositionReader, PositionStore, PositionValues, QueryRequest, QueryResult,
    Relationship, RelationshipDefinition, RelativeOptions, RelativeSample, Sample, SampleFilter,
    SecondaryValues, SeriesOptions, ServedFrom, SourcePreference, SourceRecord, StoreError,
    StoreResult, TimeRange, TimeSteps, WriteReport,
};
