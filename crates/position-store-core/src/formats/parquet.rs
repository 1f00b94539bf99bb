//! Parquet encoding and decoding of samples.
//!
//! Partition files carry one column per [`Sample`] field plus the three
//! summary flags, with the timestamp stored as
//! `Timestamp(Microsecond, "UTC")`. Decoding pushes the time-range and object
//! filters down into Arrow comparison kernels before rows are materialized:
//!
//! - bounds are wrapped as 1-element [`Scalar`] arrays, so the kernels
//!   broadcast them without allocating full-length bound columns;
//! - the scalar timestamp arrays copy the column's timezone, because the
//!   comparison kernels require identical data types on both sides;
//! - `filter_record_batch` treats null mask entries as "drop row".

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, RecordBatch, Scalar, StringArray,
    TimestampMicrosecondArray,
};
use arrow::compute::filter_record_batch;
use arrow::compute::kernels::{boolean as boolean_kernels, cmp as cmp_kernels};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{BrotliLevel, Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    common::time_range::from_micros,
    error::{
        ArrowEncodeSnafu, ArrowReadSnafu, ParquetReadSnafu, ParquetWriteSnafu,
        PartitionSchemaSnafu, StoreError, StoreResult,
    },
    sample::{Sample, SecondaryValues},
};

/// Timezone recorded on the timestamp column.
pub const TIMESTAMP_TZ: &str = "UTC";

/// Column holding the series id.
pub const COL_SERIES_ID: &str = "series_id";
/// Column holding the observation instant.
pub const COL_TIMESTAMP: &str = "timestamp";
/// Column holding the object id.
pub const COL_OBJECT_ID: &str = "object_id";
/// Column holding the primary value.
pub const COL_PRIMARY_VALUE: &str = "primary_value";
/// Column holding the retrograde marker.
pub const COL_IS_RETROGRADE: &str = "is_retrograde";
/// Column holding the producing engine.
pub const COL_SOURCE_ENGINE: &str = "source_engine";
/// Column holding the producing engine's data file.
pub const COL_SOURCE_FILE: &str = "source_file";
/// Column holding the linked reference series.
pub const COL_RELATES_TO_SERIES: &str = "relates_to_series";
/// Column holding the reference flag.
pub const COL_IS_REFERENCE: &str = "is_reference";
/// Column holding the equatorial summary flag.
pub const COL_HAS_EQUATORIAL: &str = "has_equatorial";
/// Column holding the topocentric summary flag.
pub const COL_HAS_TOPOCENTRIC: &str = "has_topocentric";
/// Column holding the physical summary flag.
pub const COL_HAS_PHYSICAL: &str = "has_physical";

/// Compression codec for partition files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveCompression {
    /// No compression.
    Uncompressed,
    /// Snappy (the default).
    #[default]
    Snappy,
    /// Gzip at the default level.
    Gzip,
    /// Zstandard at the default level.
    Zstd,
    /// Brotli at the default level.
    Brotli,
    /// LZ4 (raw framing).
    Lz4,
}

/// Error returned when parsing an unknown codec name.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("Unknown compression codec {name:?} (expected uncompressed, snappy, gzip, zstd, brotli or lz4)"))]
pub struct ParseCompressionError {
    name: String,
}

impl ArchiveCompression {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveCompression::Uncompressed => "uncompressed",
            ArchiveCompression::Snappy => "snappy",
            ArchiveCompression::Gzip => "gzip",
            ArchiveCompression::Zstd => "zstd",
            ArchiveCompression::Brotli => "brotli",
            ArchiveCompression::Lz4 => "lz4",
        }
    }

    fn to_parquet(self) -> Compression {
        match self {
            ArchiveCompression::Uncompressed => Compression::UNCOMPRESSED,
            ArchiveCompression::Snappy => Compression::SNAPPY,
            ArchiveCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ArchiveCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ArchiveCompression::Brotli => Compression::BROTLI(BrotliLevel::default()),
            ArchiveCompression::Lz4 => Compression::LZ4_RAW,
        }
    }
}

impl fmt::Display for ArchiveCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveCompression {
    type Err = ParseCompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uncompressed" | "none" => Ok(ArchiveCompression::Uncompressed),
            "snappy" => Ok(ArchiveCompression::Snappy),
            "gzip" => Ok(ArchiveCompression::Gzip),
            "zstd" => Ok(ArchiveCompression::Zstd),
            "brotli" => Ok(ArchiveCompression::Brotli),
            "lz4" | "lz4_raw" => Ok(ArchiveCompression::Lz4),
            _ => ParseCompressionSnafu { name: s }.fail(),
        }
    }
}

static SAMPLE_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    let mut fields = vec![
        Field::new(COL_SERIES_ID, DataType::Utf8, false),
        Field::new(
            COL_TIMESTAMP,
            DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into())),
            false,
        ),
        Field::new(COL_OBJECT_ID, DataType::Utf8, false),
        Field::new(COL_PRIMARY_VALUE, DataType::Float64, false),
    ];
    fields.extend(
        SecondaryValues::FIELD_NAMES
            .iter()
            .map(|name| Field::new(*name, DataType::Float64, true)),
    );
    fields.extend([
        Field::new(COL_IS_RETROGRADE, DataType::Boolean, true),
        Field::new(COL_SOURCE_ENGINE, DataType::Utf8, false),
        Field::new(COL_SOURCE_FILE, DataType::Utf8, true),
        Field::new(COL_RELATES_TO_SERIES, DataType::Utf8, true),
        Field::new(COL_IS_REFERENCE, DataType::Boolean, false),
        Field::new(COL_HAS_EQUATORIAL, DataType::Boolean, false),
        Field::new(COL_HAS_TOPOCENTRIC, DataType::Boolean, false),
        Field::new(COL_HAS_PHYSICAL, DataType::Boolean, false),
    ]);
    Arc::new(Schema::new(fields))
});

/// Arrow schema of a partition file.
pub fn sample_schema() -> SchemaRef {
    SAMPLE_SCHEMA.clone()
}

/// Build one Arrow batch holding `samples` in the given order.
pub fn samples_to_batch(samples: &[Sample], path: &str) -> StoreResult<RecordBatch> {
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            samples.iter().map(|s| s.series_id.as_str()),
        )),
        Arc::new(
            TimestampMicrosecondArray::from_iter_values(
                samples.iter().map(Sample::timestamp_micros),
            )
            .with_timezone(TIMESTAMP_TZ),
        ),
        Arc::new(StringArray::from_iter_values(
            samples.iter().map(|s| s.object_id.as_str()),
        )),
        Arc::new(Float64Array::from_iter_values(
            samples.iter().map(|s| s.primary_value),
        )),
    ];

    let secondary: Vec<[Option<f64>; 11]> =
        samples.iter().map(|s| s.secondary.to_array()).collect();
    for idx in 0..SecondaryValues::FIELD_NAMES.len() {
        columns.push(Arc::new(Float64Array::from_iter(
            secondary.iter().map(|values| values[idx]),
        )));
    }

    columns.extend([
        Arc::new(BooleanArray::from_iter(
            samples.iter().map(|s| s.is_retrograde),
        )) as ArrayRef,
        Arc::new(StringArray::from_iter_values(
            samples.iter().map(|s| s.source_engine.as_str()),
        )),
        Arc::new(StringArray::from_iter(
            samples.iter().map(|s| s.source_file.as_deref()),
        )),
        Arc::new(StringArray::from_iter(
            samples.iter().map(|s| s.relates_to_series.as_deref()),
        )),
        Arc::new(BooleanArray::from_iter(
            samples.iter().map(|s| Some(s.is_reference)),
        )),
        Arc::new(BooleanArray::from_iter(
            samples.iter().map(|s| Some(s.has_equatorial())),
        )),
        Arc::new(BooleanArray::from_iter(
            samples.iter().map(|s| Some(s.has_topocentric())),
        )),
        Arc::new(BooleanArray::from_iter(
            samples.iter().map(|s| Some(s.has_physical())),
        )),
    ]);

    RecordBatch::try_new(sample_schema(), columns).context(ArrowEncodeSnafu { path })
}

/// Encode `samples` into an in-memory Parquet file.
pub fn encode_samples(
    samples: &[Sample],
    compression: ArchiveCompression,
    path: &str,
) -> StoreResult<Vec<u8>> {
    let batch = samples_to_batch(samples, path)?;
    let props = WriterProperties::builder()
        .set_compression(compression.to_parquet())
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, sample_schema(), Some(props))
        .context(ParquetWriteSnafu { path })?;
    writer.write(&batch).context(ParquetWriteSnafu { path })?;
    writer.close().context(ParquetWriteSnafu { path })?;

    Ok(buf)
}

/// Row filter pushed into partition decoding.
#[derive(Debug, Clone, Default)]
pub struct DecodeFilter<'a> {
    /// Inclusive microsecond bounds.
    pub time_bounds: Option<(i64, i64)>,
    /// Keep only this object.
    pub object_id: Option<&'a str>,
}

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
    path: &str,
) -> StoreResult<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .context(PartitionSchemaSnafu {
            path,
            detail: format!("missing or mistyped column {name}"),
        })
}

fn opt_f64(arr: &Float64Array, row: usize) -> Option<f64> {
    (!arr.is_null(row)).then(|| arr.value(row))
}

fn opt_bool(arr: &BooleanArray, row: usize) -> Option<bool> {
    (!arr.is_null(row)).then(|| arr.value(row))
}

fn opt_string(arr: &StringArray, row: usize) -> Option<String> {
    (!arr.is_null(row)).then(|| arr.value(row).to_string())
}

fn filter_batch(batch: RecordBatch, filter: &DecodeFilter<'_>, path: &str) -> StoreResult<RecordBatch> {
    let mut mask: Option<BooleanArray> = None;

    if let Some((start, end)) = filter.time_bounds {
        let ts_arr = column::<TimestampMicrosecondArray>(&batch, COL_TIMESTAMP, path)?;
        let tz_opt = match ts_arr.data_type() {
            DataType::Timestamp(_, tz_opt) => tz_opt.clone(),
            _ => None,
        };
        let start_scalar =
            Scalar::new(TimestampMicrosecondArray::from(vec![start]).with_timezone_opt(tz_opt.clone()));
        let end_scalar =
            Scalar::new(TimestampMicrosecondArray::from(vec![end]).with_timezone_opt(tz_opt));

        let ge_mask = cmp_kernels::gt_eq(ts_arr, &start_scalar).context(ArrowReadSnafu { path })?;
        let le_mask = cmp_kernels::lt_eq(ts_arr, &end_scalar).context(ArrowReadSnafu { path })?;
        mask = Some(boolean_kernels::and(&ge_mask, &le_mask).context(ArrowReadSnafu { path })?);
    }

    if let Some(object_id) = filter.object_id {
        let objects = column::<StringArray>(&batch, COL_OBJECT_ID, path)?;
        let wanted = Scalar::new(StringArray::from(vec![object_id]));
        let eq_mask = cmp_kernels::eq(objects, &wanted).context(ArrowReadSnafu { path })?;
        mask = Some(match mask {
            Some(prev) => boolean_kernels::and(&prev, &eq_mask).context(ArrowReadSnafu { path })?,
            None => eq_mask,
        });
    }

    match mask {
        Some(mask) => filter_record_batch(&batch, &mask).context(ArrowReadSnafu { path }),
        None => Ok(batch),
    }
}

fn batch_to_samples(batch: &RecordBatch, path: &str, out: &mut Vec<Sample>) -> StoreResult<()> {
    let series = column::<StringArray>(batch, COL_SERIES_ID, path)?;
    let timestamps = column::<TimestampMicrosecondArray>(batch, COL_TIMESTAMP, path)?;
    let objects = column::<StringArray>(batch, COL_OBJECT_ID, path)?;
    let primary = column::<Float64Array>(batch, COL_PRIMARY_VALUE, path)?;
    let secondary = SecondaryValues::FIELD_NAMES
        .iter()
        .map(|name| column::<Float64Array>(batch, name, path))
        .collect::<StoreResult<Vec<_>>>()?;
    let retrograde = column::<BooleanArray>(batch, COL_IS_RETROGRADE, path)?;
    let engines = column::<StringArray>(batch, COL_SOURCE_ENGINE, path)?;
    let files = column::<StringArray>(batch, COL_SOURCE_FILE, path)?;
    let relates = column::<StringArray>(batch, COL_RELATES_TO_SERIES, path)?;
    let is_reference = column::<BooleanArray>(batch, COL_IS_REFERENCE, path)?;

    out.reserve(batch.num_rows());
    for row in 0..batch.num_rows() {
        let micros = timestamps.value(row);
        let timestamp = from_micros(micros).map_err(|e| StoreError::PartitionSchema {
            path: path.to_string(),
            detail: e.to_string(),
        })?;

        let mut values = [None; 11];
        for (slot, arr) in values.iter_mut().zip(&secondary) {
            *slot = opt_f64(arr, row);
        }

        out.push(Sample {
            series_id: series.value(row).to_string(),
            timestamp,
            object_id: objects.value(row).to_string(),
            primary_value: primary.value(row),
            secondary: SecondaryValues::from_array(values),
            is_retrograde: opt_bool(retrograde, row),
            source_engine: engines.value(row).to_string(),
            source_file: opt_string(files, row),
            relates_to_series: opt_string(relates, row),
            is_reference: is_reference.value(row),
        });
    }
    Ok(())
}

/// Decode a partition file, keeping only rows that pass `filter`.
pub fn decode_samples(bytes: Bytes, filter: &DecodeFilter<'_>, path: &str) -> StoreResult<Vec<Sample>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context(ParquetReadSnafu { path })?
        .build()
        .context(ParquetReadSnafu { path })?;

    let mut out = Vec::new();
    for batch_res in reader {
        let batch = batch_res.context(ArrowReadSnafu { path })?;
        let filtered = filter_batch(batch, filter, path)?;
        if filtered.num_rows() > 0 {
            batch_to_samples(&filtered, path, &mut out)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn compression_names_parse_case_insensitively() {
        assert_eq!("ZSTD".parse::<ArchiveCompression>(), Ok(ArchiveCompression::Zstd));
        assert_eq!("none".parse::<ArchiveCompression>(), Ok(ArchiveCompression::Uncompressed));
        assert!("lzma".parse::<ArchiveCompression>().is_err());
    }

    #[test]
    fn decode_preserves_optional_fields() -> TestResult {
        let full = sample_at("s1", minute(0), "moon", 123.25)
            .with_secondary(full_secondary())
            .with_source("jpl", Some("de421.bsp".to_string()))
            .relating_to("natal");
        let sparse = sample_at("s1", minute(0), "sun", 10.0);

        let bytes = encode_samples(&[full.clone(), sparse.clone()], ArchiveCompression::Zstd, "t")?;
        let decoded = decode_samples(Bytes::from(bytes), &DecodeFilter::default(), "t")?;

        assert_eq!(decoded, vec![full, sparse]);
        Ok(())
    }

    #[test]
    fn decode_applies_inclusive_time_bounds_and_object_filter() -> TestResult {
        let samples: Vec<Sample> = (0..5)
            .flat_map(|m| {
                [
                    sample_at("s1", minute(m), "mars", m as f64),
                    sample_at("s1", minute(m), "venus", 100.0 + m as f64),
                ]
            })
            .collect();
        let bytes = Bytes::from(encode_samples(&samples, ArchiveCompression::Snappy, "t")?);

        let filter = DecodeFilter {
            time_bounds: Some((minute(1).timestamp_micros(), minute(3).timestamp_micros())),
            object_id: Some("venus"),
        };
        let decoded = decode_samples(bytes, &filter, "t")?;

        let values: Vec<f64> = decoded.iter().map(|s| s.primary_value).collect();
        assert_eq!(values, vec![101.0, 102.0, 103.0]);
        Ok(())
    }

    #[test]
    fn decode_reports_garbage_as_parquet_read_error() {
        let err = decode_samples(Bytes::from_static(b"not parquet"), &DecodeFilter::default(), "bad")
            .unwrap_err();
        assert!(matches!(err, StoreError::ParquetRead { .. }));
    }
}
