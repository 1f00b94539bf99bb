//! The transactional hot store.
//!
//! [`HotStore`] owns one SQLite connection to the workspace's hot-store file.
//! Writes go through `&mut self`, so a store value is the single logical
//! writer; additional read-only handles come from [`HotStore::reader`] and
//! see only committed state (WAL isolation).
//!
//! Besides point storage this module hosts the two set-oriented joins the
//! derived layer is built on: same-instant object pairs within a series, and
//! moving rows joined against a reference snapshot.

pub mod scan;
pub(crate) mod schema;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, params_from_iter};
use snafu::prelude::*;

use crate::{
    common::time_range::TimeRange,
    error::{HotStorePathSnafu, HotStoreSnafu, InvalidSampleSnafu, StoreResult},
    sample::Sample,
};

pub use scan::{DEFAULT_SCAN_PAGE_SIZE, SampleFilter, Scan};
use schema::{StoredInstant, UPSERT_SQL};

/// Embedded SQLite store keyed by `(series_id, timestamp, object_id)`.
#[derive(Debug)]
pub struct HotStore {
    conn: Connection,
    path: PathBuf,
    busy_timeout_ms: u64,
    read_only: bool,
}

/// Two objects of one series observed at the same instant.
///
/// `from_object < to_object` always holds, so every unordered pair appears
/// once.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PairRow {
    pub timestamp: DateTime<Utc>,
    pub from_object: String,
    pub from_value: Option<f64>,
    pub from_speed: Option<f64>,
    pub to_object: String,
    pub to_value: Option<f64>,
    pub to_speed: Option<f64>,
}

/// A moving-series row joined with one reference row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RelativeRow {
    pub timestamp: DateTime<Utc>,
    pub moving_object: String,
    pub moving_value: Option<f64>,
    pub moving_declination: Option<f64>,
    pub moving_distance: Option<f64>,
    pub reference_object: String,
    pub reference_value: Option<f64>,
    pub reference_declination: Option<f64>,
    pub reference_distance: Option<f64>,
}

impl HotStore {
    /// Open (creating if needed) the hot-store file at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context(HotStorePathSnafu {
                path: parent.display().to_string(),
            })?;
        }

        let mut conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .context(HotStoreSnafu { operation: "opening hot store" })?;
        schema::apply_pragmas(&conn, busy_timeout_ms)
            .context(HotStoreSnafu { operation: "configuring connection" })?;
        schema::initialize(&mut conn)
            .context(HotStoreSnafu { operation: "initializing schema" })?;

        debug!("opened hot store at {}", path.display());
        Ok(Self {
            conn,
            path,
            busy_timeout_ms,
            read_only: false,
        })
    }

    /// Open an additional read-only handle on the same file.
    ///
    /// The handle may live on another thread; it never observes a partially
    /// committed batch.
    pub fn reader(&self) -> StoreResult<HotStore> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context(HotStoreSnafu { operation: "opening reader" })?;
        conn.busy_timeout(std::time::Duration::from_millis(self.busy_timeout_ms))
            .context(HotStoreSnafu { operation: "configuring reader" })?;
        Ok(Self {
            conn,
            path: self.path.clone(),
            busy_timeout_ms: self.busy_timeout_ms,
            read_only: true,
        })
    }

    /// Close the connection, surfacing any error SQLite reports.
    pub fn close(self) -> StoreResult<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context(HotStoreSnafu { operation: "closing hot store" })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True for handles produced by [`HotStore::reader`].
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Insert or fully replace one sample.
    pub fn upsert(&mut self, sample: &Sample) -> StoreResult<()> {
        sample.validate().context(InvalidSampleSnafu { index: None })?;
        let tx = self
            .conn
            .transaction()
            .context(HotStoreSnafu { operation: "beginning upsert" })?;
        let seq = schema::next_write_seq(&tx)
            .context(HotStoreSnafu { operation: "advancing write sequence" })?;
        {
            let mut stmt = tx
                .prepare_cached(UPSERT_SQL)
                .context(HotStoreSnafu { operation: "preparing upsert" })?;
            schema::insert_sample(&mut stmt, sample, seq)
                .context(HotStoreSnafu { operation: "upserting sample" })?;
        }
        tx.commit()
            .context(HotStoreSnafu { operation: "committing upsert" })
    }

    /// Insert or replace every sample in one transaction.
    ///
    /// The whole batch is validated before the transaction starts; one bad
    /// element rejects the batch and nothing is written.
    pub fn upsert_batch(&mut self, samples: &[Sample]) -> StoreResult<usize> {
        for (index, sample) in samples.iter().enumerate() {
            sample
                .validate()
                .context(InvalidSampleSnafu { index: Some(index) })?;
        }
        if samples.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction()
            .context(HotStoreSnafu { operation: "beginning batch" })?;
        let seq = schema::next_write_seq(&tx)
            .context(HotStoreSnafu { operation: "advancing write sequence" })?;
        {
            let mut stmt = tx
                .prepare_cached(UPSERT_SQL)
                .context(HotStoreSnafu { operation: "preparing upsert" })?;
            for sample in samples {
                schema::insert_sample(&mut stmt, sample, seq)
                    .context(HotStoreSnafu { operation: "upserting batch" })?;
            }
        }
        tx.commit()
            .context(HotStoreSnafu { operation: "committing batch" })?;

        debug!("committed batch of {} samples", samples.len());
        Ok(samples.len())
    }

    /// Sequence number of the most recent committed write transaction.
    ///
    /// Rows committed later always carry a larger `write_seq`, so a value read
    /// before a scan separates rows the scan could see from later writes.
    pub fn write_watermark(&self) -> StoreResult<i64> {
        self.conn
            .query_row("SELECT last_write_seq FROM store_meta", [], |row| row.get(0))
            .context(HotStoreSnafu { operation: "reading write watermark" })
    }

    /// Lazily scan matching samples in `(timestamp, object_id, series_id)` order.
    pub fn scan(&self, filter: &SampleFilter) -> Scan<'_> {
        Scan::new(&self.conn, filter, DEFAULT_SCAN_PAGE_SIZE)
    }

    /// [`HotStore::scan`] with an explicit page size.
    pub fn scan_paged(&self, filter: &SampleFilter, page_size: usize) -> Scan<'_> {
        Scan::new(&self.conn, filter, page_size)
    }

    /// Exact number of matching rows.
    pub fn count(&self, filter: &SampleFilter) -> StoreResult<u64> {
        let (where_sql, values) = filter.to_sql();
        let sql = format!("SELECT COUNT(*) FROM samples WHERE {where_sql}");
        let n: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))
            .context(HotStoreSnafu { operation: "counting samples" })?;
        Ok(n.max(0) as u64)
    }

    /// Distinct series ids among matching rows, ascending.
    pub fn series_ids(&self, filter: &SampleFilter) -> StoreResult<Vec<String>> {
        let (where_sql, values) = filter.to_sql();
        let sql = format!("SELECT DISTINCT series_id FROM samples WHERE {where_sql} ORDER BY series_id");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context(HotStoreSnafu { operation: "preparing series listing" })?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
            .context(HotStoreSnafu { operation: "listing series" })?;
        Ok(ids)
    }

    /// Earliest and latest timestamp among matching rows.
    pub fn time_bounds(&self, filter: &SampleFilter) -> StoreResult<Option<TimeRange>> {
        let (where_sql, values) = filter.to_sql();
        let sql = format!("SELECT MIN(ts_micros), MAX(ts_micros) FROM samples WHERE {where_sql}");
        let bounds: (Option<StoredInstant>, Option<StoredInstant>) = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| Ok((row.get(0)?, row.get(1)?)))
            .context(HotStoreSnafu { operation: "reading time bounds" })?;
        Ok(match bounds {
            (Some(StoredInstant(start)), Some(StoredInstant(end))) => {
                Some(TimeRange::new(start, end).unwrap_or(TimeRange::instant(start)))
            }
            _ => None,
        })
    }

    /// Earliest timestamp holding `is_reference` rows of `series_id`.
    pub fn reference_timestamp(&self, series_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let ts: Option<StoredInstant> = self
            .conn
            .query_row(
                "SELECT MIN(ts_micros) FROM samples WHERE series_id = ?1 AND is_reference = 1",
                params![series_id],
                |row| row.get(0),
            )
            .context(HotStoreSnafu { operation: "locating reference snapshot" })?;
        Ok(ts.map(|StoredInstant(ts)| ts))
    }

    /// The reference series recorded on the earliest linked row of `series_id`.
    pub fn linked_reference(&self, series_id: &str) -> StoreResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT relates_to_series FROM samples
                 WHERE series_id = ?1 AND relates_to_series IS NOT NULL
                 ORDER BY ts_micros, object_id LIMIT 1",
                params![series_id],
                |row| row.get(0),
            )
            .optional()
            .context(HotStoreSnafu { operation: "reading linked reference" })
    }

    /// Same-instant object pairs of one series, ordered by
    /// `(timestamp, from_object, to_object)`.
    pub(crate) fn pair_rows(
        &self,
        series_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<PairRow>> {
        let mut sql = String::from(
            "SELECT a.ts_micros, a.object_id, a.primary_value, a.speed,
                    b.object_id, b.primary_value, b.speed
             FROM samples a
             JOIN samples b
               ON b.series_id = a.series_id
              AND b.ts_micros = a.ts_micros
              AND a.object_id < b.object_id
             WHERE a.series_id = ?",
        );
        let mut values = vec![Value::Text(series_id.to_string())];
        if let Some(ts) = at {
            let range = TimeRange::instant(ts);
            sql.push_str(" AND a.ts_micros BETWEEN ? AND ?");
            values.push(Value::Integer(range.start_micros()));
            values.push(Value::Integer(range.end_micros()));
        }
        sql.push_str(" ORDER BY a.ts_micros, a.object_id, b.object_id");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context(HotStoreSnafu { operation: "preparing pair join" })?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                let StoredInstant(timestamp) = row.get(0)?;
                Ok(PairRow {
                    timestamp,
                    from_object: row.get(1)?,
                    from_value: row.get(2)?,
                    from_speed: row.get(3)?,
                    to_object: row.get(4)?,
                    to_value: row.get(5)?,
                    to_speed: row.get(6)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .context(HotStoreSnafu { operation: "joining object pairs" })?;
        Ok(rows)
    }

    /// Rows of `moving` joined with the reference snapshot of `reference`
    /// taken at `reference_ts`.
    ///
    /// Ordered by `(timestamp, moving_object, reference_object)`.
    pub(crate) fn relative_rows(
        &self,
        moving: &SampleFilter,
        reference_series: &str,
        reference_ts: DateTime<Utc>,
        match_objects: bool,
    ) -> StoreResult<Vec<RelativeRow>> {
        let (moving_where, moving_values) = moving.to_sql();
        let mut sql = format!(
            "SELECT m.ts_micros, m.object_id, m.primary_value, m.declination, m.distance,
                    r.object_id, r.primary_value, r.declination, r.distance
             FROM (SELECT * FROM samples WHERE {moving_where}) m
             JOIN samples r
               ON r.series_id = ?
              AND r.is_reference = 1
              AND r.ts_micros = ?"
        );
        if match_objects {
            sql.push_str(" AND r.object_id = m.object_id");
        }
        sql.push_str(" ORDER BY m.ts_micros, m.object_id, r.object_id");

        let mut values = moving_values;
        values.push(Value::Text(reference_series.to_string()));
        values.push(Value::Integer(reference_ts.timestamp_micros()));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context(HotStoreSnafu { operation: "preparing relative join" })?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                let StoredInstant(timestamp) = row.get(0)?;
                Ok(RelativeRow {
                    timestamp,
                    moving_object: row.get(1)?,
                    moving_value: row.get(2)?,
                    moving_declination: row.get(3)?,
                    moving_distance: row.get(4)?,
                    reference_object: row.get(5)?,
                    reference_value: row.get(6)?,
                    reference_declination: row.get(7)?,
                    reference_distance: row.get(8)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .context(HotStoreSnafu { operation: "joining reference snapshot" })?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StoreError};
    use crate::sample::SecondaryValues;
    use crate::test_util::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn upsert_replaces_the_whole_row() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;

        let first = sample_at("s1", minute(0), "mars", 10.0).with_secondary(full_secondary());
        let second = sample_at("s1", minute(0), "mars", 20.0);
        store.upsert(&first)?;
        store.upsert(&second)?;

        let filter = SampleFilter::for_series("s1");
        assert_eq!(store.count(&filter)?, 1);
        let rows = store.scan(&filter).collect::<StoreResult<Vec<_>>>()?;
        assert_eq!(rows, vec![second]);
        assert_eq!(rows[0].secondary, SecondaryValues::default());
        Ok(())
    }

    #[test]
    fn invalid_element_rejects_whole_batch() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;
        store.upsert(&sample_at("s1", minute(0), "sun", 1.0))?;

        let batch = vec![
            sample_at("s1", minute(1), "sun", 2.0),
            sample_at("s1", minute(2), "", 3.0),
            sample_at("s1", minute(3), "sun", 4.0),
        ];
        let err = store.upsert_batch(&batch).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(err, StoreError::InvalidSample { index: Some(1), .. }));
        assert_eq!(store.count(&SampleFilter::all())?, 1);
        Ok(())
    }

    #[test]
    fn scan_pages_in_timestamp_then_object_order() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;
        let mut batch = Vec::new();
        for m in (0..7).rev() {
            for obj in ["venus", "mars", "sun"] {
                batch.push(sample_at("s1", minute(m), obj, m as f64));
            }
        }
        store.upsert_batch(&batch)?;

        let rows = store
            .scan_paged(&SampleFilter::for_series("s1"), 4)
            .collect::<StoreResult<Vec<_>>>()?;

        assert_eq!(rows.len(), 21);
        let keys: Vec<_> = rows.iter().map(Sample::key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(rows[0].object_id, "mars");
        Ok(())
    }

    #[test]
    fn time_range_filter_is_inclusive() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;
        let batch: Vec<_> = (0..10).map(|m| sample_at("s1", minute(m), "moon", m as f64)).collect();
        store.upsert_batch(&batch)?;

        let range = TimeRange::new(minute(2), minute(5))?;
        let filter = SampleFilter::for_series("s1").with_time_range(range);
        assert_eq!(store.count(&filter)?, 4);
        assert_eq!(store.time_bounds(&filter)?, Some(range));
        assert_eq!(store.time_bounds(&SampleFilter::for_series("nope"))?, None);
        Ok(())
    }

    #[test]
    fn reference_lookups_use_flags_and_links() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;
        store.upsert_batch(&[
            sample_at("natal", minute(5), "sun", 170.0),
            sample_at("natal", minute(9), "sun", 171.0),
            sample_at("transit", minute(0), "sun", 200.0).relating_to("natal"),
        ])?;

        assert_eq!(store.reference_timestamp("natal")?, Some(minute(5)));
        assert_eq!(store.reference_timestamp("transit")?, None);
        assert_eq!(store.linked_reference("transit")?.as_deref(), Some("natal"));
        assert_eq!(store.linked_reference("natal")?, None);
        Ok(())
    }

    #[test]
    fn reader_sees_committed_rows_and_rejects_writes() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;
        let reader = store.reader()?;

        store.upsert(&sample_at("s1", minute(0), "sun", 1.0))?;
        assert_eq!(reader.count(&SampleFilter::all())?, 1);

        let mut reader = reader;
        let err = reader.upsert(&sample_at("s1", minute(1), "sun", 2.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageIo);
        Ok(())
    }

    #[test]
    fn watermark_separates_earlier_and_later_writes() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;
        assert_eq!(store.write_watermark()?, 0);

        store.upsert_batch(&[
            sample_at("s1", minute(0), "sun", 1.0),
            sample_at("s1", minute(1), "sun", 2.0),
        ])?;
        let mark = store.write_watermark()?;
        assert_eq!(mark, 1);

        store.upsert(&sample_at("s1", minute(0), "sun", 9.0))?;
        store.upsert(&sample_at("s1", minute(0), "moon", 3.0))?;
        assert_eq!(store.write_watermark()?, 3);

        let later = store
            .scan(&SampleFilter::for_series("s1").written_after(mark))
            .collect::<StoreResult<Vec<_>>>()?;
        let names: Vec<_> = later.iter().map(|s| (s.object_id.as_str(), s.primary_value)).collect();
        assert_eq!(names, vec![("moon", 3.0), ("sun", 9.0)]);
        Ok(())
    }

    #[test]
    fn version_one_store_is_migrated_in_place() -> TestResult {
        let tmp = TempDir::new()?;
        let path = crate::storage::layout::hot_store_path(tmp.path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        {
            let conn = Connection::open(&path)?;
            let v1 = schema::CREATE_SCHEMA
                .replace(",\n    last_write_seq INTEGER NOT NULL DEFAULT 0", "")
                .replace("    write_seq          INTEGER NOT NULL DEFAULT 0,\n", "");
            conn.execute_batch(&v1)?;
            conn.execute("INSERT INTO store_meta (version) VALUES (1)", [])?;
            conn.execute(
                "INSERT INTO samples (series_id, ts_micros, object_id, primary_value, source_engine,
                     is_reference, has_equatorial, has_topocentric, has_physical)
                 VALUES ('s1', ?1, 'sun', 1.0, 'legacy', 0, 0, 0, 0)",
                [minute(0).timestamp_micros()],
            )?;
        }

        let mut store = open_store(&tmp)?;
        assert_eq!(store.write_watermark()?, 0);
        assert_eq!(store.count(&SampleFilter::all().written_after(0))?, 0);

        store.upsert(&sample_at("s1", minute(1), "sun", 2.0))?;
        assert_eq!(store.count(&SampleFilter::all())?, 2);
        assert_eq!(store.count(&SampleFilter::all().written_after(0))?, 1);
        Ok(())
    }

    #[test]
    fn pair_join_lists_each_unordered_pair_once() -> TestResult {
        let tmp = TempDir::new()?;
        let mut store = open_store(&tmp)?;
        store.upsert_batch(&[
            sample_at("s1", minute(0), "a", 0.0),
            sample_at("s1", minute(0), "b", 120.0),
            sample_at("s1", minute(0), "c", 240.0),
            sample_at("s1", minute(1), "a", 1.0),
        ])?;

        let pairs = store.pair_rows("s1", None)?;
        let names: Vec<_> = pairs
            .iter()
            .map(|p| (p.from_object.as_str(), p.to_object.as_str()))
            .collect();
        assert_eq!(names, vec![("a", "b"), ("a", "c"), ("b", "c")]);
        assert!(store.pair_rows("s1", Some(minute(1)))?.is_empty());
        Ok(())
    }
}
