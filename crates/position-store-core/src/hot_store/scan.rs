//! Filtered, lazily paged scans over the hot store.
//!
//! A [`Scan`] never holds a prepared statement across pages. Each page is a
//! fresh keyset query resuming strictly after the last row it yielded, so a
//! scan can be interleaved with writes on the same connection and always
//! observes committed state. Rows come back ordered by
//! `(timestamp, object_id, series_id)`.

use std::collections::VecDeque;

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use snafu::prelude::*;

use crate::{
    common::time_range::TimeRange,
    error::{HotStoreSnafu, StoreResult},
    hot_store::schema::{SAMPLE_COLUMNS, sample_from_row},
    sample::Sample,
};

/// Rows fetched per keyset page.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 512;

/// Row predicate for scans, counts and the other hot-store lookups.
///
/// Every field is optional; the empty filter matches the whole table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleFilter {
    /// Keep only this series.
    pub series_id: Option<String>,
    /// Keep only this object.
    pub object_id: Option<String>,
    /// Keep only rows inside this closed range.
    pub time_range: Option<TimeRange>,
    /// Keep only rows flagged `is_reference`.
    pub reference_only: bool,
    /// Match on the stored `has_equatorial` flag.
    pub has_equatorial: Option<bool>,
    /// Match on the stored `has_topocentric` flag.
    pub has_topocentric: Option<bool>,
    /// Match on the stored `has_physical` flag.
    pub has_physical: Option<bool>,
    /// Keep only rows committed after this write watermark.
    pub written_after: Option<i64>,
}

impl SampleFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one series.
    pub fn for_series(series_id: impl Into<String>) -> Self {
        Self {
            series_id: Some(series_id.into()),
            ..Self::default()
        }
    }

    /// Restrict to one object.
    pub fn with_object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    /// Restrict to a closed time range.
    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Restrict to rows flagged `is_reference`.
    pub fn reference_rows(mut self) -> Self {
        self.reference_only = true;
        self
    }

    /// Match on the stored `has_equatorial` flag.
    pub fn with_equatorial(mut self, present: bool) -> Self {
        self.has_equatorial = Some(present);
        self
    }

    /// Match on the stored `has_topocentric` flag.
    pub fn with_topocentric(mut self, present: bool) -> Self {
        self.has_topocentric = Some(present);
        self
    }

    /// Match on the stored `has_physical` flag.
    pub fn with_physical(mut self, present: bool) -> Self {
        self.has_physical = Some(present);
        self
    }

    /// Keep only rows committed after `watermark`
    /// (see [`crate::hot_store::HotStore::write_watermark`]).
    pub fn written_after(mut self, watermark: i64) -> Self {
        self.written_after = Some(watermark);
        self
    }

    /// Build the `WHERE` body (without the keyword) and its bound values.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values = Vec::new();

        if let Some(series) = &self.series_id {
            clauses.push("series_id = ?");
            values.push(Value::Text(series.clone()));
        }
        if let Some(object) = &self.object_id {
            clauses.push("object_id = ?");
            values.push(Value::Text(object.clone()));
        }
        if let Some(range) = &self.time_range {
            clauses.push("ts_micros BETWEEN ? AND ?");
            values.push(Value::Integer(range.start_micros()));
            values.push(Value::Integer(range.end_micros()));
        }
        if let Some(watermark) = self.written_after {
            clauses.push("write_seq > ?");
            values.push(Value::Integer(watermark));
        }
        if self.reference_only {
            clauses.push("is_reference = 1");
        }
        let flags = [
            ("has_equatorial = ?", self.has_equatorial),
            ("has_topocentric = ?", self.has_topocentric),
            ("has_physical = ?", self.has_physical),
        ];
        for (clause, wanted) in flags {
            if let Some(wanted) = wanted {
                clauses.push(clause);
                values.push(Value::Integer(i64::from(wanted)));
            }
        }

        if clauses.is_empty() {
            ("1 = 1".to_string(), values)
        } else {
            (clauses.join(" AND "), values)
        }
    }
}

#[derive(Debug, Clone)]
struct Cursor {
    ts_micros: i64,
    object_id: String,
    series_id: String,
}

/// Lazy, single-pass sequence of samples matching a [`SampleFilter`].
///
/// Yields `Err` at most once; the scan is finished after an error.
pub struct Scan<'a> {
    conn: &'a Connection,
    where_sql: String,
    where_values: Vec<Value>,
    page_size: usize,
    cursor: Option<Cursor>,
    buffer: VecDeque<Sample>,
    exhausted: bool,
}

impl<'a> Scan<'a> {
    pub(crate) fn new(conn: &'a Connection, filter: &SampleFilter, page_size: usize) -> Self {
        let (where_sql, where_values) = filter.to_sql();
        Self {
            conn,
            where_sql,
            where_values,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fetch_page(&mut self) -> StoreResult<()> {
        let mut sql = format!("SELECT {SAMPLE_COLUMNS} FROM samples WHERE {}", self.where_sql);
        let mut values = self.where_values.clone();
        if let Some(cursor) = &self.cursor {
            sql.push_str(" AND (ts_micros, object_id, series_id) > (?, ?, ?)");
            values.push(Value::Integer(cursor.ts_micros));
            values.push(Value::Text(cursor.object_id.clone()));
            values.push(Value::Text(cursor.series_id.clone()));
        }
        sql.push_str(" ORDER BY ts_micros, object_id, series_id LIMIT ?");
        values.push(Value::Integer(self.page_size as i64));

        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .context(HotStoreSnafu { operation: "preparing scan" })?;
        let rows = stmt
            .query_map(params_from_iter(values), sample_from_row)
            .context(HotStoreSnafu { operation: "scanning samples" })?;
        for row in rows {
            self.buffer
                .push_back(row.context(HotStoreSnafu { operation: "decoding sample" })?);
        }

        if self.buffer.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = self.buffer.back() {
            self.cursor = Some(Cursor {
                ts_micros: last.timestamp_micros(),
                object_id: last.object_id.clone(),
                series_id: last.series_id.clone(),
            });
        }
        Ok(())
    }
}

impl Iterator for Scan<'_> {
    type Item = StoreResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[test]
    fn empty_filter_matches_everything() {
        let (sql, values) = SampleFilter::all().to_sql();
        assert_eq!(sql, "1 = 1");
        assert!(values.is_empty());
    }

    #[test]
    fn filter_binds_values_in_clause_order() {
        let range = TimeRange::new(minute(0), minute(10)).unwrap();
        let (sql, values) = SampleFilter::for_series("s1")
            .with_object("mars")
            .with_time_range(range)
            .reference_rows()
            .to_sql();

        assert_eq!(
            sql,
            "series_id = ? AND object_id = ? AND ts_micros BETWEEN ? AND ? AND is_reference = 1"
        );
        assert_eq!(values.len(), 4);
        assert_eq!(values[0], Value::Text("s1".to_string()));
        assert_eq!(values[2], Value::Integer(minute(0).timestamp_micros()));
    }
}
