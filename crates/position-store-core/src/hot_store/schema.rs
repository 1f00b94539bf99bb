//! SQLite schema, connection setup and row decoding for the hot store.
//!
//! The table mirrors the [`Sample`] model one column per field. The three
//! `has_*` flags are persisted as well so selective scans can hit an index
//! instead of inspecting nullable columns; they are always computed from the
//! sample being written, never supplied by callers.
//!
//! Every write transaction draws the next value of a counter kept in
//! `store_meta` and stamps it on the rows it touches as `write_seq`. The
//! exporter records the counter it started from, which lets readers tell
//! rows an archive partition already holds from rows written after it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, Transaction};

use crate::{
    common::time_range::from_micros,
    sample::{Sample, SecondaryValues},
};

pub(crate) const SCHEMA_VERSION: i64 = 2;

pub(crate) const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS store_meta (
    version        INTEGER NOT NULL,
    last_write_seq INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS samples (
    series_id          TEXT    NOT NULL,
    ts_micros          INTEGER NOT NULL,
    object_id          TEXT    NOT NULL,
    primary_value      REAL    NOT NULL,
    latitude           REAL,
    declination        REAL,
    right_ascension    REAL,
    distance           REAL,
    altitude           REAL,
    azimuth            REAL,
    apparent_magnitude REAL,
    phase_angle        REAL,
    elongation         REAL,
    light_time         REAL,
    speed              REAL,
    is_retrograde      INTEGER,
    source_engine      TEXT    NOT NULL,
    source_file        TEXT,
    relates_to_series  TEXT,
    is_reference       INTEGER NOT NULL,
    has_equatorial     INTEGER NOT NULL,
    has_topocentric    INTEGER NOT NULL,
    has_physical       INTEGER NOT NULL,
    write_seq          INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (series_id, ts_micros, object_id)
);
CREATE INDEX IF NOT EXISTS idx_samples_series_ts ON samples (series_id, ts_micros);
CREATE INDEX IF NOT EXISTS idx_samples_object ON samples (object_id);
CREATE INDEX IF NOT EXISTS idx_samples_relates_to ON samples (relates_to_series);
CREATE INDEX IF NOT EXISTS idx_samples_reference ON samples (series_id, is_reference, ts_micros);
";

/// Column list shared by every statement that decodes with [`sample_from_row`].
pub(crate) const SAMPLE_COLUMNS: &str = "series_id, ts_micros, object_id, primary_value, \
    latitude, declination, right_ascension, distance, altitude, azimuth, \
    apparent_magnitude, phase_angle, elongation, light_time, speed, \
    is_retrograde, source_engine, source_file, relates_to_series, is_reference";

pub(crate) const UPSERT_SQL: &str = "INSERT OR REPLACE INTO samples (
    series_id, ts_micros, object_id, primary_value,
    latitude, declination, right_ascension, distance, altitude, azimuth,
    apparent_magnitude, phase_angle, elongation, light_time, speed,
    is_retrograde, source_engine, source_file, relates_to_series, is_reference,
    has_equatorial, has_topocentric, has_physical, write_seq
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
          ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)";

/// Version 1 stores predate write sequencing; their rows start at zero.
const MIGRATE_V1: &str = "
ALTER TABLE store_meta ADD COLUMN last_write_seq INTEGER NOT NULL DEFAULT 0;
ALTER TABLE samples ADD COLUMN write_seq INTEGER NOT NULL DEFAULT 0;
UPDATE store_meta SET version = 2;
";

/// A stored microsecond timestamp decoded into a UTC instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredInstant(pub DateTime<Utc>);

impl FromSql for StoredInstant {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let micros = i64::column_result(value)?;
        from_micros(micros)
            .map(StoredInstant)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

pub(crate) fn apply_pragmas(conn: &Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    // journal_mode returns the resulting mode as a row.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    Ok(())
}

pub(crate) fn initialize(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(CREATE_SCHEMA)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", [SCHEMA_VERSION])?;
        }
        Some(1) => tx.execute_batch(MIGRATE_V1)?,
        Some(_) => {}
    }
    tx.commit()
}

/// Advance the write counter inside `tx` and return the new value.
pub(crate) fn next_write_seq(tx: &Transaction<'_>) -> rusqlite::Result<i64> {
    tx.query_row(
        "UPDATE store_meta SET last_write_seq = last_write_seq + 1 RETURNING last_write_seq",
        [],
        |row| row.get(0),
    )
}

/// Decode a row selected with [`SAMPLE_COLUMNS`], starting at column 0.
pub(crate) fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<Sample> {
    let StoredInstant(timestamp) = row.get(1)?;

    let mut values = [None; 11];
    for (offset, slot) in values.iter_mut().enumerate() {
        *slot = row.get(4 + offset)?;
    }

    Ok(Sample {
        series_id: row.get(0)?,
        timestamp,
        object_id: row.get(2)?,
        primary_value: row.get(3)?,
        secondary: SecondaryValues::from_array(values),
        is_retrograde: row.get(15)?,
        source_engine: row.get(16)?,
        source_file: row.get(17)?,
        relates_to_series: row.get(18)?,
        is_reference: row.get(19)?,
    })
}

pub(crate) fn insert_sample(
    stmt: &mut rusqlite::CachedStatement<'_>,
    s: &Sample,
    write_seq: i64,
) -> rusqlite::Result<usize> {
    let v = &s.secondary;
    stmt.execute(rusqlite::params![
        s.series_id,
        s.timestamp_micros(),
        s.object_id,
        s.primary_value,
        v.latitude,
        v.declination,
        v.right_ascension,
        v.distance,
        v.altitude,
        v.azimuth,
        v.apparent_magnitude,
        v.phase_angle,
        v.elongation,
        v.light_time,
        v.speed,
        s.is_retrograde,
        s.source_engine,
        s.source_file,
        s.relates_to_series,
        s.is_reference,
        s.has_equatorial(),
        s.has_topocentric(),
        s.has_physical(),
        write_seq,
    ])
}
