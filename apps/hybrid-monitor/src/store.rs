//! Append-only SQLite telemetry store.
//!
//! One writer connection appends; readers open their own connections. The journal runs in WAL
//! mode so queries never wait on an append beyond the busy timeout.

use crate::error::PersistenceError;
use crate::ingest::SampleSink;
use crate::telemetry::TelemetrySample;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS telemetry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    v_pv REAL NOT NULL,
    i_pv REAL NOT NULL,
    v_wind REAL,
    i_wind REAL,
    v_bat REAL NOT NULL,
    soc REAL NOT NULL CHECK (soc >= 0 AND soc <= 100),
    wind_speed REAL NOT NULL CHECK (wind_speed >= 0),
    lux REAL NOT NULL CHECK (lux >= 0),
    fan_pwm REAL NOT NULL CHECK (fan_pwm >= 0 AND fan_pwm <= 100),
    estimate_stale INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_telemetry_timestamp ON telemetry (timestamp, id);
CREATE TRIGGER IF NOT EXISTS telemetry_no_update BEFORE UPDATE ON telemetry
BEGIN SELECT RAISE(ABORT, 'telemetry is append-only'); END;
CREATE TRIGGER IF NOT EXISTS telemetry_no_delete BEFORE DELETE ON telemetry
BEGIN SELECT RAISE(ABORT, 'telemetry is append-only'); END;
"#;

const COLUMNS: &str =
    "id, timestamp, v_pv, i_pv, v_wind, i_wind, v_bat, soc, wind_speed, lux, fan_pwm, estimate_stale";

/// Columns summarised by [`TelemetryStore::aggregate`].
pub const AGGREGATE_FIELDS: &[&str] = &[
    "v_pv",
    "i_pv",
    "v_wind",
    "i_wind",
    "v_bat",
    "soc",
    "wind_speed",
    "lux",
    "fan_pwm",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub start: i64,
    pub end: i64,
    pub count: u64,
    /// `None` for a field with no values in the window.
    pub fields: BTreeMap<String, Option<FieldStats>>,
    pub mean_pv_power_w: Option<f64>,
    pub mean_wind_power_w: Option<f64>,
}

pub struct TelemetryStore {
    conn: Connection,
    last_timestamp: Option<i64>,
}

impl TelemetryStore {
    /// Opens (creating if needed) the store for writing.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        let last_timestamp = conn.query_row("SELECT MAX(timestamp) FROM telemetry", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        Ok(Self {
            conn,
            last_timestamp,
        })
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            last_timestamp: None,
        })
    }

    /// Opens an existing store for queries only.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open telemetry store {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            last_timestamp: None,
        })
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }

    /// Appends all samples in one transaction. Either every sample lands or none does.
    pub fn append_batch(&mut self, samples: &[TelemetrySample]) -> Result<Vec<i64>, PersistenceError> {
        let mut last = self.last_timestamp;
        for sample in samples {
            if let Some(prev) = last {
                if sample.timestamp < prev {
                    return Err(PersistenceError::OutOfOrder {
                        timestamp: sample.timestamp,
                        last: prev,
                    });
                }
            }
            last = Some(sample.timestamp);
        }

        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(samples.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO telemetry (timestamp, v_pv, i_pv, v_wind, i_wind, v_bat, soc, wind_speed, lux, fan_pwm, estimate_stale) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for s in samples {
                stmt.execute(params![
                    s.timestamp,
                    s.v_pv,
                    s.i_pv,
                    s.v_wind,
                    s.i_wind,
                    s.v_bat,
                    s.soc,
                    s.wind_speed,
                    s.lux,
                    s.fan_pwm,
                    s.estimate_stale,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        self.last_timestamp = last;
        Ok(ids)
    }

    pub fn latest(&self) -> Result<Option<TelemetrySample>> {
        let sql = format!("SELECT {COLUMNS} FROM telemetry ORDER BY timestamp DESC, id DESC LIMIT 1");
        let sample = self
            .conn
            .query_row(&sql, [], sample_from_row)
            .optional()
            .context("query latest sample")?;
        Ok(sample)
    }

    /// Samples with `start <= timestamp <= end`, ascending.
    pub fn range(&self, start: i64, end: i64) -> Result<Vec<TelemetrySample>> {
        self.history(Some(start), Some(end), None)
    }

    /// The most recent `n` samples, ascending.
    pub fn limit(&self, n: usize) -> Result<Vec<TelemetrySample>> {
        self.history(None, None, Some(n))
    }

    /// The most recent `limit` samples within the optional bounds, ascending.
    pub fn history(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<TelemetrySample>> {
        let limit = limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX)).unwrap_or(-1);
        let sql = format!(
            "SELECT {COLUMNS} FROM (\
                SELECT {COLUMNS} FROM telemetry \
                WHERE (?1 IS NULL OR timestamp >= ?1) AND (?2 IS NULL OR timestamp <= ?2) \
                ORDER BY timestamp DESC, id DESC LIMIT ?3\
             ) ORDER BY timestamp ASC, id ASC"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![start, end, limit], sample_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query telemetry history")?;
        Ok(rows)
    }

    pub fn aggregate(&self, start: i64, end: i64) -> Result<Aggregate> {
        let mut select = vec!["COUNT(*)".to_string()];
        for field in AGGREGATE_FIELDS {
            select.push(format!("AVG({field}), MIN({field}), MAX({field})"));
        }
        select.push("AVG(v_pv * i_pv)".to_string());
        select.push("AVG(v_wind * i_wind)".to_string());
        let sql = format!(
            "SELECT {} FROM telemetry WHERE timestamp >= ?1 AND timestamp <= ?2",
            select.join(", ")
        );

        self.conn
            .query_row(&sql, params![start, end], |row| {
                let count: i64 = row.get(0)?;
                let mut fields = BTreeMap::new();
                let mut idx = 1;
                for field in AGGREGATE_FIELDS {
                    let mean: Option<f64> = row.get(idx)?;
                    let min: Option<f64> = row.get(idx + 1)?;
                    let max: Option<f64> = row.get(idx + 2)?;
                    idx += 3;
                    let stats = match (mean, min, max) {
                        (Some(mean), Some(min), Some(max)) => Some(FieldStats { mean, min, max }),
                        _ => None,
                    };
                    fields.insert((*field).to_string(), stats);
                }
                Ok(Aggregate {
                    start,
                    end,
                    count: count.max(0) as u64,
                    fields,
                    mean_pv_power_w: row.get(idx)?,
                    mean_wind_power_w: row.get(idx + 1)?,
                })
            })
            .context("aggregate telemetry")
    }
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<TelemetrySample> {
    Ok(TelemetrySample {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        v_pv: row.get(2)?,
        i_pv: row.get(3)?,
        v_wind: row.get(4)?,
        i_wind: row.get(5)?,
        v_bat: row.get(6)?,
        soc: row.get(7)?,
        wind_speed: row.get(8)?,
        lux: row.get(9)?,
        fan_pwm: row.get(10)?,
        estimate_stale: row.get(11)?,
    })
}

impl SampleSink for TelemetryStore {
    fn append(&mut self, samples: &[TelemetrySample]) -> Result<Vec<i64>, PersistenceError> {
        self.append_batch(samples)
    }

    fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }
}

/// Opens the store on first use and again after any write failure.
pub struct ReopeningStore {
    path: PathBuf,
    store: Option<TelemetryStore>,
}

impl ReopeningStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: None,
        }
    }

    /// Opens eagerly so the ingestor starts from the stored high-water mark.
    pub fn connect(&mut self) -> Result<(), PersistenceError> {
        if self.store.is_none() {
            self.store = Some(TelemetryStore::open(&self.path)?);
        }
        Ok(())
    }
}

impl SampleSink for ReopeningStore {
    fn append(&mut self, samples: &[TelemetrySample]) -> Result<Vec<i64>, PersistenceError> {
        if self.store.is_none() {
            self.store = Some(TelemetryStore::open(&self.path)?);
        }
        let Some(store) = self.store.as_mut() else {
            return Err(PersistenceError::Unavailable {
                reason: format!("{} not open", self.path.display()),
                buffered: 0,
            });
        };
        match store.append_batch(samples) {
            Ok(ids) => Ok(ids),
            Err(err @ PersistenceError::OutOfOrder { .. }) => Err(err),
            Err(err) => {
                self.store = None;
                Err(err)
            }
        }
    }

    fn last_timestamp(&self) -> Option<i64> {
        self.store.as_ref().and_then(|store| store.last_timestamp())
    }
}
