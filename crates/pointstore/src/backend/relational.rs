//! Relational backend on an SQLite database file.
//!
//! All series share one table keyed by `(series_id, ts)`, so replacing a
//! sample of the same timestamp is a plain upsert. Scans page through the
//! table with keyset queries instead of holding a cursor open.

use crate::backend::{paging, Backend, SampleScan};
use crate::codec;
use crate::config::{BackendSelector, StoreConfig, SyncMode};
use crate::error::Result;
use crate::lifecycle::compaction::CompactionResult;
use crate::model::{BatchEntry, QueryWindow, Sample, SeriesId, TimeOrder, Timestamp};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

/// Dialect name the builtin relational adapter registers under.
pub const SQLITE_DIALECT: &str = "sqlite";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS point_values (
    series_id INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    value REAL,
    annotation BLOB,
    PRIMARY KEY (series_id, ts)
) WITHOUT ROWID;";

const UPSERT: &str = "INSERT OR REPLACE INTO point_values (series_id, ts, value, annotation) \
                      VALUES (?1, ?2, ?3, ?4)";

const SCAN_ASC: &str = "SELECT ts, value, annotation FROM point_values
    WHERE series_id = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts ASC LIMIT ?4";

const SCAN_DESC: &str = "SELECT ts, value, annotation FROM point_values
    WHERE series_id = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts DESC LIMIT ?4";

const LATEST_BEFORE: &str = "SELECT ts, value, annotation FROM point_values
    WHERE series_id = ?1 AND ts < ?2 ORDER BY ts DESC LIMIT 1";

const EARLIEST_AT_OR_AFTER: &str = "SELECT ts, value, annotation FROM point_values
    WHERE series_id = ?1 AND ts >= ?2 ORDER BY ts ASC LIMIT 1";

/// Backend storing samples in an SQLite table.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    page_size: usize,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `config.relational_path()`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.relational_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let backend = Self::from_connection(Connection::open(&path)?, config)?;
        info!("Opened relational backend at {:?}", path);
        Ok(backend)
    }

    /// Creates a backend on a private in-memory database.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(conn: Connection, config: &StoreConfig) -> Result<Self> {
        let conn = Self::init(conn, config)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            page_size: config.batch_size.max(1),
        })
    }

    fn init(conn: Connection, config: &StoreConfig) -> Result<Connection> {
        // journal_mode answers with the mode in effect, so it is read as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let synchronous = match config.sync_mode {
            SyncMode::Fsync => "FULL",
            SyncMode::Fdatasync => "NORMAL",
            SyncMode::None => "OFF",
        };
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn query_one(&self, sql: &str, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let sample = stmt
            .query_row(params![series as i64, ts], sample_from_row)
            .optional()?;
        Ok(sample)
    }
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<Sample> {
    // SQLite stores NaN as NULL.
    let value: Option<f64> = row.get(1)?;
    Ok(Sample {
        timestamp: row.get(0)?,
        value: value.unwrap_or(f64::NAN),
        annotation: row.get(2)?,
    })
}

impl Backend for SqliteBackend {
    fn selector(&self) -> BackendSelector {
        BackendSelector::relational(SQLITE_DIALECT)
    }

    fn write(&self, series: SeriesId, sample: &Sample) -> Result<()> {
        codec::validate(sample)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(UPSERT)?;
        stmt.execute(params![
            series as i64,
            sample.timestamp,
            sample.value,
            sample.annotation
        ])?;
        Ok(())
    }

    /// Writes the batch in one transaction; on failure nothing is persisted.
    fn write_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        for entry in entries {
            codec::validate(&entry.sample)?;
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT)?;
            for entry in entries {
                stmt.execute(params![
                    entry.series as i64,
                    entry.sample.timestamp,
                    entry.sample.value,
                    entry.sample.annotation
                ])?;
            }
        }
        tx.commit()?;
        debug!("Committed batch of {} samples", entries.len());
        Ok(())
    }

    fn scan(&self, series: SeriesId, window: QueryWindow, order: TimeOrder) -> Result<SampleScan> {
        Ok(Box::new(SqliteScan {
            conn: Arc::clone(&self.conn),
            series,
            window,
            order,
            page_size: self.page_size,
            cursor: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }))
    }

    fn latest_before(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>> {
        self.query_one(LATEST_BEFORE, series, ts)
    }

    fn earliest_at_or_after(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>> {
        self.query_one(EARLIEST_AT_OR_AFTER, series, ts)
    }

    fn purge_before(&self, cutoff: Timestamp) -> Result<u64> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM point_values WHERE ts < ?1", params![cutoff])?;
        Ok(removed as u64)
    }

    /// Checkpoints the write-ahead log into the database file.
    fn compact(&self) -> Result<CompactionResult> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(CompactionResult::default())
    }
}

/// Keyset-paged scan; the connection is locked only while a page loads.
struct SqliteScan {
    conn: Arc<Mutex<Connection>>,
    series: SeriesId,
    window: QueryWindow,
    order: TimeOrder,
    page_size: usize,
    cursor: Option<Timestamp>,
    page: std::vec::IntoIter<Sample>,
    exhausted: bool,
}

impl SqliteScan {
    fn load_page(&mut self) -> Result<()> {
        let remaining = paging::remaining(self.window, self.order, self.cursor);
        if remaining.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        let sql = match self.order {
            TimeOrder::Ascending => SCAN_ASC,
            TimeOrder::Descending => SCAN_DESC,
        };
        let page = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(
                params![
                    self.series as i64,
                    remaining.start,
                    remaining.end,
                    self.page_size as i64
                ],
                sample_from_row,
            )?;
            let page = rows.collect::<rusqlite::Result<Vec<Sample>>>()?;
            page
        };

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.cursor = page.last().map(|s| s.timestamp).or(self.cursor);
        self.page = page.into_iter();
        Ok(())
    }
}

impl Iterator for SqliteScan {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.page.next() {
                return Some(Ok(sample));
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.load_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }
}
