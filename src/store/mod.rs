//! Persistent result store (SQLite)
//!
//! **Append-only design**: one row per evaluation, never updated or deleted.
//! Many processes append to the same file; SQLite's own file locking provides
//! multi-writer safety. The default rollback journal is kept: WAL mode needs
//! shared memory, which cluster network filesystems do not provide. A busy or
//! locked database is transient and every operation retries it without a cap
//! instead of failing the evaluation.
//!
//! Composite columns are JSON text:
//!
//! ```text
//! optimization_results(rowid, iteration_num, params, glam_results, readability, metadata)
//! ```
//!
//! Two physical stores exist per run: the per-weight-group store, archived at
//! the end of each scalarization pass, and the global store that feeds the
//! similarity cache across restarts.

mod record;

pub use record::{ResultRecord, ResultRecordBuilder, RunMetadata};

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS optimization_results (
    rowid INTEGER PRIMARY KEY,
    iteration_num INTEGER,
    params TEXT,
    glam_results TEXT,
    readability TEXT,
    metadata TEXT
)";

const SELECT_COLUMNS: &str =
    "SELECT rowid, iteration_num, params, glam_results, readability, metadata FROM optimization_results";

type RawRow = (i64, i64, String, String, String, String);

/// Append-only evaluation log backed by one SQLite file.
pub struct ResultStore {
    conn: Connection,
    path: Option<PathBuf>,
    busy_backoff: Duration,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("path", &self.path)
            .field("busy_backoff", &self.busy_backoff)
            .finish_non_exhaustive()
    }
}

impl ResultStore {
    /// Open (creating if absent) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Store`] for non-transient SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
            busy_backoff: Duration::from_millis(10),
        };
        store.initialize()?;
        debug!(store = %path.display(), "opened result store");
        Ok(store)
    }

    /// Open an existing store read-only, for monitoring.
    ///
    /// Unlike [`Self::open`], a missing file is an error and nothing is
    /// created on disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Store`] if the file does not exist or cannot be
    /// opened.
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            busy_backoff: Duration::from_millis(10),
        })
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Store`] if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            path: None,
            busy_backoff: Duration::from_millis(10),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Set the sleep between retries while the store is busy.
    #[must_use]
    pub const fn with_busy_backoff(mut self, backoff: Duration) -> Self {
        self.busy_backoff = backoff;
        self
    }

    /// Set how long SQLite itself waits on a lock before reporting busy.
    /// Past that, [`Self::with_busy_backoff`] paces the retries.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Store`] if the timeout cannot be installed.
    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self> {
        self.conn.busy_timeout(timeout)?;
        Ok(self)
    }

    /// File backing this store, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        self.retry_busy(|conn| {
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "temp_store", "MEMORY")?;
            conn.execute_batch(SCHEMA)
        })
    }

    /// Run `op`, retrying for as long as SQLite reports busy or locked.
    fn retry_busy<T>(&self, mut op: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut attempts: u64 = 0;
        loop {
            match op(&self.conn) {
                Err(e) if is_busy(&e) => {
                    attempts += 1;
                    if attempts % 100 == 0 {
                        warn!(attempts, "result store still busy, retrying");
                    } else {
                        debug!(attempts, "result store busy, retrying");
                    }
                    std::thread::sleep(self.busy_backoff);
                }
                other => return other.map_err(Into::into),
            }
        }
    }

    /// Append one record, returning its row id.
    ///
    /// # Errors
    ///
    /// Returns an error for serialization failures or non-transient SQLite
    /// failures. Busy/locked conditions are retried indefinitely.
    #[allow(clippy::cast_possible_wrap)]
    pub fn append(&self, record: &ResultRecord) -> Result<i64> {
        let params_json = serde_json::to_string(record.params())?;
        let metrics_json = serde_json::to_string(record.raw_metrics())?;
        let reward_json = serde_json::to_string(record.reward())?;
        let metadata_json = serde_json::to_string(record.metadata())?;
        let sequence = record.sequence() as i64;

        self.retry_busy(|conn| {
            conn.execute(
                "INSERT INTO optimization_results
                     (iteration_num, params, glam_results, readability, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![sequence, params_json, metrics_json, reward_json, metadata_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Read every row in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be read or decoded.
    pub fn read_all(&self) -> Result<Vec<ResultRecord>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY rowid ASC");
        self.query_rows(&sql, &[])
    }

    /// Read the last `n` rows, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be read or decoded.
    #[allow(clippy::cast_possible_wrap)]
    pub fn tail(&self, n: usize) -> Result<Vec<ResultRecord>> {
        let sql = format!(
            "SELECT * FROM ({SELECT_COLUMNS} ORDER BY rowid DESC LIMIT ?1) ORDER BY rowid ASC"
        );
        self.query_rows(&sql, &[&(n as i64)])
    }

    /// First row recorded with evaluation number `sequence`.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read or decoded.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_by_sequence(&self, sequence: u64) -> Result<Option<ResultRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE iteration_num = ?1 ORDER BY rowid ASC LIMIT 1");
        let row = self.retry_busy(|conn| {
            conn.query_row(&sql, params![sequence as i64], map_raw_row)
                .optional()
        })?;
        row.map(decode_row).transpose()
    }

    /// Number of rows.
    ///
    /// # Errors
    ///
    /// Returns an error for non-transient SQLite failures.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.retry_busy(|conn| {
            conn.query_row("SELECT COUNT(*) FROM optimization_results", [], |row| row.get(0))
        })?;
        Ok(count as usize)
    }

    /// Whether the store holds no rows.
    ///
    /// # Errors
    ///
    /// Returns an error for non-transient SQLite failures.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn query_rows(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ResultRecord>> {
        let rows = self.retry_busy(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, map_raw_row)?;
            rows.collect::<rusqlite::Result<Vec<RawRow>>>()
        })?;
        rows.into_iter().map(decode_row).collect()
    }

    /// Close the store and move its file to `destination`.
    ///
    /// Returns `Ok(false)` when there is no file to move (in-memory store, or
    /// the file was already moved away).
    ///
    /// # Errors
    ///
    /// Returns an IO error if the rename fails for a reason other than a
    /// missing source.
    pub fn archive<P: AsRef<Path>>(self, destination: P) -> Result<bool> {
        let destination = destination.as_ref();
        let Some(source) = self.path.clone() else {
            return Ok(false);
        };
        if let Err((_, e)) = self.conn.close() {
            warn!(error = %e, "closing result store before archive failed");
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(&source, destination) {
            Ok(()) => {
                info!(from = %source.display(), to = %destination.display(), "archived result store");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(store = %source.display(), "store file missing, nothing to archive");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn map_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

#[allow(clippy::cast_sign_loss)]
fn decode_row((row_id, sequence, params, metrics, reward, metadata): RawRow) -> Result<ResultRecord> {
    let record = ResultRecord::builder(
        sequence.max(0) as u64,
        serde_json::from_str(&params)?,
        serde_json::from_str(&metrics)?,
        serde_json::from_str(&reward)?,
    )
    .metadata(serde_json::from_str(&metadata)?)
    .build();
    Ok(record.with_row_id(row_id))
}

/// Whether `err` is SQLite's transient busy/locked condition.
#[must_use]
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
