//! Storage layer
//!
//! One SQLite database file holds the sync queue, the conflict store and the
//! bundled local entity store. The connection sits behind a single mutex, which
//! is the writer lock shared by the UI write path and the sync cycle.
//!
//! Small JSON state files (retry history) are written with [`fs::atomic_write`].

pub mod error;
pub mod fs;
pub mod local;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, Transaction};
use tracing::debug;

pub use error::{StorageError, StorageResult};
pub use local::SqliteLocalStore;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};

/// Shared handle to the sync database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(StorageError::from_sqlite)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;

        if needs_init(&conn) {
            debug!("Initializing sync database schema at {:?}", path);
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Path of the database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        f(&conn)
    }

    /// Run `f` inside a transaction, committing on success
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let tx = conn.transaction().map_err(StorageError::from_sqlite)?;
        let value = f(&tx)?;
        tx.commit().map_err(StorageError::from_sqlite)?;
        Ok(value)
    }
}

/// Convert a timestamp to the millisecond integer stored in SQLite
pub(crate) fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored millisecond integer back to a timestamp
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("queue.db");

        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), Some(path.as_path()));

        let initialized = db.with_conn(|conn| Ok(!needs_init(conn))).unwrap();
        assert!(initialized);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue.db");

        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO schema_info (key, value) VALUES ('marker', 'x')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let marker: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT value FROM schema_info WHERE key = 'marker'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(marker, "x");
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();

        let result: StorageResult<()> = db.with_tx(|tx| {
            tx.execute("INSERT INTO schema_info (key, value) VALUES ('k', 'v')", [])?;
            Err(StorageError::corrupt("test", "boom"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM schema_info WHERE key = 'k'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let restored = from_millis(to_millis(&now));
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}
