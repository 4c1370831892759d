//! Storage error handling
//!
//! Typed errors for the queue database and the small JSON state files,
//! with recoverability classification and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error("Disk full while writing to '{path}'. Free up disk space and try again.")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write file
    #[error("Failed to write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File not found (when expected to exist)
    #[error("File not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Atomic write failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The database is busy or locked by another process
    #[error("Database is locked: {0}")]
    Busy(String),

    /// A stored JSON column or state file could not be decoded
    #[error("Corrupt stored value in {location}: {details}")]
    CorruptValue { location: String, details: String },

    /// A thread panicked while holding the connection lock
    #[error("Database connection lock was poisoned")]
    LockPoisoned,

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => StorageError::NotFound { path },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::WriteError {
                path,
                source: error,
            },
        }
    }

    /// Create an error from a SQLite error, separating lock contention
    pub fn from_sqlite(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StorageError::Busy(error.to_string())
            }
            _ => StorageError::Database(error),
        }
    }

    /// Create a corrupt-value error for a column or file
    pub fn corrupt(location: impl Into<String>, details: impl ToString) -> Self {
        StorageError::CorruptValue {
            location: location.into(),
            details: details.to_string(),
        }
    }

    /// Check if this error may go away without intervention
    ///
    /// Operations hit by a recoverable error stay PENDING and are retried on
    /// the next cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::Busy(_)
                | StorageError::Io(_)
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions of the data directory.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::Busy(_) => {
                Some("Another process is using the queue database. Close it and retry.")
            }
            StorageError::CorruptValue { .. } => {
                Some("Remove the affected entry with `shopsync queue clear` or delete the state file.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/data/queue.db"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_not_found_classification() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::from_io(io_err, PathBuf::from("/missing/retry_history.json"));

        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StorageError::DiskFull { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_corrupt_value_display() {
        let err = StorageError::corrupt("sync_queue.entity_data", "expected value at line 1");
        let msg = err.to_string();
        assert!(msg.contains("sync_queue.entity_data"));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_sqlite_error_is_not_recoverable() {
        let err = StorageError::from_sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, StorageError::Database(_)));
        assert!(!err.is_recoverable());
    }
}
