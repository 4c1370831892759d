//! Small-file persistence helpers

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{StorageError, StorageResult};

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
pub fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StorageError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Serialize a value as pretty JSON and write it atomically
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StorageError::corrupt(path.display().to_string(), e))?;
    atomic_write(path, &bytes)
}

/// Read a JSON state file, returning `None` if it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::from_io(e, path.to_path_buf())),
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| StorageError::corrupt(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("a").join("b").join("state.json");

        atomic_write(&nested_path, b"test data").unwrap();

        assert_eq!(fs::read(&nested_path).unwrap(), b"test data");
        assert!(!nested_path.with_extension("tmp").exists());
    }

    #[test]
    fn test_json_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("history.json");

        write_json(&path, &vec![1, 2, 3]).unwrap();
        let loaded: Option<Vec<i32>> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_read_json_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let loaded: Option<Vec<i32>> = read_json(&temp_dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_read_json_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();

        let result: StorageResult<Option<Vec<i32>>> = read_json(&path);
        assert!(matches!(result, Err(StorageError::CorruptValue { .. })));
    }
}
