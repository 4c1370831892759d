//! Persistent conflict records

use rusqlite::{params, OptionalExtension};

use super::types::{Conflict, ConflictStatus};
use crate::storage::{to_millis, Database, StorageError, StorageResult};

/// Conflicts kept in the `conflicts` table
#[derive(Clone)]
pub struct ConflictStore {
    db: Database,
}

fn decode(data: String) -> rusqlite::Result<Conflict> {
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl ConflictStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a conflict
    pub fn save(&self, conflict: &Conflict) -> StorageResult<()> {
        let data = serde_json::to_string(conflict)
            .map_err(|e| StorageError::corrupt(format!("conflicts/{}", conflict.conflict_id), e))?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO conflicts \
                 (conflict_id, entity_type, entity_id, status, detected_at, resolved_at, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    conflict.conflict_id,
                    conflict.entity_type.as_str(),
                    conflict.entity_id,
                    conflict.status.as_str(),
                    to_millis(&conflict.detected_at),
                    conflict.resolved_at.as_ref().map(to_millis),
                    data,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, conflict_id: &str) -> StorageResult<Option<Conflict>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT data FROM conflicts WHERE conflict_id = ?1",
                    [conflict_id],
                    |row| decode(row.get(0)?),
                )
                .optional()?)
        })
    }

    /// Conflicts in detection order, optionally filtered by status
    pub fn list(&self, status: Option<ConflictStatus>) -> StorageResult<Vec<Conflict>> {
        self.db.with_conn(|conn| {
            let conflicts = match status {
                Some(status) => conn
                    .prepare("SELECT data FROM conflicts WHERE status = ?1 ORDER BY detected_at, rowid")?
                    .query_map([status.as_str()], |row| decode(row.get(0)?))?
                    .collect::<Result<Vec<_>, _>>()?,
                None => conn
                    .prepare("SELECT data FROM conflicts ORDER BY detected_at, rowid")?
                    .query_map([], |row| decode(row.get(0)?))?
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(conflicts)
        })
    }

    /// Drop resolved conflicts beyond the newest `keep`
    pub fn trim_resolved(&self, keep: usize) -> StorageResult<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM conflicts WHERE status = 'resolved' AND conflict_id NOT IN \
                 (SELECT conflict_id FROM conflicts WHERE status = 'resolved' \
                  ORDER BY resolved_at DESC, rowid DESC LIMIT ?1)",
                [keep as i64],
            )?)
        })
    }
}
