//! Durable sync queue
//!
//! Pending local mutations live in the `sync_queue` table. Repeated mutations
//! of one entity coalesce into its single PENDING entry:
//!
//! | queued | incoming      | result                          |
//! |--------|---------------|---------------------------------|
//! | CREATE | UPDATE        | CREATE, data merged             |
//! | CREATE | DELETE        | entry removed (never synced)    |
//! | UPDATE | UPDATE        | UPDATE, data merged             |
//! | UPDATE | DELETE        | DELETE                          |
//! | DELETE | CREATE/UPDATE | UPDATE, data replaced           |
//!
//! Coalescing keeps the original `created_at` and `base_data`, bumps
//! `client_timestamp` to the latest mutation and keeps the more urgent
//! priority. Entries that are IN_FLIGHT are never touched by coalescing; a
//! new PENDING entry is created alongside instead.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    merge_entity_data, EntityType, OperationStatus, OperationType, SyncOperation,
};
use crate::storage::{from_millis, to_millis, Database, StorageError, StorageResult};

/// Default number of transient failures before an operation is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 10;

const SELECT_COLUMNS: &str = "local_id, entity_type, entity_id, operation_type, entity_data, \
     base_data, priority, client_timestamp, created_at, retry_count, status, conflict_id, last_error";

const DEQUEUE_ORDER: &str = "ORDER BY priority ASC, client_timestamp ASC, rowid ASC";

/// What `enqueue` did with an operation
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Stored as a new entry
    Queued(SyncOperation),
    /// Folded into an existing PENDING entry
    Coalesced(SyncOperation),
    /// A delete cancelled a create that never reached the server
    Cancelled { local_id: String },
}

impl EnqueueOutcome {
    /// The stored entry, if any remains
    pub fn operation(&self) -> Option<&SyncOperation> {
        match self {
            EnqueueOutcome::Queued(op) | EnqueueOutcome::Coalesced(op) => Some(op),
            EnqueueOutcome::Cancelled { .. } => None,
        }
    }
}

/// Queue counts for status displays
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_entity_type: BTreeMap<String, usize>,
    pub by_operation_type: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<i32, usize>,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn count(&self, status: OperationStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Priority-ordered persistent queue of local mutations
#[derive(Clone)]
pub struct SyncQueue {
    db: Database,
    max_retries: u32,
}

impl SyncQueue {
    /// Open the queue, returning interrupted IN_FLIGHT entries to PENDING
    pub fn open(db: Database, max_retries: u32) -> StorageResult<Self> {
        let queue = Self {
            db,
            max_retries: max_retries.max(1),
        };
        let reverted = queue.revert_in_flight()?;
        if reverted > 0 {
            warn!("Recovered {} unacknowledged in-flight operations", reverted);
        }
        Ok(queue)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Add an operation, coalescing with the entity's PENDING entry
    pub fn enqueue(&self, op: SyncOperation) -> StorageResult<EnqueueOutcome> {
        self.db.with_tx(|tx| {
            let existing = find_pending(tx, op.entity_type, op.coalesce_key())?;
            match existing {
                Some(existing) => coalesce(tx, existing, op),
                None => insert_new(tx, op).map(EnqueueOutcome::Queued),
            }
        })
    }

    /// Take up to `max_size` PENDING entries in priority order, marking them IN_FLIGHT
    pub fn dequeue_batch(&self, max_size: usize) -> StorageResult<Vec<SyncOperation>> {
        self.dequeue_batch_skipping(max_size, &HashSet::new())
    }

    /// Like [`dequeue_batch`](Self::dequeue_batch), passing over the given entries
    ///
    /// A sync cycle uses this so an entry that went back to PENDING during the
    /// cycle waits for the next one.
    pub fn dequeue_batch_skipping(
        &self,
        max_size: usize,
        skip: &HashSet<String>,
    ) -> StorageResult<Vec<SyncOperation>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }
        self.db.with_tx(|tx| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_queue WHERE status = 'pending' {DEQUEUE_ORDER}");
            let mut ops = Vec::with_capacity(max_size);
            {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_operation)?;
                for op in rows {
                    let op = op?;
                    if skip.contains(&op.local_id) {
                        continue;
                    }
                    ops.push(op);
                    if ops.len() == max_size {
                        break;
                    }
                }
            }

            let now = to_millis(&Utc::now());
            for op in &mut ops {
                tx.execute(
                    "UPDATE sync_queue SET status = 'in_flight', updated_at = ?2 WHERE local_id = ?1",
                    params![op.local_id, now],
                )?;
                op.status = OperationStatus::InFlight;
            }
            Ok(ops)
        })
    }

    /// The server acknowledged the operation; remove it
    pub fn mark_synced(&self, local_id: &str) -> StorageResult<bool> {
        self.db.with_tx(|tx| {
            let removed = tx.execute("DELETE FROM sync_queue WHERE local_id = ?1", [local_id])?;
            tx.execute(
                "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('last_synced_at', ?1)",
                [to_millis(&Utc::now()).to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    /// Record a failed attempt
    ///
    /// Permanent failures become FAILED. Transient failures return to PENDING
    /// with the retry count incremented, or become FAILED once the count
    /// reaches the dead-letter limit. Returns the resulting status.
    pub fn mark_failed(
        &self,
        local_id: &str,
        permanent: bool,
        error: &str,
    ) -> StorageResult<Option<OperationStatus>> {
        let max_retries = self.max_retries;
        self.db.with_tx(|tx| {
            let retry_count: Option<u32> = tx
                .query_row(
                    "SELECT retry_count FROM sync_queue WHERE local_id = ?1",
                    [local_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(retry_count) = retry_count else {
                return Ok(None);
            };

            let retry_count = if permanent { retry_count } else { retry_count + 1 };
            let status = if permanent || retry_count >= max_retries {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };

            tx.execute(
                "UPDATE sync_queue SET status = ?2, retry_count = ?3, last_error = ?4, updated_at = ?5 \
                 WHERE local_id = ?1",
                params![
                    local_id,
                    status.as_str(),
                    retry_count,
                    error,
                    to_millis(&Utc::now())
                ],
            )?;

            if status == OperationStatus::Failed {
                warn!("Operation {} failed permanently: {}", local_id, error);
            } else {
                debug!("Operation {} will be retried ({}/{})", local_id, retry_count, max_retries);
            }
            Ok(Some(status))
        })
    }

    /// The server rejected the operation with a conflict
    pub fn mark_conflicted(&self, local_id: &str, conflict_id: &str) -> StorageResult<bool> {
        self.update_where(
            "UPDATE sync_queue SET status = 'conflicted', conflict_id = ?2, updated_at = ?3 \
             WHERE local_id = ?1",
            params![local_id, conflict_id, to_millis(&Utc::now())],
        )
        .map(|n| n > 0)
    }

    /// Return every IN_FLIGHT entry to PENDING
    pub fn revert_in_flight(&self) -> StorageResult<usize> {
        self.update_where(
            "UPDATE sync_queue SET status = 'pending', updated_at = ?1 WHERE status = 'in_flight'",
            params![to_millis(&Utc::now())],
        )
    }

    /// Return the given entries to PENDING if they are still IN_FLIGHT
    pub fn revert(&self, local_ids: &[String]) -> StorageResult<usize> {
        self.db.with_tx(|tx| {
            let now = to_millis(&Utc::now());
            let mut reverted = 0;
            for local_id in local_ids {
                reverted += tx.execute(
                    "UPDATE sync_queue SET status = 'pending', updated_at = ?2 \
                     WHERE local_id = ?1 AND status = 'in_flight'",
                    params![local_id, now],
                )?;
            }
            Ok(reverted)
        })
    }

    /// Remove entries with the given status, or all entries
    pub fn clear(&self, status: Option<OperationStatus>) -> StorageResult<usize> {
        let removed = match status {
            Some(status) => self.update_where(
                "DELETE FROM sync_queue WHERE status = ?1",
                params![status.as_str()],
            )?,
            None => self.update_where("DELETE FROM sync_queue", params![])?,
        };
        info!("Cleared {} queue entries", removed);
        Ok(removed)
    }

    /// Put dead-lettered entries back in line with a fresh retry budget
    pub fn requeue_failed(&self) -> StorageResult<usize> {
        self.update_where(
            "UPDATE sync_queue SET status = 'pending', retry_count = 0, last_error = NULL, \
             updated_at = ?1 WHERE status = 'failed'",
            params![to_millis(&Utc::now())],
        )
    }

    /// Re-queue a conflicted entry carrying the resolved data
    pub fn requeue_resolved(
        &self,
        local_id: &str,
        operation_type: OperationType,
        data: &Value,
    ) -> StorageResult<bool> {
        let data = serde_json::to_string(data)
            .map_err(|e| StorageError::corrupt("sync_queue.entity_data", e))?;
        self.update_where(
            "UPDATE sync_queue SET status = 'pending', operation_type = ?2, entity_data = ?3, \
             conflict_id = NULL, client_timestamp = ?4, updated_at = ?4 WHERE local_id = ?1",
            params![local_id, operation_type.as_str(), data, to_millis(&Utc::now())],
        )
        .map(|n| n > 0)
    }

    /// Point entries queued under a local key at the server-assigned id
    pub fn assign_server_id(
        &self,
        entity_type: EntityType,
        local_key: &str,
        server_id: &str,
    ) -> StorageResult<usize> {
        self.update_where(
            "UPDATE sync_queue SET entity_id = ?3, coalesce_key = ?3 \
             WHERE entity_type = ?1 AND coalesce_key = ?2",
            params![entity_type.as_str(), local_key, server_id],
        )
    }

    /// Delete one entry regardless of status
    pub fn remove(&self, local_id: &str) -> StorageResult<bool> {
        self.update_where("DELETE FROM sync_queue WHERE local_id = ?1", params![local_id])
            .map(|n| n > 0)
    }

    pub fn get(&self, local_id: &str) -> StorageResult<Option<SyncOperation>> {
        self.db.with_conn(|conn| get_by_id(conn, local_id))
    }

    /// Entries in dequeue order, optionally filtered by status
    pub fn list(&self, status: Option<OperationStatus>) -> StorageResult<Vec<SyncOperation>> {
        self.db.with_conn(|conn| {
            let ops = match status {
                Some(status) => {
                    let sql = format!(
                        "SELECT {SELECT_COLUMNS} FROM sync_queue WHERE status = ?1 {DEQUEUE_ORDER}"
                    );
                    conn.prepare(&sql)?
                        .query_map([status.as_str()], row_to_operation)?
                        .collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_queue {DEQUEUE_ORDER}");
                    conn.prepare(&sql)?
                        .query_map([], row_to_operation)?
                        .collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(ops)
        })
    }

    pub fn pending_count(&self) -> StorageResult<usize> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Counts by status, entity type, operation type and priority
    pub fn stats(&self) -> StorageResult<QueueStats> {
        self.db.with_conn(|conn| {
            let mut stats = QueueStats::default();

            let mut stmt = conn.prepare(
                "SELECT status, entity_type, operation_type, priority, COUNT(*) \
                 FROM sync_queue GROUP BY status, entity_type, operation_type, priority",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, i64>(4)? as usize,
                ))
            })?;
            for row in rows {
                let (status, entity_type, operation_type, priority, n) = row?;
                stats.total += n;
                *stats.by_status.entry(status).or_default() += n;
                *stats.by_entity_type.entry(entity_type).or_default() += n;
                *stats.by_operation_type.entry(operation_type).or_default() += n;
                *stats.by_priority.entry(priority).or_default() += n;
            }

            let oldest: Option<i64> = conn.query_row(
                "SELECT MIN(created_at) FROM sync_queue WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            stats.oldest_pending_at = oldest.map(from_millis);

            let last_synced: Option<String> = conn
                .query_row(
                    "SELECT value FROM schema_info WHERE key = 'last_synced_at'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            stats.last_synced_at = last_synced
                .and_then(|v| v.parse::<i64>().ok())
                .map(from_millis);

            Ok(stats)
        })
    }

    fn update_where(&self, sql: &str, params: impl rusqlite::Params) -> StorageResult<usize> {
        self.db
            .with_conn(|conn| conn.execute(sql, params).map_err(StorageError::from_sqlite))
    }
}

fn find_pending(
    conn: &Connection,
    entity_type: EntityType,
    key: &str,
) -> StorageResult<Option<SyncOperation>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM sync_queue \
         WHERE entity_type = ?1 AND coalesce_key = ?2 AND status = 'pending' \
         ORDER BY created_at ASC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![entity_type.as_str(), key], row_to_operation)
        .optional()?)
}

fn get_by_id(conn: &Connection, local_id: &str) -> StorageResult<Option<SyncOperation>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_queue WHERE local_id = ?1");
    Ok(conn.query_row(&sql, [local_id], row_to_operation).optional()?)
}

fn insert_new(conn: &Connection, mut op: SyncOperation) -> StorageResult<SyncOperation> {
    if op.local_id.is_empty() || get_by_id(conn, &op.local_id)?.is_some() {
        let fresh = Uuid::new_v4().to_string();
        debug!("Local id {:?} already queued, using {}", op.local_id, fresh);
        op.local_id = fresh;
    }
    op.status = OperationStatus::Pending;
    op.conflict_id = None;

    conn.execute(
        "INSERT INTO sync_queue (local_id, entity_type, entity_id, coalesce_key, operation_type, \
         entity_data, base_data, priority, client_timestamp, created_at, updated_at, retry_count, \
         status, conflict_id, last_error) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'pending', NULL, ?13)",
        params![
            op.local_id,
            op.entity_type.as_str(),
            op.entity_id,
            op.coalesce_key(),
            op.operation_type.as_str(),
            to_json(&op.entity_data)?,
            op.base_data.as_ref().map(to_json).transpose()?,
            op.priority,
            to_millis(&op.client_timestamp),
            to_millis(&op.created_at),
            to_millis(&Utc::now()),
            op.retry_count,
            op.last_error,
        ],
    )?;

    debug!(
        "Queued {} {} {} ({})",
        op.operation_type, op.entity_type, op.coalesce_key(), op.local_id
    );
    Ok(op)
}

fn coalesce(
    conn: &Connection,
    mut existing: SyncOperation,
    incoming: SyncOperation,
) -> StorageResult<EnqueueOutcome> {
    use OperationType::*;

    let operation_type = match (existing.operation_type, incoming.operation_type) {
        (Create, Delete) => {
            conn.execute(
                "DELETE FROM sync_queue WHERE local_id = ?1",
                [&existing.local_id],
            )?;
            debug!(
                "Delete cancelled unsynced create of {} {}",
                existing.entity_type,
                existing.coalesce_key()
            );
            return Ok(EnqueueOutcome::Cancelled {
                local_id: existing.local_id,
            });
        }
        (Create, _) => {
            merge_entity_data(&mut existing.entity_data, &incoming.entity_data);
            Create
        }
        (Update, Delete) | (Delete, Delete) => {
            existing.entity_data = incoming.entity_data;
            Delete
        }
        (Update, _) => {
            merge_entity_data(&mut existing.entity_data, &incoming.entity_data);
            Update
        }
        (Delete, _) => {
            existing.entity_data = incoming.entity_data;
            Update
        }
    };

    existing.operation_type = operation_type;
    existing.client_timestamp = existing.client_timestamp.max(incoming.client_timestamp);
    existing.priority = existing.priority.min(incoming.priority);
    if existing.base_data.is_none() {
        existing.base_data = incoming.base_data;
    }
    if existing.entity_id.is_empty() && !incoming.entity_id.is_empty() {
        existing.entity_id = incoming.entity_id;
    }

    conn.execute(
        "UPDATE sync_queue SET operation_type = ?2, entity_data = ?3, base_data = ?4, \
         priority = ?5, client_timestamp = ?6, entity_id = ?7, updated_at = ?8 WHERE local_id = ?1",
        params![
            existing.local_id,
            existing.operation_type.as_str(),
            to_json(&existing.entity_data)?,
            existing.base_data.as_ref().map(to_json).transpose()?,
            existing.priority,
            to_millis(&existing.client_timestamp),
            existing.entity_id,
            to_millis(&Utc::now()),
        ],
    )?;

    debug!(
        "Coalesced mutation of {} {} into {}",
        existing.entity_type,
        existing.coalesce_key(),
        existing.local_id
    );
    Ok(EnqueueOutcome::Coalesced(existing))
}

fn to_json(value: &Value) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::corrupt("sync_queue", e))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<SyncOperation> {
    let entity_type: String = row.get(1)?;
    let operation_type: String = row.get(3)?;
    let entity_data: String = row.get(4)?;
    let base_data: Option<String> = row.get(5)?;
    let status: String = row.get(10)?;

    Ok(SyncOperation {
        local_id: row.get(0)?,
        entity_type: entity_type.parse().map_err(|e| conversion_error(1, e))?,
        entity_id: row.get(2)?,
        operation_type: operation_type.parse().map_err(|e| conversion_error(3, e))?,
        entity_data: serde_json::from_str(&entity_data).map_err(|e| conversion_error(4, e))?,
        base_data: base_data
            .map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(|e| conversion_error(5, e))?,
        priority: row.get(6)?,
        client_timestamp: from_millis(row.get(7)?),
        created_at: from_millis(row.get(8)?),
        retry_count: row.get(9)?,
        status: status.parse().map_err(|e| conversion_error(10, e))?,
        conflict_id: row.get(11)?,
        last_error: row.get(12)?,
    })
}
