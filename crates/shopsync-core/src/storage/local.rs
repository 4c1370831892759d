//! Bundled SQLite local record store
//!
//! Keeps a JSON copy of every entity the device knows about, plus the delta
//! checkpoint. Apps with their own tables implement [`LocalStore`] instead.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::{from_millis, to_millis, Database, StorageError, StorageResult};
use crate::error::SyncResult;
use crate::models::{merge_entity_data, EntityType, OperationType, SyncOperation};
use crate::queue::{EnqueueOutcome, SyncQueue};
use crate::store::{LocalStore, SyncCheckpoint};
use crate::sync::message::{DeletedEntity, ModifiedEntity};

/// A locally stored entity
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: Value,
    pub version: Option<i64>,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

/// [`LocalStore`] backed by the sync database
#[derive(Clone)]
pub struct SqliteLocalStore {
    db: Database,
}

impl SqliteLocalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StorageResult<Option<StoredEntity>> {
        self.db
            .with_conn(|conn| get_entity(conn, entity_type, entity_id))
    }

    /// Live (not deleted) entity counts per type
    pub fn entity_counts(&self) -> StorageResult<BTreeMap<String, usize>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, COUNT(*) FROM entities WHERE deleted = 0 GROUP BY entity_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?;
            let mut counts = BTreeMap::new();
            for row in rows {
                let (entity_type, n) = row?;
                counts.insert(entity_type, n);
            }
            Ok(counts)
        })
    }

    /// Write a local change and queue it for upload
    ///
    /// The entity as last known before this write becomes the operation's
    /// base snapshot. A create without an id gets a generated one.
    pub fn record_local_mutation(
        &self,
        queue: &SyncQueue,
        entity_type: EntityType,
        operation_type: OperationType,
        entity_id: &str,
        data: Value,
    ) -> SyncResult<EnqueueOutcome> {
        let entity_id = if entity_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            entity_id.to_string()
        };

        let base = self.db.with_tx(|tx| {
            let existing = get_entity(tx, entity_type, &entity_id)?;
            let base = existing
                .as_ref()
                .filter(|e| !e.deleted)
                .map(|e| e.data.clone());
            let version = existing.as_ref().and_then(|e| e.version);

            let (stored, deleted) = match operation_type {
                OperationType::Delete => (
                    base.clone().unwrap_or_else(|| Value::Object(Default::default())),
                    true,
                ),
                OperationType::Create | OperationType::Update => {
                    let mut stored = base.clone().unwrap_or_else(|| Value::Object(Default::default()));
                    merge_entity_data(&mut stored, &data);
                    (stored, false)
                }
            };
            upsert(tx, entity_type, &entity_id, &stored, version, deleted)?;
            Ok(base)
        })?;

        let mut op = SyncOperation::new(entity_type, operation_type, entity_id, data);
        if let Some(base) = base {
            op = op.with_base(base);
        }
        Ok(queue.enqueue(op)?)
    }

    /// Entities with a local change still in the queue keep the local copy;
    /// the upload or the conflict resolution settles them.
    fn apply_delta_sync(
        &self,
        entity_type: EntityType,
        modified: &[ModifiedEntity],
        deleted: &[DeletedEntity],
    ) -> StorageResult<()> {
        self.db.with_tx(|tx| {
            let mut applied = 0;
            let mut skipped = 0;
            for entity in modified.iter().filter(|e| e.entity_type == entity_type) {
                if has_unsynced_change(tx, entity_type, &entity.entity_id)? {
                    skipped += 1;
                    continue;
                }
                applied += upsert_if_newer(
                    tx,
                    entity_type,
                    &entity.entity_id,
                    &entity.entity_data,
                    entity.version,
                    false,
                )?;
            }
            for entity in deleted.iter().filter(|e| e.entity_type == entity_type) {
                if has_unsynced_change(tx, entity_type, &entity.entity_id)? {
                    skipped += 1;
                    continue;
                }
                let data = get_entity(tx, entity_type, &entity.entity_id)?
                    .map(|e| e.data)
                    .unwrap_or_else(|| Value::Object(Default::default()));
                applied += upsert_if_newer(
                    tx,
                    entity_type,
                    &entity.entity_id,
                    &data,
                    entity.version,
                    true,
                )?;
            }
            if skipped > 0 {
                debug!(
                    "Kept local copy of {} {} entities with unsynced changes",
                    skipped, entity_type
                );
            }
            debug!("Applied {} {} changes from server", applied, entity_type);
            Ok(())
        })
    }
}

fn has_unsynced_change(conn: &Connection, entity_type: EntityType, entity_id: &str) -> StorageResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sync_queue WHERE entity_type = ?1 AND coalesce_key = ?2 LIMIT 1",
            params![entity_type.as_str(), entity_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn get_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> StorageResult<Option<StoredEntity>> {
    let row = conn
        .query_row(
            "SELECT data, version, deleted, updated_at FROM entities \
             WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type.as_str(), entity_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(data, version, deleted, updated_at)| {
        Ok(StoredEntity {
            entity_type,
            entity_id: entity_id.to_string(),
            data: serde_json::from_str(&data)
                .map_err(|e| StorageError::corrupt(format!("entities/{entity_type}/{entity_id}"), e))?,
            version,
            deleted,
            updated_at: from_millis(updated_at),
        })
    })
    .transpose()
}

fn upsert(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    data: &Value,
    version: Option<i64>,
    deleted: bool,
) -> StorageResult<()> {
    let data = serde_json::to_string(data).map_err(|e| StorageError::corrupt("entities", e))?;
    conn.execute(
        "INSERT INTO entities (entity_type, entity_id, data, version, updated_at, deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
         data = excluded.data, version = excluded.version, \
         updated_at = excluded.updated_at, deleted = excluded.deleted",
        params![
            entity_type.as_str(),
            entity_id,
            data,
            version,
            to_millis(&Utc::now()),
            deleted
        ],
    )?;
    Ok(())
}

/// Upsert unless the stored copy carries a newer version; returns rows written
fn upsert_if_newer(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    data: &Value,
    version: i64,
    deleted: bool,
) -> StorageResult<usize> {
    let data = serde_json::to_string(data).map_err(|e| StorageError::corrupt("entities", e))?;
    Ok(conn.execute(
        "INSERT INTO entities (entity_type, entity_id, data, version, updated_at, deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
         data = excluded.data, version = excluded.version, \
         updated_at = excluded.updated_at, deleted = excluded.deleted \
         WHERE entities.version IS NULL OR excluded.version >= entities.version",
        params![
            entity_type.as_str(),
            entity_id,
            data,
            version,
            to_millis(&Utc::now()),
            deleted
        ],
    )?)
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn apply_delta(
        &self,
        entity_type: EntityType,
        modified: &[ModifiedEntity],
        deleted: &[DeletedEntity],
    ) -> SyncResult<()> {
        Ok(self.apply_delta_sync(entity_type, modified, deleted)?)
    }

    async fn apply_resolved(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        data: Option<&Value>,
        version: Option<i64>,
    ) -> SyncResult<()> {
        self.db.with_tx(|tx| {
            let existing = get_entity(tx, entity_type, entity_id)?;
            let (stored, deleted) = match data {
                Some(data) => (data.clone(), false),
                None => (
                    existing
                        .as_ref()
                        .map(|e| e.data.clone())
                        .unwrap_or_else(|| Value::Object(Default::default())),
                    true,
                ),
            };
            let version = version.or(existing.and_then(|e| e.version));
            upsert(tx, entity_type, entity_id, &stored, version, deleted)
        })?;
        Ok(())
    }

    async fn acknowledge(&self, op: &SyncOperation, server_id: &str) -> SyncResult<()> {
        let local_key = op.coalesce_key();
        if server_id.is_empty() || server_id == local_key {
            return Ok(());
        }

        self.db.with_conn(|conn| {
            let moved = conn.execute(
                "UPDATE OR REPLACE entities SET entity_id = ?3 \
                 WHERE entity_type = ?1 AND entity_id = ?2",
                params![op.entity_type.as_str(), local_key, server_id],
            )?;
            if moved > 0 {
                info!("{} {} is now {} on the server", op.entity_type, local_key, server_id);
            }
            Ok(())
        })?;
        Ok(())
    }

    async fn get_checkpoint(&self) -> SyncResult<Option<SyncCheckpoint>> {
        let checkpoint = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_sync_timestamp, sync_session_id, updated_at \
                     FROM sync_checkpoint WHERE id = 1",
                    [],
                    |row| {
                        Ok(SyncCheckpoint {
                            last_sync_timestamp: row.get(0)?,
                            sync_session_id: row.get(1)?,
                            updated_at: from_millis(row.get(2)?),
                        })
                    },
                )
                .optional()?)
        })?;
        Ok(checkpoint)
    }

    async fn set_checkpoint(&self, checkpoint: &SyncCheckpoint) -> SyncResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_checkpoint \
                 (id, last_sync_timestamp, sync_session_id, updated_at) VALUES (1, ?1, ?2, ?3)",
                params![
                    checkpoint.last_sync_timestamp,
                    checkpoint.sync_session_id,
                    to_millis(&checkpoint.updated_at)
                ],
            )?;
            Ok(())
        })?;
        debug!("Checkpoint advanced to {}", checkpoint.last_sync_timestamp);
        Ok(())
    }
}
