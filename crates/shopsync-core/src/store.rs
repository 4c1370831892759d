//! Local record store seam
//!
//! The sync core never owns the app's product/sale/stock tables. It talks to
//! them through [`LocalStore`]: apply what the server sent, persist the delta
//! watermark, and learn server ids for records created offline.
//! [`crate::storage::SqliteLocalStore`] is the bundled implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;
use crate::models::{EntityType, SyncOperation};
use crate::sync::message::{DeletedEntity, ModifiedEntity};

/// Server-supplied delta watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    /// Opaque server timestamp passed back on the next delta request
    pub last_sync_timestamp: String,
    pub sync_session_id: String,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn new(last_sync_timestamp: impl Into<String>, sync_session_id: impl Into<String>) -> Self {
        Self {
            last_sync_timestamp: last_sync_timestamp.into(),
            sync_session_id: sync_session_id.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Persistent local record store used by sync cycles
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Apply one page of server changes for `entity_type`
    ///
    /// Must be idempotent: a page may be applied again after a crash before
    /// its checkpoint was stored.
    async fn apply_delta(
        &self,
        entity_type: EntityType,
        modified: &[ModifiedEntity],
        deleted: &[DeletedEntity],
    ) -> SyncResult<()>;

    /// Overwrite a record with the outcome of a conflict resolution
    ///
    /// `data` of `None` means the record is deleted.
    async fn apply_resolved(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        data: Option<&Value>,
        version: Option<i64>,
    ) -> SyncResult<()>;

    /// The server accepted `op` and assigned `server_id` to its entity
    async fn acknowledge(&self, op: &SyncOperation, server_id: &str) -> SyncResult<()> {
        let _ = (op, server_id);
        Ok(())
    }

    async fn get_checkpoint(&self) -> SyncResult<Option<SyncCheckpoint>>;

    /// Persist the watermark; called only after the page it covers is applied
    async fn set_checkpoint(&self, checkpoint: &SyncCheckpoint) -> SyncResult<()>;
}
