//! Data models for shopsync
//!
//! Defines the queued local mutation (`SyncOperation`) and the enums that
//! describe which entity it touches and where it is in its lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Returned when a stored or user-supplied enum value is not recognized
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Kind of record a mutation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EntityType {
    Product,
    Sale,
    StockMovement,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [
        EntityType::Product,
        EntityType::Sale,
        EntityType::StockMovement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Sale => "sale",
            EntityType::StockMovement => "stock_movement",
        }
    }

    /// Default queue priority (lower is more urgent)
    ///
    /// Sales carry money and go first, stock movements are derived data and go last.
    pub fn default_priority(&self) -> i32 {
        match self {
            EntityType::Sale => 1,
            EntityType::Product => 2,
            EntityType::StockMovement => 3,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "product" => Ok(EntityType::Product),
            "sale" => Ok(EntityType::Sale),
            "stock_movement" => Ok(EntityType::StockMovement),
            _ => Err(ParseEnumError {
                kind: "entity type",
                value: s.to_string(),
            }),
        }
    }
}

/// What the mutation does to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [
        OperationType::Create,
        OperationType::Update,
        OperationType::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            _ => Err(ParseEnumError {
                kind: "operation type",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent
    Pending,
    /// Sent in a batch, not yet acknowledged
    InFlight,
    /// Acknowledged by the server
    Synced,
    /// Permanently failed, excluded from batches until requeued
    Failed,
    /// Rejected by the server with a conflict
    Conflicted,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 5] = [
        OperationStatus::Pending,
        OperationStatus::InFlight,
        OperationStatus::Synced,
        OperationStatus::Failed,
        OperationStatus::Conflicted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Synced => "synced",
            OperationStatus::Failed => "failed",
            OperationStatus::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(OperationStatus::Pending),
            "in_flight" => Ok(OperationStatus::InFlight),
            "synced" => Ok(OperationStatus::Synced),
            "failed" => Ok(OperationStatus::Failed),
            "conflicted" => Ok(OperationStatus::Conflicted),
            _ => Err(ParseEnumError {
                kind: "operation status",
                value: s.to_string(),
            }),
        }
    }
}

/// A local mutation waiting to be pushed to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Client-generated stable key
    pub local_id: String,
    pub entity_type: EntityType,
    /// Server id if known, empty otherwise
    #[serde(default)]
    pub entity_id: String,
    pub operation_type: OperationType,
    /// Snapshot of the entity as written locally
    pub entity_data: Value,
    /// Snapshot of the entity as of the last successful sync, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_data: Option<Value>,
    pub priority: i32,
    /// Time of the latest local mutation folded into this entry
    pub client_timestamp: DateTime<Utc>,
    /// Time the entry was first queued
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip)]
    pub status: OperationStatus,
    #[serde(skip)]
    pub conflict_id: Option<String>,
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl Default for OperationStatus {
    fn default() -> Self {
        OperationStatus::Pending
    }
}

impl SyncOperation {
    /// Create a new pending operation with the entity type's default priority
    pub fn new(
        entity_type: EntityType,
        operation_type: OperationType,
        entity_id: impl Into<String>,
        entity_data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            local_id: Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            operation_type,
            entity_data,
            base_data: None,
            priority: entity_type.default_priority(),
            client_timestamp: now,
            created_at: now,
            retry_count: 0,
            status: OperationStatus::Pending,
            conflict_id: None,
            last_error: None,
        }
    }

    /// Override the generated local id
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = local_id.into();
        self
    }

    /// Override the default priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach the last-synced snapshot used for conflict detection
    pub fn with_base(mut self, base: Value) -> Self {
        self.base_data = Some(base);
        self
    }

    /// Override the client timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.client_timestamp = timestamp;
        self.created_at = timestamp;
        self
    }

    /// Key used to coalesce repeated mutations of the same entity
    pub fn coalesce_key(&self) -> &str {
        if self.entity_id.is_empty() {
            &self.local_id
        } else {
            &self.entity_id
        }
    }

    /// Version the local mutation was based on, if the payload carries one
    pub fn base_version(&self) -> Option<i64> {
        self.entity_data
            .get("version")
            .and_then(Value::as_i64)
            .or_else(|| {
                self.base_data
                    .as_ref()
                    .and_then(|b| b.get("version"))
                    .and_then(Value::as_i64)
            })
    }
}

/// Shallow-merge `patch` into `target`
///
/// Object fields in `patch` overwrite those in `target`. A non-object on either
/// side replaces `target` wholesale.
pub fn merge_entity_data(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target_map), Some(patch_map)) => {
            for (key, value) in patch_map {
                target_map.insert(key.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}
