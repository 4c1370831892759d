//! Sync endpoint message types
//!
//! JSON bodies exchanged with `POST /api/sync/batch` and
//! `GET /api/sync/delta`. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{EntityType, OperationType, SyncOperation};

/// Client version reported to the server
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Batch upload body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub app_version: String,
    pub sync_session_id: String,
    pub client_timestamp: DateTime<Utc>,
    pub operations: Vec<SyncOperation>,
}

impl BatchRequest {
    pub fn new(
        device_id: &str,
        user_id: Option<&str>,
        sync_session_id: &str,
        operations: Vec<SyncOperation>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id: user_id.map(str::to_string),
            app_version: APP_VERSION.to_string(),
            sync_session_id: sync_session_id.to_string(),
            client_timestamp: Utc::now(),
            operations,
        }
    }
}

/// Per-operation outcome reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
    Conflict,
}

/// Server's view of a conflicting entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConflict {
    #[serde(default)]
    pub conflict_id: Option<String>,
    /// `update_conflict`, `delete_conflict`, `create_conflict` or `constraint_violation`
    #[serde(default)]
    pub conflict_type: Option<String>,
    /// Current server record; absent when the server deleted it
    #[serde(default)]
    pub server_data: Option<Value>,
    #[serde(default)]
    pub server_version: Option<i64>,
    #[serde(default)]
    pub server_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerConflict {
    pub fn server_deleted(&self) -> bool {
        self.deleted || self.conflict_type.as_deref() == Some("delete_conflict")
    }
}

/// Error detail for a failed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub http_status: Option<u16>,
    /// Explicit server hint, overriding classification by code
    #[serde(default)]
    pub retryable: Option<bool>,
}

impl OperationError {
    /// Classify into the shared error taxonomy
    pub fn to_sync_error(&self) -> SyncError {
        let message = if self.error_message.is_empty() {
            self.error_code.clone()
        } else {
            format!("{}: {}", self.error_code, self.error_message)
        };

        if let Some(status) = self.http_status {
            return SyncError::from_status(status, message, None);
        }

        match self.error_code.to_ascii_uppercase().as_str() {
            "NETWORK_ERROR" => SyncError::Network(message),
            "TIMEOUT" => SyncError::Server {
                status: 504,
                message,
            },
            "SERVER_ERROR" | "INTERNAL_ERROR" | "SERVICE_UNAVAILABLE" => SyncError::Server {
                status: 500,
                message,
            },
            "RATE_LIMITED" => SyncError::RateLimited { retry_after: None },
            "UNAUTHORIZED" | "FORBIDDEN" => SyncError::Auth(message),
            "CONFLICT" => SyncError::Conflict(message),
            "VALIDATION_ERROR" | "BAD_REQUEST" | "NOT_FOUND" => SyncError::Client {
                status: 400,
                message,
            },
            _ => SyncError::Unknown(message),
        }
    }

    /// Whether the operation should be abandoned rather than retried
    pub fn is_permanent(&self) -> bool {
        match self.retryable {
            Some(retryable) => !retryable,
            None => !self.to_sync_error().is_retryable(),
        }
    }
}

/// Result for one uploaded operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub local_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub conflict: Option<ServerConflict>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

impl OperationResult {
    pub fn success(local_id: &str, server_id: Option<&str>) -> Self {
        Self {
            local_id: local_id.to_string(),
            status: ResultStatus::Success,
            server_id: server_id.map(str::to_string),
            conflict: None,
            error: None,
        }
    }

    pub fn failed(local_id: &str, error: OperationError) -> Self {
        Self {
            local_id: local_id.to_string(),
            status: ResultStatus::Failed,
            server_id: None,
            conflict: None,
            error: Some(error),
        }
    }

    pub fn conflict(local_id: &str, conflict: ServerConflict) -> Self {
        Self {
            local_id: local_id.to_string(),
            status: ResultStatus::Conflict,
            server_id: None,
            conflict: Some(conflict),
            error: None,
        }
    }
}

/// Batch upload response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    #[serde(default)]
    pub sync_session_id: Option<String>,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default, alias = "errorCount")]
    pub failed_count: usize,
    #[serde(default)]
    pub conflict_count: usize,
    #[serde(default)]
    pub results: Vec<OperationResult>,
    #[serde(default)]
    pub server_timestamp: Option<String>,
}

impl BatchResponse {
    pub fn from_results(results: Vec<OperationResult>) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        Self {
            sync_session_id: None,
            success_count: count(ResultStatus::Success),
            failed_count: count(ResultStatus::Failed),
            conflict_count: count(ResultStatus::Conflict),
            server_timestamp: Some(Utc::now().to_rfc3339()),
            results,
        }
    }
}

/// Delta download query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRequest {
    pub last_sync_timestamp: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<EntityType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_session_id: Option<String>,
}

impl DeltaRequest {
    /// Watermark used when no checkpoint exists yet
    pub const EPOCH: &'static str = "1970-01-01T00:00:00Z";

    /// Query string pairs; entity types are comma-joined
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("lastSyncTimestamp", self.last_sync_timestamp.clone()),
            ("deviceId", self.device_id.clone()),
            ("appVersion", APP_VERSION.to_string()),
        ];
        if let Some(types) = &self.entity_types {
            let joined: Vec<&str> = types.iter().map(EntityType::as_str).collect();
            pairs.push(("entityTypes", joined.join(",")));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(session) = &self.sync_session_id {
            pairs.push(("syncSessionId", session.clone()));
        }
        pairs
    }
}

/// A record created or changed on the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub entity_data: Value,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
    #[serde(default = "default_modified_op")]
    pub operation_type: OperationType,
}

fn default_modified_op() -> OperationType {
    OperationType::Update
}

/// A record deleted on the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub deleted_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

/// One page of server changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    #[serde(default)]
    pub modified_entities: Vec<ModifiedEntity>,
    #[serde(default)]
    pub deleted_entities: Vec<DeletedEntity>,
    pub server_timestamp: String,
    #[serde(default)]
    pub sync_session_id: String,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_sync_timestamp: Option<String>,
}

impl DeltaResponse {
    /// Watermark to store once this page is applied
    pub fn watermark(&self) -> &str {
        self.next_sync_timestamp
            .as_deref()
            .filter(|ts| !ts.is_empty())
            .unwrap_or(&self.server_timestamp)
    }

    pub fn len(&self) -> usize {
        self.modified_entities.len() + self.deleted_entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fresh id for one sync cycle
pub fn new_session_id() -> String {
    format!("sync-{}", Uuid::new_v4())
}
