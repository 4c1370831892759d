//! Conflict records and their classifications

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{EntityType, OperationType, ParseEnumError};

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().replace('-', "_").as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

/// How local and server state disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed overlapping fields
    UpdateUpdate,
    /// Local update of a record the server deleted
    UpdateDelete,
    /// Local delete of a record the server changed
    DeleteUpdate,
    /// Two creates map to the same natural key
    CreateCreate,
    /// The server version differs from the one the local change was based on
    VersionConflict,
    /// The server rejected the change on a uniqueness or integrity rule
    ConstraintViolation,
    /// The server flagged a conflict no other rule explains
    DataInconsistency,
}

string_enum!(ConflictType, "conflict type", {
    UpdateUpdate => "update_update",
    UpdateDelete => "update_delete",
    DeleteUpdate => "delete_update",
    CreateCreate => "create_create",
    VersionConflict => "version_conflict",
    ConstraintViolation => "constraint_violation",
    DataInconsistency => "data_inconsistency",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(ConflictSeverity, "conflict severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Failed,
}

string_enum!(ConflictStatus, "conflict status", {
    Pending => "pending",
    Resolved => "resolved",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Newer timestamp wins; the server wins ties
    LastWriteWins,
    ClientWins,
    ServerWins,
    /// Field-level merge; conflicting fields fall back to last-write-wins
    Merge,
    /// Domain rule registered for the entity type
    BusinessRules,
    /// Left pending for a human decision
    Manual,
}

string_enum!(ResolutionStrategy, "resolution strategy", {
    LastWriteWins => "last_write_wins",
    ClientWins => "client_wins",
    ServerWins => "server_wins",
    Merge => "merge",
    BusinessRules => "business_rules",
    Manual => "manual",
});

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub data: Value,
    pub version: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

/// What to do with the queued operation once a conflict is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Keep the server record and drop the local operation
    AcceptServer,
    /// Send the resolved data back as an operation of this type
    Push(OperationType),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub outcome: ResolutionOutcome,
    /// Resulting record; `Null` when the outcome is a deletion
    pub data: Value,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// A detected disagreement between a queued operation and the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub conflict_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Queue entry that was rejected
    pub local_id: String,
    pub operation_type: OperationType,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    /// Fields whose values differ and were changed on both sides
    #[serde(default)]
    pub conflicting_fields: Vec<String>,
    pub local: Snapshot,
    pub server: Snapshot,
    /// Last-synced snapshot the local change started from
    #[serde(default)]
    pub base: Option<Value>,
    pub status: ConflictStatus,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Failed automatic resolution attempts
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Automatic resolution gave up; only a manual decision closes it
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub server_message: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    pub fn new_id() -> String {
        format!("conflict-{}", Uuid::new_v4())
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(ConflictSeverity::Critical > ConflictSeverity::High);
        assert!(ConflictSeverity::Medium > ConflictSeverity::Low);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "last-write-wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::LastWriteWins
        );
        assert_eq!("MERGE".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::Merge);
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_outcome_serialization() {
        let value = serde_json::to_value(ResolutionOutcome::Push(OperationType::Update)).unwrap();
        assert_eq!(value, serde_json::json!({"push": "update"}));
        let value = serde_json::to_value(ResolutionOutcome::AcceptServer).unwrap();
        assert_eq!(value, "accept_server");
    }
}
