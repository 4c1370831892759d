//! Conflict detection
//!
//! Turns server-rejected operations into classified [`Conflict`]s. Pure
//! functions; persistence and events are handled by the resolver.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::warn;

use super::types::{Conflict, ConflictSeverity, ConflictStatus, ConflictType, Snapshot};
use crate::models::{merge_entity_data, EntityType, OperationType, SyncOperation};
use crate::sync::message::{OperationResult, ResultStatus, ServerConflict};

/// Bookkeeping fields never treated as user data
pub(crate) const META_FIELDS: &[&str] = &[
    "id",
    "version",
    "updated_at",
    "updatedAt",
    "created_at",
    "createdAt",
];

const QUANTITY_FIELDS: &[&str] = &["quantity", "stockquantity", "quantitychange", "qty"];
const MONEY_FIELDS: &[&str] = &[
    "price",
    "unitprice",
    "costprice",
    "sellingprice",
    "total",
    "totalamount",
    "amount",
    "discount",
    "taxamount",
];
const IDENTITY_FIELDS: &[&str] = &["sku", "barcode"];

fn normalized(field: &str) -> String {
    field.to_ascii_lowercase().replace('_', "")
}

pub(crate) fn is_meta(field: &str) -> bool {
    META_FIELDS.contains(&field)
}

pub(crate) fn is_quantity_field(field: &str) -> bool {
    QUANTITY_FIELDS.contains(&normalized(field).as_str())
}

/// How much a disagreement on `field` matters for `entity_type`
pub fn field_sensitivity(entity_type: EntityType, field: &str) -> ConflictSeverity {
    let name = normalized(field);
    if QUANTITY_FIELDS.contains(&name.as_str()) {
        match entity_type {
            EntityType::Sale | EntityType::StockMovement => ConflictSeverity::Critical,
            _ => ConflictSeverity::High,
        }
    } else if MONEY_FIELDS.contains(&name.as_str()) {
        ConflictSeverity::High
    } else if IDENTITY_FIELDS.contains(&name.as_str()) {
        ConflictSeverity::Medium
    } else {
        ConflictSeverity::Low
    }
}

fn type_severity(conflict_type: ConflictType) -> ConflictSeverity {
    match conflict_type {
        ConflictType::UpdateUpdate | ConflictType::VersionConflict => ConflictSeverity::Low,
        ConflictType::CreateCreate | ConflictType::DataInconsistency => ConflictSeverity::Medium,
        ConflictType::UpdateDelete | ConflictType::DeleteUpdate => ConflictSeverity::High,
        ConflictType::ConstraintViolation => ConflictSeverity::Critical,
    }
}

/// Severity from the conflict type and the most sensitive conflicting field
pub fn assess_severity(
    entity_type: EntityType,
    conflict_type: ConflictType,
    conflicting_fields: &[String],
) -> ConflictSeverity {
    conflicting_fields
        .iter()
        .map(|field| field_sensitivity(entity_type, field))
        .fold(type_severity(conflict_type), Ord::max)
}

fn as_object(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object()
}

/// Fields changed on both sides to different values
///
/// With a base snapshot a field conflicts when both sides moved away from
/// the base. Without one, any field present on both sides with different
/// values conflicts.
pub fn conflicting_fields(local: &Value, server: &Value, base: Option<&Value>) -> Vec<String> {
    let (Some(local), Some(server)) = (as_object(local), as_object(server)) else {
        return Vec::new();
    };
    let base = base.and_then(as_object);

    let keys: BTreeSet<&String> = local.keys().chain(server.keys()).collect();
    keys.into_iter()
        .filter(|key| !is_meta(key))
        .filter(|key| {
            let local_value = local.get(key.as_str());
            let server_value = server.get(key.as_str());
            if local_value == server_value {
                return false;
            }
            match base {
                Some(base) => {
                    let base_value = base.get(key.as_str());
                    local_value.is_some() && local_value != base_value && server_value != base_value
                }
                None => local_value.is_some() && server_value.is_some(),
            }
        })
        .cloned()
        .collect()
}

fn classify(
    op: &SyncOperation,
    server: &ServerConflict,
    conflicting: &[String],
) -> ConflictType {
    let server_deleted = server.server_deleted();
    let hint = server.conflict_type.as_deref().unwrap_or_default();

    match op.operation_type {
        OperationType::Update if server_deleted => return ConflictType::UpdateDelete,
        OperationType::Delete if !server_deleted => return ConflictType::DeleteUpdate,
        OperationType::Create if hint == "create_conflict" || server.server_data.is_some() => {
            return ConflictType::CreateCreate
        }
        _ => {}
    }

    if let (Some(based_on), Some(current)) = (op.base_version(), server.server_version) {
        if based_on != current {
            return ConflictType::VersionConflict;
        }
    }

    if !conflicting.is_empty() {
        return ConflictType::UpdateUpdate;
    }

    match hint {
        "constraint_violation" => ConflictType::ConstraintViolation,
        _ => ConflictType::DataInconsistency,
    }
}

/// Build the conflict for one rejected operation
pub fn detect_conflict(op: &SyncOperation, server: &ServerConflict) -> Conflict {
    let server_data = server.server_data.clone().unwrap_or(Value::Null);

    // Updates may carry only the changed fields; compare the full record
    let mut local_data = match (&op.base_data, op.operation_type) {
        (Some(base), OperationType::Update) => base.clone(),
        _ => Value::Object(Map::new()),
    };
    merge_entity_data(&mut local_data, &op.entity_data);

    let conflicting = conflicting_fields(&op.entity_data, &server_data, op.base_data.as_ref());
    let conflict_type = classify(op, server, &conflicting);
    let severity = assess_severity(op.entity_type, conflict_type, &conflicting);

    Conflict {
        conflict_id: server.conflict_id.clone().unwrap_or_else(Conflict::new_id),
        entity_type: op.entity_type,
        entity_id: op.coalesce_key().to_string(),
        local_id: op.local_id.clone(),
        operation_type: op.operation_type,
        conflict_type,
        severity,
        conflicting_fields: conflicting,
        local: Snapshot {
            data: local_data,
            version: op.base_version(),
            timestamp: op.client_timestamp,
            deleted: op.operation_type == OperationType::Delete,
        },
        server: Snapshot {
            data: server_data,
            version: server.server_version,
            timestamp: server.server_timestamp.unwrap_or_else(Utc::now),
            deleted: server.server_deleted(),
        },
        base: op.base_data.clone(),
        status: ConflictStatus::Pending,
        resolution: None,
        attempts: 0,
        last_error: None,
        escalated: false,
        server_message: server.message.clone(),
        detected_at: Utc::now(),
        resolved_at: None,
    }
}

/// Conflicts for every result the server flagged as conflicting
pub fn detect_conflicts(ops: &[SyncOperation], results: &[OperationResult]) -> Vec<Conflict> {
    results
        .iter()
        .filter(|result| result.status == ResultStatus::Conflict)
        .filter_map(|result| {
            let Some(op) = ops.iter().find(|op| op.local_id == result.local_id) else {
                warn!("Conflict reported for unknown operation {}", result.local_id);
                return None;
            };
            let server = result.conflict.clone().unwrap_or_default();
            Some(detect_conflict(op, &server))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn update(entity_type: EntityType, data: Value) -> SyncOperation {
        SyncOperation::new(entity_type, OperationType::Update, "e-1", data)
    }

    fn server(data: Option<Value>, version: Option<i64>) -> ServerConflict {
        ServerConflict {
            server_data: data,
            server_version: version,
            server_timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[test]
    fn test_version_mismatch_wins_over_overlap() {
        let op = update(EntityType::Product, json!({"version": 3, "price": 10}));
        let conflict = detect_conflict(&op, &server(Some(json!({"version": 4, "price": 12})), Some(4)));

        assert_eq!(conflict.conflict_type, ConflictType::VersionConflict);
        assert_eq!(conflict.conflicting_fields, vec!["price"]);
        assert_eq!(conflict.severity, ConflictSeverity::High);
        assert_eq!(conflict.local.version, Some(3));
        assert_eq!(conflict.server.version, Some(4));
    }

    #[test]
    fn test_overlapping_fields_against_base() {
        let op = update(EntityType::Product, json!({"description": "blue", "name": "Soap"}))
            .with_base(json!({"description": "plain", "name": "Soap", "price": 10}));
        let remote = json!({"description": "red", "name": "Soap", "price": 11});

        let conflict = detect_conflict(&op, &server(Some(remote), None));
        assert_eq!(conflict.conflict_type, ConflictType::UpdateUpdate);
        assert_eq!(conflict.conflicting_fields, vec!["description"]);
        assert_eq!(conflict.severity, ConflictSeverity::Low);
        assert_eq!(conflict.local.data["price"], 10);
    }

    #[test]
    fn test_disjoint_changes_do_not_conflict() {
        let base = json!({"name": "Soap", "price": 10});
        let fields = conflicting_fields(
            &json!({"name": "Soap+"}),
            &json!({"name": "Soap", "price": 11}),
            Some(&base),
        );
        assert!(fields.is_empty());
    }

    #[test]
    fn test_delete_classification() {
        let op = update(EntityType::Product, json!({"price": 3}));
        let mut gone = server(None, Some(5));
        gone.deleted = true;
        assert_eq!(detect_conflict(&op, &gone).conflict_type, ConflictType::UpdateDelete);

        let op = SyncOperation::new(EntityType::Product, OperationType::Delete, "e-1", json!({}));
        let conflict = detect_conflict(&op, &server(Some(json!({"price": 4})), Some(5)));
        assert_eq!(conflict.conflict_type, ConflictType::DeleteUpdate);
        assert_eq!(conflict.severity, ConflictSeverity::High);
        assert!(conflict.local.deleted);
    }

    #[test]
    fn test_create_create_and_constraint_hint() {
        let op = SyncOperation::new(EntityType::Product, OperationType::Create, "", json!({"sku": "S-1"}));
        let conflict = detect_conflict(&op, &server(Some(json!({"sku": "S-1", "name": "x"})), None));
        assert_eq!(conflict.conflict_type, ConflictType::CreateCreate);

        let op = update(EntityType::Product, json!({"name": "x"}));
        let hint = ServerConflict {
            conflict_type: Some("constraint_violation".to_string()),
            ..server(Some(json!({"name": "x"})), None)
        };
        let conflict = detect_conflict(&op, &hint);
        assert_eq!(conflict.conflict_type, ConflictType::ConstraintViolation);
        assert_eq!(conflict.severity, ConflictSeverity::Critical);
    }

    #[test]
    fn test_quantity_on_stock_movement_is_critical() {
        assert_eq!(
            field_sensitivity(EntityType::StockMovement, "quantity"),
            ConflictSeverity::Critical
        );
        assert_eq!(field_sensitivity(EntityType::Product, "stock_quantity"), ConflictSeverity::High);
        assert_eq!(field_sensitivity(EntityType::Product, "barcode"), ConflictSeverity::Medium);
        assert_eq!(field_sensitivity(EntityType::Product, "description"), ConflictSeverity::Low);
    }

    #[test]
    fn test_detect_conflicts_matches_results_to_operations() {
        let a = update(EntityType::Product, json!({"price": 1}));
        let b = update(EntityType::Product, json!({"price": 2}));
        let results = vec![
            OperationResult::success(&a.local_id, None),
            OperationResult::conflict(&b.local_id, server(Some(json!({"price": 3})), None)),
            OperationResult::conflict("unknown", ServerConflict::default()),
        ];

        let conflicts = detect_conflicts(&[a, b.clone()], &results);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].local_id, b.local_id);
        assert_eq!(conflicts[0].status, ConflictStatus::Pending);
    }

    #[test]
    fn test_server_timestamp_defaults_to_now() {
        let op = update(EntityType::Product, json!({"price": 1}))
            .with_timestamp(Utc::now() - Duration::hours(1));
        let conflict = detect_conflict(&op, &ServerConflict::default());
        assert!(conflict.server.timestamp > conflict.local.timestamp);
        assert_eq!(conflict.conflict_type, ConflictType::DataInconsistency);
    }
}
