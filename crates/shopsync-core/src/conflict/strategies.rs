//! Resolution strategies
//!
//! Each strategy turns a conflict into the resulting record plus what to do
//! with the queued operation. They never touch storage.

use std::sync::Arc;

use serde_json::{Map, Number, Value};

use super::detect::{is_meta, is_quantity_field};
use super::types::{Conflict, ResolutionOutcome};
use crate::models::OperationType;

/// Domain-specific resolution for one entity type
pub type BusinessRule = Arc<dyn Fn(&Conflict) -> Result<Value, String> + Send + Sync>;

/// Data and outcome produced by a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub outcome: ResolutionOutcome,
    pub data: Value,
}

fn with_version(mut data: Value, version: Option<i64>) -> Value {
    if let (Some(map), Some(version)) = (data.as_object_mut(), version) {
        map.insert("version".to_string(), Value::from(version));
    }
    data
}

fn keep_server(conflict: &Conflict) -> Resolved {
    Resolved {
        outcome: ResolutionOutcome::AcceptServer,
        data: if conflict.server.deleted {
            Value::Null
        } else {
            conflict.server.data.clone()
        },
    }
}

fn keep_local(conflict: &Conflict) -> Resolved {
    let (local, server) = (&conflict.local, &conflict.server);
    match (local.deleted, server.deleted) {
        (true, true) => keep_server(conflict),
        (true, false) => Resolved {
            outcome: ResolutionOutcome::Push(OperationType::Delete),
            data: with_version(local.data.clone(), server.version),
        },
        // The server dropped the record; recreate it
        (false, true) => Resolved {
            outcome: ResolutionOutcome::Push(OperationType::Create),
            data: local.data.clone(),
        },
        (false, false) => Resolved {
            outcome: ResolutionOutcome::Push(OperationType::Update),
            data: with_version(local.data.clone(), server.version),
        },
    }
}

fn local_is_newer(conflict: &Conflict) -> bool {
    conflict.local.timestamp > conflict.server.timestamp
}

pub fn last_write_wins(conflict: &Conflict) -> Resolved {
    if local_is_newer(conflict) {
        keep_local(conflict)
    } else {
        keep_server(conflict)
    }
}

pub fn client_wins(conflict: &Conflict) -> Resolved {
    keep_local(conflict)
}

pub fn server_wins(conflict: &Conflict) -> Resolved {
    keep_server(conflict)
}

/// Push `data` unless it already matches the server record
fn push_unless_server(conflict: &Conflict, data: Value) -> Resolved {
    if data == conflict.server.data {
        keep_server(conflict)
    } else {
        Resolved {
            outcome: ResolutionOutcome::Push(OperationType::Update),
            data: with_version(data, conflict.server.version),
        }
    }
}

fn merged_fields(conflict: &Conflict) -> Option<Map<String, Value>> {
    let local = conflict.local.data.as_object()?;
    let mut merged = conflict.server.data.as_object()?.clone();
    let base = conflict.base.as_ref().and_then(Value::as_object);
    let local_wins_conflicts = local_is_newer(conflict);

    for (key, value) in local {
        if is_meta(key) {
            continue;
        }
        let take_local = if conflict.conflicting_fields.contains(key) {
            local_wins_conflicts
        } else {
            match base {
                Some(base) => base.get(key) != Some(value),
                None => !merged.contains_key(key),
            }
        };
        if take_local {
            merged.insert(key.clone(), value.clone());
        }
    }
    Some(merged)
}

/// Combine both sides field by field
///
/// Changes made on one side only are kept. Fields changed on both sides go
/// to the newer side, the server on ties. Deletions fall back to
/// last-write-wins.
pub fn merge(conflict: &Conflict) -> Resolved {
    if conflict.local.deleted || conflict.server.deleted {
        return last_write_wins(conflict);
    }
    match merged_fields(conflict) {
        Some(merged) => push_unless_server(conflict, Value::Object(merged)),
        None => last_write_wins(conflict),
    }
}

fn number_of(value: Option<&Value>) -> Option<&Number> {
    match value {
        Some(Value::Number(n)) => Some(n),
        _ => None,
    }
}

fn sum_deltas(base: &Number, local: &Number, server: &Number) -> Value {
    if let (Some(b), Some(l), Some(s)) = (base.as_i64(), local.as_i64(), server.as_i64()) {
        return Value::from(b + (l - b) + (s - b));
    }
    let (b, l, s) = (
        base.as_f64().unwrap_or_default(),
        local.as_f64().unwrap_or_default(),
        server.as_f64().unwrap_or_default(),
    );
    Value::from(b + (l - b) + (s - b))
}

/// Built-in stock rule: quantity changes from both sides add up
///
/// Each side's quantity is read as a delta from the base snapshot, so a local
/// `-2` and a server `-3` yield `base - 5`. Other fields merge as usual.
pub fn sum_quantity_deltas(conflict: &Conflict) -> Result<Value, String> {
    let base = conflict
        .base
        .as_ref()
        .and_then(Value::as_object)
        .ok_or_else(|| "no base snapshot to compute quantity deltas from".to_string())?;
    let mut merged = merged_fields(conflict)
        .ok_or_else(|| "quantity rule needs object records on both sides".to_string())?;

    for (key, base_value) in base.iter().filter(|(key, _)| is_quantity_field(key)) {
        let (Some(b), Some(l), Some(s)) = (
            number_of(Some(base_value)),
            number_of(conflict.local.data.get(key)),
            number_of(conflict.server.data.get(key)),
        ) else {
            continue;
        };
        merged.insert(key.clone(), sum_deltas(b, l, s));
    }
    Ok(Value::Object(merged))
}

/// Run a business rule and shape its result
pub fn business_rules(conflict: &Conflict, rule: Option<&BusinessRule>) -> Result<Resolved, String> {
    if conflict.local.deleted || conflict.server.deleted {
        return Ok(last_write_wins(conflict));
    }
    match rule {
        Some(rule) => Ok(push_unless_server(conflict, rule(conflict)?)),
        None => Ok(last_write_wins(conflict)),
    }
}
