//! Record command handler
//!
//! Writes a local change the way the point-of-sale app would: the local
//! store is updated and the mutation is queued for upload.

use anyhow::{Context, Result};
use serde_json::Value;

use shopsync_core::queue::EnqueueOutcome;
use shopsync_core::{EntityType, OperationType};

use crate::app::App;
use crate::output::{Output, OutputFormat};

pub fn record(
    app: &App,
    entity: String,
    operation: String,
    id: Option<String>,
    data: Option<String>,
    output: &Output,
) -> Result<()> {
    let entity_type: EntityType = entity.parse()?;
    let operation_type: OperationType = operation.parse()?;
    let data = parse_data(data.as_deref())?;
    let entity_id = id.unwrap_or_default();

    if entity_id.is_empty() && operation_type != OperationType::Create {
        anyhow::bail!("--id is required for {} operations", operation_type);
    }

    let outcome = app.store.record_local_mutation(
        &app.queue,
        entity_type,
        operation_type,
        &entity_id,
        data,
    )?;

    match (&outcome, output.format) {
        (_, OutputFormat::Json) => output.json(&serde_json::json!({
            "outcome": match &outcome {
                EnqueueOutcome::Queued(_) => "queued",
                EnqueueOutcome::Coalesced(_) => "coalesced",
                EnqueueOutcome::Cancelled { .. } => "cancelled",
            },
            "operation": outcome.operation(),
        })),
        (EnqueueOutcome::Queued(op), _) => {
            output.success(&format!("Queued {} {} {}", op.operation_type, op.entity_type, op.entity_id));
            if output.is_quiet() {
                println!("{}", op.local_id);
            }
        }
        (EnqueueOutcome::Coalesced(op), _) => {
            output.success(&format!(
                "Merged into pending {} of {} {}",
                op.operation_type, op.entity_type, op.entity_id
            ));
            if output.is_quiet() {
                println!("{}", op.local_id);
            }
        }
        (EnqueueOutcome::Cancelled { local_id }, _) => {
            output.success(&format!("Dropped unsynced create {}", local_id));
        }
    }
    Ok(())
}

fn parse_data(data: Option<&str>) -> Result<Value> {
    match data {
        Some(text) => serde_json::from_str(text).context("--data must be a JSON object"),
        None => Ok(Value::Object(Default::default())),
    }
    .and_then(|value: Value| {
        if value.is_object() {
            Ok(value)
        } else {
            anyhow::bail!("--data must be a JSON object")
        }
    })
}
