//! Conflict review command handlers

use anyhow::{bail, Context, Result};
use serde_json::Value;

use shopsync_core::conflict::ResolutionResult;
use shopsync_core::sync::apply_resolution;
use shopsync_core::ResolutionStrategy;

use crate::app::App;
use crate::output::Output;

/// List conflicts, pending ones unless `all`
pub fn list(app: &App, all: bool, output: &Output) -> Result<()> {
    let conflicts = if all {
        app.resolver.list(None)?
    } else {
        app.resolver.pending()?
    };
    output.print_conflicts(&conflicts);
    Ok(())
}

pub fn show(app: &App, id: String, output: &Output) -> Result<()> {
    let conflict_id = find_id(app, &id)?;
    let Some(conflict) = app.resolver.get(&conflict_id)? else {
        bail!("No conflict with id {}", id);
    };
    output.print_conflict(&conflict);
    Ok(())
}

/// Close a conflict with a strategy or with hand-written data
///
/// The resolution is applied to the queue and the local store; re-queued
/// operations go out with the next sync.
pub async fn resolve(
    app: &App,
    id: String,
    strategy: Option<String>,
    data: Option<String>,
    output: &Output,
) -> Result<()> {
    let conflict_id = find_id(app, &id)?;

    let (conflict, resolution) = match (strategy, data) {
        (Some(_), Some(_)) => bail!("Use either --strategy or --data, not both"),
        (None, None) => bail!("Give a --strategy or the resolved record as --data"),
        (None, Some(data)) => {
            let data: Value = serde_json::from_str(&data).context("--data must be valid JSON")?;
            app.resolver.resolve_manually(&conflict_id, data)?
        }
        (Some(strategy), None) => {
            let strategy: ResolutionStrategy = strategy.parse()?;
            let Some(conflict) = app.resolver.get(&conflict_id)? else {
                bail!("No conflict with id {}", id);
            };
            match app.resolver.resolve_conflict(&conflict, Some(strategy))? {
                ResolutionResult::Resolved(resolution) => (conflict, resolution),
                ResolutionResult::Manual => {
                    bail!("Manual resolution needs the resolved record as --data")
                }
                ResolutionResult::Failed { error, .. } => {
                    bail!("Resolving with {} failed: {}", strategy, error)
                }
            }
        }
    };

    apply_resolution(&app.queue, app.store.as_ref(), &conflict, &resolution).await?;
    if output.is_json() {
        output.json(&resolution);
    } else {
        output.success(&format!(
            "Resolved conflict {} with {}",
            conflict.conflict_id, resolution.strategy
        ));
    }
    Ok(())
}

/// Expand an id prefix to a unique conflict id
fn find_id(app: &App, prefix: &str) -> Result<String> {
    let matches: Vec<String> = app
        .resolver
        .list(None)?
        .into_iter()
        .map(|c| c.conflict_id)
        .filter(|id| id.starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => bail!("No conflict with id {}", prefix),
        _ => bail!("Conflict id prefix {} is ambiguous", prefix),
    }
}
