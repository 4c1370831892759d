//! Queue command handlers

use anyhow::Result;

use shopsync_core::OperationStatus;

use crate::app::App;
use crate::output::Output;

fn parse_status(status: Option<String>) -> Result<Option<OperationStatus>> {
    Ok(status.map(|s| s.parse::<OperationStatus>()).transpose()?)
}

/// List queued operations in upload order
pub fn list(app: &App, status: Option<String>, output: &Output) -> Result<()> {
    let ops = app.queue.list(parse_status(status)?)?;
    output.print_operations(&ops);
    Ok(())
}

pub fn stats(app: &App, output: &Output) -> Result<()> {
    let stats = app.queue.stats()?;
    output.print_stats(&stats);
    Ok(())
}

/// Delete queued operations, all of them or those with `status`
pub fn clear(app: &App, status: Option<String>, output: &Output) -> Result<()> {
    let status = parse_status(status)?;
    let removed = app.queue.clear(status)?;
    match status {
        Some(status) => output.success(&format!("Removed {} {} operation(s)", removed, status)),
        None => output.success(&format!("Removed {} operation(s)", removed)),
    }
    Ok(())
}

/// Return dead-lettered operations to the queue
pub fn requeue(app: &App, output: &Output) -> Result<()> {
    let requeued = app.queue.requeue_failed()?;
    output.success(&format!("Requeued {} failed operation(s)", requeued));
    Ok(())
}
