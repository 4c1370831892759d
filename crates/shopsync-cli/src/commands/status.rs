//! Status command handler

use anyhow::Result;

use shopsync_core::{LocalStore, OperationStatus, RetryCoordinator};

use crate::app::App;
use crate::output::{Output, OutputFormat};

/// Show queue, conflict and sync status
pub async fn show(app: &App, output: &Output) -> Result<()> {
    let config = &app.config;
    let stats = app.queue.stats()?;
    let conflicts = app.resolver.metrics()?;
    let entities = app.store.entity_counts()?;
    let checkpoint = app.store.get_checkpoint().await?;
    let retry = RetryCoordinator::with_history(app.events.clone(), config.retry_history_path())
        .metrics();

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "sync_enabled": config.sync_enabled,
            "server_url": config.server_url,
            "checkpoint": checkpoint,
            "queue": stats,
            "conflicts": conflicts,
            "entities": entities,
            "retry": retry,
        })),
        OutputFormat::Quiet => {
            println!("{}", stats.count(OperationStatus::Pending));
        }
        OutputFormat::Human => {
            println!("ShopSync Status");
            println!("===============");
            println!();
            println!("Sync:");
            println!(
                "  Status: {}",
                if config.sync_enabled { "enabled" } else { "disabled" }
            );
            if let Some(ref url) = config.server_url {
                println!("  Server: {}", url);
            }
            match checkpoint {
                Some(ref checkpoint) => println!(
                    "  Watermark: {} (saved {})",
                    checkpoint.last_sync_timestamp,
                    checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("  Watermark: (never synced)"),
            }
            println!();
            println!("Queue:");
            println!("  Pending:    {}", stats.count(OperationStatus::Pending));
            println!("  In flight:  {}", stats.count(OperationStatus::InFlight));
            println!("  Conflicted: {}", stats.count(OperationStatus::Conflicted));
            println!("  Failed:     {}", stats.count(OperationStatus::Failed));
            if let Some(at) = stats.last_synced_at {
                println!("  Last sync:  {}", at.format("%Y-%m-%d %H:%M:%S"));
            }
            println!();
            println!("Conflicts:");
            println!("  Pending:   {}", conflicts.pending);
            println!("  Resolved:  {}", conflicts.resolved);
            println!("  Escalated: {}", conflicts.escalated);
            println!();
            println!("Retries:");
            println!("  Calls:        {}", retry.total_executions);
            println!("  Success rate: {:.0}%", retry.success_rate() * 100.0);
            println!();
            println!("Local records:");
            if entities.is_empty() {
                println!("  (none)");
            }
            for (entity_type, count) in &entities {
                println!("  {}: {}", entity_type, count);
            }
            println!();
            println!("Storage: {}", config.database_path().display());
        }
    }

    Ok(())
}
