//! Sync command handler

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use shopsync_core::{
    spawn_sync_task, ConnectivityMonitor, CycleOutcome, HttpProbe, SyncEvent, SyncState,
    SyncTrigger,
};

use crate::app::App;
use crate::output::Output;

/// Run one sync cycle now
pub async fn sync(app: &App, output: &Output) -> Result<()> {
    let orchestrator = app.orchestrator()?;
    output.message("Syncing...");

    match orchestrator.sync_now(SyncTrigger::Manual).await {
        CycleOutcome::Completed(report) => {
            output.print_report(&report);
            if report.state == SyncState::Failed {
                bail!(
                    "Sync failed: {}",
                    report.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        CycleOutcome::Coalesced => output.message("A sync is already running."),
    }
    Ok(())
}

/// Keep syncing in the background until interrupted
///
/// Cycles run on the periodic interval while the server is reachable and once
/// after each reconnection.
pub async fn watch(app: &App, output: &Output) -> Result<()> {
    let config = &app.config;
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             shopsync config set sync_enabled true"
        );
    }
    let orchestrator = app.orchestrator()?;
    let Some(ref server_url) = config.server_url else {
        bail!("Sync server not configured");
    };

    let probe = HttpProbe::new(
        server_url,
        config.connectivity.probe_timeout(),
        config.connectivity.probe_interval(),
    )?;
    let monitor = ConnectivityMonitor::new(
        Arc::new(probe),
        app.events.clone(),
        config.connectivity.debounce(),
    );
    let initial = monitor.initialize().await;
    output.message(&format!(
        "Watching {} ({}), syncing every {:?}. Press Ctrl-C to stop.",
        server_url,
        if initial.is_online() { "online" } else { "offline" },
        config.sync.sync_interval()
    ));

    let mut events = app.events.subscribe();
    let orchestrator = Arc::new(orchestrator.with_network(monitor.watch()));
    let handle = spawn_sync_task(
        orchestrator,
        Some(monitor.clone()),
        config.sync.sync_interval(),
    );
    if initial.is_online() {
        handle.sync_now().await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::CycleFinished(report)) => output.print_report(&report),
                Ok(SyncEvent::ConnectivityChanged(state)) => output.message(
                    if state.is_online() { "Network: online" } else { "Network: offline" },
                ),
                Ok(SyncEvent::ManualResolutionRequired { conflict_id }) => output.message(
                    &format!("Conflict {} needs review: shopsync conflicts show {}", conflict_id, conflict_id),
                ),
                Ok(event) => debug!("{:?}", event),
                Err(RecvError::Lagged(n)) => warn!("Missed {} sync events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    output.message("Stopping...");
    handle.shutdown().await;
    monitor.shutdown();
    Ok(())
}
