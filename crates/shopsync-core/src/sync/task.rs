//! Background sync task
//!
//! Turns triggers into sync cycles: a periodic timer while online, debounced
//! reconnection notices from the connectivity monitor, and commands from the
//! host (manual sync, app foreground). Cycles run on their own tasks so the
//! loop keeps accepting triggers; overlapping ones are coalesced by the
//! orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::orchestrator::SyncOrchestrator;
use super::state::{CycleOutcome, SyncState, SyncTrigger};
use crate::connectivity::{ConnectivityMonitor, ConnectivityNotice};

/// Commands sent to the sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// User asked for a sync
    SyncNow,
    /// The app came to the foreground
    Foreground,
    /// Stop the task after running cycles finish
    Shutdown,
}

/// Handle to control the background sync task
pub struct SyncTaskHandle {
    /// Send commands to the sync task
    pub command_tx: mpsc::Sender<SyncCommand>,
    /// Watch the orchestrator state
    pub status_rx: watch::Receiver<SyncState>,
    join: JoinHandle<()>,
}

impl SyncTaskHandle {
    pub async fn sync_now(&self) -> bool {
        self.command_tx.send(SyncCommand::SyncNow).await.is_ok()
    }

    pub async fn foreground(&self) -> bool {
        self.command_tx.send(SyncCommand::Foreground).await.is_ok()
    }

    pub fn status(&self) -> SyncState {
        *self.status_rx.borrow()
    }

    /// Ask the task to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        if let Err(e) = self.join.await {
            warn!("Sync task ended abnormally: {}", e);
        }
    }
}

/// Spawn the background sync task
///
/// Periodic cycles are skipped while `monitor` reports offline. Without a
/// monitor the device is assumed online.
pub fn spawn_sync_task(
    orchestrator: Arc<SyncOrchestrator>,
    monitor: Option<Arc<ConnectivityMonitor>>,
    interval: Duration,
) -> SyncTaskHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let status_rx = orchestrator.subscribe_state();

    let join = tokio::spawn(sync_task_loop(orchestrator, monitor, interval, command_rx));

    SyncTaskHandle {
        command_tx,
        status_rx,
        join,
    }
}

async fn sync_task_loop(
    orchestrator: Arc<SyncOrchestrator>,
    monitor: Option<Arc<ConnectivityMonitor>>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<SyncCommand>,
) {
    // A full slot means a reconnection cycle is already pending
    let (reconnect_tx, mut reconnect_rx) = mpsc::channel::<()>(1);
    let _subscription = monitor.as_ref().map(|monitor| {
        monitor.add_listener(move |notice| {
            if matches!(notice, ConnectivityNotice::Reconnected(_)) {
                let _ = reconnect_tx.try_send(());
            }
        })
    });

    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: JoinSet<CycleOutcome> = JoinSet::new();

    info!("Sync task started, periodic sync every {:?}", interval);
    loop {
        let trigger = tokio::select! {
            cmd = command_rx.recv() => match cmd {
                Some(SyncCommand::SyncNow) => SyncTrigger::Manual,
                Some(SyncCommand::Foreground) => SyncTrigger::Foreground,
                Some(SyncCommand::Shutdown) | None => break,
            },
            Some(()) = reconnect_rx.recv() => SyncTrigger::Reconnection,
            _ = ticker.tick() => {
                if monitor.as_ref().is_some_and(|m| !m.is_online()) {
                    debug!("Skipping periodic sync while offline");
                    continue;
                }
                SyncTrigger::Periodic
            }
            Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(e) = finished {
                    warn!("Sync cycle task failed: {}", e);
                }
                continue;
            }
        };

        let orchestrator = orchestrator.clone();
        cycles.spawn(async move { orchestrator.sync_now(trigger).await });
    }

    debug!("Sync task stopping, waiting for {} cycles", cycles.len());
    while cycles.join_next().await.is_some() {}
    info!("Sync task stopped");
}
