//! Sync cycle state and reports

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the orchestrator is in its cycle
///
/// ```text
/// Idle -> Syncing -> Success | PartialFailure | Failed -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Success,
    /// The cycle finished but some operations were rejected
    PartialFailure,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Success => "success",
            SyncState::PartialFailure => "partial_failure",
            SyncState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncState::Success | SyncState::PartialFailure | SyncState::Failed
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What asked for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Reconnection,
    Periodic,
    Foreground,
    Manual,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncTrigger::Reconnection => "reconnection",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Manual => "manual",
        })
    }
}

/// Step of a cycle reported in progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Upload,
    Conflicts,
    Download,
}

/// Summary of one finished cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub session_id: String,
    pub trigger: SyncTrigger,
    pub state: SyncState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Operations the server accepted
    pub uploaded: usize,
    /// Operations the server rejected
    pub failed: usize,
    /// Rejected operations returned to PENDING for a later cycle
    pub retried: usize,
    pub conflicts: usize,
    pub conflicts_resolved: usize,
    /// Conflicts from this cycle whose operation still waits on them
    pub conflicts_pending: usize,
    /// Server records applied locally
    pub downloaded: usize,
    pub pages: usize,
    pub last_error: Option<String>,
    pub cancelled: bool,
}

impl CycleReport {
    pub(crate) fn new(session_id: &str, trigger: SyncTrigger) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            trigger,
            state: SyncState::Syncing,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            uploaded: 0,
            failed: 0,
            retried: 0,
            conflicts: 0,
            conflicts_resolved: 0,
            conflicts_pending: 0,
            downloaded: 0,
            pages: 0,
            last_error: None,
            cancelled: false,
        }
    }
}

/// Result of asking for a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// A cycle was already running; the request was folded into it
    Coalesced,
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Completed(report) => Some(report),
            CycleOutcome::Coalesced => None,
        }
    }
}
