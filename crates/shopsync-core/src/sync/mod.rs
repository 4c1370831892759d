//! Sync engine
//!
//! Pushes the local operation queue to the sync server and pulls server
//! changes back into the app database.
//!
//! ## Protocol
//!
//! Each cycle runs three phases over REST:
//! 1. Upload PENDING operations with `POST /api/sync/batch`
//! 2. Resolve conflicts the server reported in batch results
//! 3. Download changes since the stored watermark with `GET /api/sync/delta`
//!
//! ## Usage
//!
//! ```ignore
//! let orchestrator = Arc::new(SyncOrchestrator::new(services, options).with_network(monitor.watch()));
//! let handle = spawn_sync_task(orchestrator, Some(monitor), Duration::from_secs(300));
//! handle.sync_now().await;
//! ```

pub mod message;
mod orchestrator;
mod state;
mod task;
#[cfg(test)]
mod testing;
mod transport;

pub use orchestrator::{apply_resolution, SyncOptions, SyncOrchestrator, SyncServices};
pub use state::{CycleOutcome, CycleReport, SyncPhase, SyncState, SyncTrigger};
pub use task::{spawn_sync_task, SyncCommand, SyncTaskHandle};
pub use transport::{HttpTransport, RequestBody, SyncTransport};
