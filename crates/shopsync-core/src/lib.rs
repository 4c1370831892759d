//! ShopSync Core Library
//!
//! This crate provides the offline-first sync core for a shop / point-of-sale
//! client: local mutations are queued durably while offline and synchronized
//! with a central server when connectivity allows.
//!
//! # Architecture
//!
//! - **SQLite**: one database file holds the sync queue, conflict history and
//!   the bundled local entity store
//! - **Tokio**: the connectivity monitor and background sync task run as tasks
//!   and publish [`SyncEvent`]s on a broadcast bus
//!
//! # Quick Start
//!
//! ```text
//! let db = Database::open(config.database_path())?;
//! let queue = SyncQueue::open(db.clone(), config.sync.max_operation_retries)?;
//!
//! // Record a sale while offline
//! queue.enqueue(SyncOperation::new(EntityType::Sale, OperationType::Create, "", data))?;
//!
//! // Sync when back online
//! let report = orchestrator.sync_now(SyncTrigger::Manual).await;
//! ```
//!
//! # Modules
//!
//! - `queue`: durable operation queue with coalescing
//! - `sync`: orchestrator, transport and background task
//! - `conflict`: conflict detection and resolution
//! - `retry`: retry policies and coordinator
//! - `connectivity`: network monitoring with reconnection debounce
//! - `compression`: gzip payload compression
//! - `storage`: SQLite persistence
//! - `config`: Application configuration

pub mod compression;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod store;
pub mod sync;

pub use compression::{CompressionOptions, PayloadCompressor};
pub use config::Config;
pub use conflict::{Conflict, ConflictResolver, ConflictStore, ResolutionStrategy, ResolverConfig};
pub use connectivity::{ConnectivityMonitor, HttpProbe, NetworkProbe, NetworkState};
pub use error::{RetryReason, SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use models::{EntityType, OperationStatus, OperationType, SyncOperation};
pub use queue::{EnqueueOutcome, QueueStats, SyncQueue};
pub use retry::{RetryConfig, RetryCoordinator, RetryProfile};
pub use storage::{Database, SqliteLocalStore, StorageError};
pub use store::{LocalStore, SyncCheckpoint};
pub use sync::{
    spawn_sync_task, CycleOutcome, CycleReport, HttpTransport, SyncOptions, SyncOrchestrator,
    SyncServices, SyncState, SyncTaskHandle, SyncTrigger,
};
