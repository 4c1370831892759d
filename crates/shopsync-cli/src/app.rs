//! Wiring of the sync core from configuration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use shopsync_core::{
    Config, ConflictResolver, ConflictStore, Database, EventBus, HttpTransport, LocalStore,
    PayloadCompressor, RetryCoordinator, SqliteLocalStore, SyncOptions, SyncOrchestrator,
    SyncQueue, SyncServices,
};

/// Per-request HTTP timeout for the sync endpoints
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Local services opened from the data directory
pub struct App {
    pub config: Config,
    pub queue: SyncQueue,
    pub store: Arc<SqliteLocalStore>,
    pub resolver: Arc<ConflictResolver>,
    pub events: EventBus,
}

impl App {
    pub fn open(config: Config) -> Result<Self> {
        let path = config.database_path();
        let db = Database::open(&path)
            .with_context(|| format!("Failed to open sync database {:?}", path))?;
        let queue = SyncQueue::open(db.clone(), config.sync.max_operation_retries)
            .context("Failed to open sync queue")?;
        let events = EventBus::default();
        let resolver = ConflictResolver::new(
            config.conflicts.clone(),
            ConflictStore::new(db.clone()),
            events.clone(),
        );

        Ok(Self {
            queue,
            store: Arc::new(SqliteLocalStore::new(db)),
            resolver: Arc::new(resolver),
            events,
            config,
        })
    }

    /// Build the orchestrator; needs a configured server
    pub fn orchestrator(&self) -> Result<SyncOrchestrator> {
        let Some(ref server_url) = self.config.server_url else {
            bail!(
                "Sync server not configured. Set it with:\n  \
                 shopsync config set server_url https://your-server"
            );
        };

        let transport = HttpTransport::new(
            server_url,
            self.config.auth_token.clone(),
            REQUEST_TIMEOUT,
        )?;
        let device_id = self.config.resolve_device_id()?;
        let store: Arc<dyn LocalStore> = self.store.clone();

        let services = SyncServices {
            queue: self.queue.clone(),
            store,
            transport: Arc::new(transport),
            resolver: self.resolver.clone(),
            retry: Arc::new(RetryCoordinator::with_history(
                self.events.clone(),
                self.config.retry_history_path(),
            )),
            compressor: Arc::new(PayloadCompressor::new(self.config.compression.clone())),
            events: self.events.clone(),
        };
        Ok(SyncOrchestrator::new(
            services,
            SyncOptions::from_config(&self.config, device_id),
        ))
    }
}
