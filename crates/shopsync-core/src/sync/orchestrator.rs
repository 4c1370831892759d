//! Sync orchestrator
//!
//! Runs one sync cycle at a time:
//! 1. retry conflict resolutions that failed in an earlier cycle
//! 2. upload PENDING operations in batches and route each per-operation result
//! 3. download server changes page by page, storing the watermark after each page
//!
//! A request arriving while a cycle runs is coalesced into it. Losing
//! connectivity or reaching the cycle timeout cancels the running cycle, and
//! operations it had taken off the queue go back to PENDING.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{
    new_session_id, BatchRequest, BatchResponse, DeletedEntity, DeltaRequest, ModifiedEntity,
    OperationResult, ResultStatus,
};
use super::state::{CycleOutcome, CycleReport, SyncPhase, SyncState, SyncTrigger};
use super::transport::{RequestBody, SyncTransport};
use crate::compression::PayloadCompressor;
use crate::config::Config;
use crate::conflict::{
    Conflict, ConflictResolver, Resolution, ResolutionOutcome, ResolutionResult,
    ResolutionStrategy,
};
use crate::connectivity::NetworkState;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::models::{EntityType, OperationStatus, OperationType, SyncOperation};
use crate::queue::SyncQueue;
use crate::retry::{RetryConfig, RetryCoordinator};
use crate::store::{LocalStore, SyncCheckpoint};

/// Cycle tuning
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub device_id: String,
    pub user_id: Option<String>,
    /// Operations per upload batch
    pub batch_size: usize,
    /// Records requested per delta page
    pub delta_page_limit: usize,
    pub entity_types: Vec<EntityType>,
    pub cycle_timeout: Duration,
    /// Policy for each batch upload and delta page call
    pub retry: RetryConfig,
}

impl SyncOptions {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: None,
            batch_size: 50,
            delta_page_limit: 500,
            entity_types: EntityType::ALL.to_vec(),
            cycle_timeout: Duration::from_secs(120),
            retry: RetryConfig::sync(),
        }
    }

    pub fn from_config(config: &Config, device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: config.user_id.clone(),
            batch_size: config.sync.batch_size.max(1),
            delta_page_limit: config.sync.delta_page_limit as usize,
            entity_types: config.sync.entity_types.clone(),
            cycle_timeout: config.sync.cycle_timeout(),
            retry: config.sync.retry_profile.config(),
        }
    }
}

/// Collaborators the orchestrator drives
#[derive(Clone)]
pub struct SyncServices {
    pub queue: SyncQueue,
    pub store: Arc<dyn LocalStore>,
    pub transport: Arc<dyn SyncTransport>,
    pub resolver: Arc<ConflictResolver>,
    pub retry: Arc<RetryCoordinator>,
    pub compressor: Arc<PayloadCompressor>,
    pub events: EventBus,
}

/// Why a cycle was cut short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    TimedOut,
    Offline,
}

/// Work done by the running cycle
struct Cycle {
    report: CycleReport,
    /// Entries sent during this cycle; they are not sent twice
    attempted: HashSet<String>,
}

/// Clears the single-flight flag on every exit path
struct FlightGuard<'a> {
    running: &'a AtomicBool,
    state: &'a watch::Sender<SyncState>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(SyncState::Idle);
        self.running.store(false, Ordering::Release);
    }
}

/// Coordinates queue, transport, resolver and local store into sync cycles
pub struct SyncOrchestrator {
    services: SyncServices,
    options: SyncOptions,
    network: Option<watch::Receiver<NetworkState>>,
    running: AtomicBool,
    state_tx: watch::Sender<SyncState>,
    last_report: Mutex<Option<CycleReport>>,
}

impl SyncOrchestrator {
    pub fn new(services: SyncServices, options: SyncOptions) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        Self {
            services,
            options,
            network: None,
            running: AtomicBool::new(false),
            state_tx,
            last_report: Mutex::new(None),
        }
    }

    /// Follow a connectivity monitor's state
    ///
    /// Cycles are skipped while offline and cancelled when the network drops.
    pub fn with_network(mut self, network: watch::Receiver<NetworkState>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn services(&self) -> &SyncServices {
        &self.services
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Report of the most recent finished cycle
    pub fn last_report(&self) -> Option<CycleReport> {
        match self.last_report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn is_online(&self) -> bool {
        self.network
            .as_ref()
            .map_or(true, |network| network.borrow().is_online())
    }

    /// Run a cycle now, or fold the request into the running one
    pub async fn sync_now(&self, trigger: SyncTrigger) -> CycleOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already running, coalescing {} request", trigger);
            return CycleOutcome::Coalesced;
        }
        let _flight = FlightGuard {
            running: &self.running,
            state: &self.state_tx,
        };

        CycleOutcome::Completed(self.run(trigger).await)
    }

    async fn run(&self, trigger: SyncTrigger) -> CycleReport {
        let session_id = new_session_id();
        let mut cycle = Cycle {
            report: CycleReport::new(&session_id, trigger),
            attempted: HashSet::new(),
        };

        if !self.is_online() {
            info!("Skipping {} sync while offline", trigger);
            cycle.report.state = SyncState::Failed;
            cycle.report.last_error = Some(SyncError::Network("offline".into()).to_string());
            return self.finish(cycle.report);
        }

        self.state_tx.send_replace(SyncState::Syncing);
        info!("Sync {} started ({})", session_id, trigger);
        self.services.events.emit(SyncEvent::CycleStarted {
            session_id: session_id.clone(),
            trigger,
        });

        let cancel = CancellationToken::new();
        let (result, interruption) = {
            let work = self.run_cycle(&cancel, &mut cycle);
            tokio::pin!(work);
            tokio::select! {
                result = &mut work => (result, None),
                interruption = self.watchdog() => {
                    debug!("Cancelling sync {}: {:?}", session_id, interruption);
                    cancel.cancel();
                    (work.await, Some(interruption))
                }
            }
        };

        match self.services.queue.revert(&cycle.attempted.iter().cloned().collect::<Vec<_>>()) {
            Ok(0) => {}
            Ok(n) => info!("Returned {} in-flight operations to the queue", n),
            Err(e) => warn!("Could not return in-flight operations to the queue: {}", e),
        }

        let error = match (result, interruption) {
            (Ok(()), _) => None,
            (Err(_), Some(Interruption::TimedOut)) => {
                Some(SyncError::Timeout(self.options.cycle_timeout))
            }
            (Err(_), Some(Interruption::Offline)) => {
                Some(SyncError::Network("connection lost during sync".into()))
            }
            (Err(e), None) => Some(e),
        };

        let report = &mut cycle.report;
        report.conflicts_pending = match self.services.queue.list(Some(OperationStatus::Conflicted)) {
            Ok(waiting) => waiting.len(),
            Err(e) => {
                warn!("Could not count operations waiting on conflicts: {}", e);
                0
            }
        };
        report.cancelled = error.is_some() && interruption.is_some();
        report.state = match &error {
            Some(_) => SyncState::Failed,
            None if report.failed > 0 || report.conflicts_pending > 0 => SyncState::PartialFailure,
            None => SyncState::Success,
        };
        report.last_error = error.map(|e| e.to_string());
        self.finish(cycle.report)
    }

    fn finish(&self, mut report: CycleReport) -> CycleReport {
        report.finished_at = Utc::now();
        report.duration_ms = (report.finished_at - report.started_at)
            .num_milliseconds()
            .max(0) as u64;

        match report.state {
            SyncState::Failed => warn!(
                "Sync {} failed after {}ms: {}",
                report.session_id,
                report.duration_ms,
                report.last_error.as_deref().unwrap_or("unknown error")
            ),
            state => info!(
                "Sync {} finished {} in {}ms: {} uploaded, {} failed, {} conflicts, {} downloaded",
                report.session_id,
                state,
                report.duration_ms,
                report.uploaded,
                report.failed,
                report.conflicts,
                report.downloaded
            ),
        }

        self.state_tx.send_replace(report.state);
        match self.last_report.lock() {
            Ok(mut last) => *last = Some(report.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(report.clone()),
        }
        self.services.events.emit(SyncEvent::CycleFinished(report.clone()));
        report
    }

    /// Resolves when the running cycle must stop
    async fn watchdog(&self) -> Interruption {
        let timeout = tokio::time::sleep(self.options.cycle_timeout);
        tokio::pin!(timeout);
        if let Some(network) = self.network.clone() {
            tokio::select! {
                _ = &mut timeout => return Interruption::TimedOut,
                offline = wait_offline(network) => if offline {
                    return Interruption::Offline;
                },
            }
        }
        timeout.await;
        Interruption::TimedOut
    }

    async fn run_cycle(&self, cancel: &CancellationToken, cycle: &mut Cycle) -> SyncResult<()> {
        self.reconcile_conflicts(cycle).await?;
        self.upload(cancel, cycle).await?;
        self.download(cancel, cycle).await
    }

    /// Retry failed resolutions, then apply every resolved conflict whose
    /// operation still waits on it
    async fn reconcile_conflicts(&self, cycle: &mut Cycle) -> SyncResult<()> {
        let resolver = &self.services.resolver;
        resolver.retry_failed()?;

        for op in self.services.queue.list(Some(OperationStatus::Conflicted))? {
            let Some(conflict_id) = op.conflict_id.as_deref() else {
                continue;
            };
            let Some(conflict) = resolver.get(conflict_id)? else {
                warn!("Operation {} waits on unknown conflict {}", op.local_id, conflict_id);
                continue;
            };
            let Some(resolution) = conflict.resolution.clone().filter(|_| conflict.is_resolved()) else {
                continue;
            };
            if self.apply_logged(&conflict, &resolution).await {
                cycle.report.conflicts_resolved += 1;
            }
        }
        Ok(())
    }

    /// Apply a resolution; a failure leaves the operation CONFLICTED for the
    /// next cycle
    async fn apply_logged(&self, conflict: &Conflict, resolution: &Resolution) -> bool {
        match self.apply(conflict, resolution).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Could not apply resolution of conflict {} to operation {}: {}",
                    conflict.conflict_id, conflict.local_id, e
                );
                false
            }
        }
    }

    async fn upload(&self, cancel: &CancellationToken, cycle: &mut Cycle) -> SyncResult<()> {
        let queue = &self.services.queue;
        let total = queue.pending_count()?;
        let mut processed = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let batch = queue.dequeue_batch_skipping(self.options.batch_size, &cycle.attempted)?;
            if batch.is_empty() {
                break;
            }
            cycle
                .attempted
                .extend(batch.iter().map(|op| op.local_id.clone()));

            let response = match self.upload_batch(&cycle.report.session_id, &batch, cancel).await {
                Ok(response) => response,
                Err(e) => {
                    let ids: Vec<String> = batch.iter().map(|op| op.local_id.clone()).collect();
                    let reverted = queue.revert(&ids)?;
                    warn!(
                        "Batch upload failed, returned {} operations to the queue: {}",
                        reverted, e
                    );
                    return Err(e);
                }
            };
            debug!(
                "Batch of {}: {} ok, {} failed, {} conflicts",
                batch.len(),
                response.success_count,
                response.failed_count,
                response.conflict_count
            );
            self.handle_results(&batch, &response, cycle).await?;

            processed += batch.len();
            self.services.events.emit(SyncEvent::CycleProgress {
                session_id: cycle.report.session_id.clone(),
                phase: SyncPhase::Upload,
                processed,
                total: total.max(processed),
            });
        }
        Ok(())
    }

    fn encode(&self, request: &BatchRequest) -> SyncResult<RequestBody> {
        let json = serde_json::to_vec(request)?;
        match self.services.compressor.compress_bytes(&json) {
            Ok(Some(payload)) => Ok(RequestBody::Gzip(payload.bytes)),
            Ok(None) => Ok(RequestBody::Json(json)),
            Err(e) => {
                warn!("Compression failed, sending batch uncompressed: {}", e);
                Ok(RequestBody::Json(json))
            }
        }
    }

    async fn upload_batch(
        &self,
        session_id: &str,
        batch: &[SyncOperation],
        cancel: &CancellationToken,
    ) -> SyncResult<BatchResponse> {
        let request = BatchRequest::new(
            &self.options.device_id,
            self.options.user_id.as_deref(),
            session_id,
            batch.to_vec(),
        );
        let body = self.encode(&request)?;

        let transport: &dyn SyncTransport = self.services.transport.as_ref();
        let body = &body;
        self.services
            .retry
            .execute_with_retry("batch upload", &self.options.retry, cancel, move || {
                transport.upload_batch(body)
            })
            .await
            .into_result()
    }

    async fn handle_results(
        &self,
        batch: &[SyncOperation],
        response: &BatchResponse,
        cycle: &mut Cycle,
    ) -> SyncResult<()> {
        let queue = &self.services.queue;
        let mut results: HashMap<&str, &OperationResult> = response
            .results
            .iter()
            .map(|result| (result.local_id.as_str(), result))
            .collect();
        let mut conflicted: Vec<SyncOperation> = Vec::new();
        let mut conflict_results: Vec<OperationResult> = Vec::new();
        let mut missing: Vec<String> = Vec::new();

        for op in batch {
            let Some(result) = results.remove(op.local_id.as_str()) else {
                missing.push(op.local_id.clone());
                continue;
            };
            match result.status {
                ResultStatus::Success => {
                    queue.mark_synced(&op.local_id)?;
                    cycle.report.uploaded += 1;
                    if let Some(server_id) = result.server_id.as_deref().filter(|id| !id.is_empty()) {
                        self.services.store.acknowledge(op, server_id).await?;
                        if server_id != op.coalesce_key() {
                            queue.assign_server_id(op.entity_type, op.coalesce_key(), server_id)?;
                        }
                    }
                }
                ResultStatus::Failed => {
                    let (permanent, message) = match &result.error {
                        Some(error) => (error.is_permanent(), error.to_sync_error().to_string()),
                        None => (false, "rejected without details".to_string()),
                    };
                    let status = queue.mark_failed(&op.local_id, permanent, &message)?;
                    cycle.report.failed += 1;
                    if status == Some(OperationStatus::Pending) {
                        cycle.report.retried += 1;
                    }
                }
                ResultStatus::Conflict => {
                    conflicted.push(op.clone());
                    conflict_results.push(result.clone());
                }
            }
        }

        if !missing.is_empty() {
            warn!("Server returned no result for {} operations", missing.len());
            queue.revert(&missing)?;
        }
        if !conflicted.is_empty() {
            self.handle_conflicts(&conflicted, &conflict_results, cycle)
                .await?;
        }
        Ok(())
    }

    async fn handle_conflicts(
        &self,
        ops: &[SyncOperation],
        results: &[OperationResult],
        cycle: &mut Cycle,
    ) -> SyncResult<()> {
        let resolver = &self.services.resolver;
        let conflicts = resolver.detect_conflicts(ops, results)?;
        for conflict in &conflicts {
            self.services
                .queue
                .mark_conflicted(&conflict.local_id, &conflict.conflict_id)?;
        }
        cycle.report.conflicts += conflicts.len();
        self.services.events.emit(SyncEvent::CycleProgress {
            session_id: cycle.report.session_id.clone(),
            phase: SyncPhase::Conflicts,
            processed: 0,
            total: conflicts.len(),
        });

        let outcomes = resolver.resolve_conflicts(&conflicts);
        for (conflict, (_, outcome)) in conflicts.iter().zip(outcomes) {
            match outcome {
                Ok(ResolutionResult::Resolved(resolution)) => {
                    if self.apply_logged(conflict, &resolution).await {
                        cycle.report.conflicts_resolved += 1;
                    }
                }
                Ok(ResolutionResult::Manual) => {
                    debug!("Operation {} waits for manual resolution", conflict.local_id);
                }
                // Retried at the start of the next cycle
                Ok(ResolutionResult::Failed { .. }) | Err(_) => {}
            }
        }
        Ok(())
    }

    async fn download(&self, cancel: &CancellationToken, cycle: &mut Cycle) -> SyncResult<()> {
        let store = self.services.store.as_ref();
        let transport: &dyn SyncTransport = self.services.transport.as_ref();
        let mut since = store
            .get_checkpoint()
            .await?
            .map(|checkpoint| checkpoint.last_sync_timestamp)
            .filter(|ts| !ts.is_empty())
            .unwrap_or_else(|| DeltaRequest::EPOCH.to_string());

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let request = DeltaRequest {
                last_sync_timestamp: since.clone(),
                device_id: self.options.device_id.clone(),
                entity_types: Some(self.options.entity_types.clone()),
                limit: Some(self.options.delta_page_limit),
                sync_session_id: Some(cycle.report.session_id.clone()),
            };
            let page = {
                let request = &request;
                self.services
                    .retry
                    .execute_with_retry("delta download", &self.options.retry, cancel, move || {
                        transport.fetch_delta(request)
                    })
                    .await
                    .into_result()?
            };

            let watermark = page.watermark().to_string();
            let has_more = page.has_more;
            let records = page.len();

            for (entity_type, (modified, deleted)) in group_by_entity(page.modified_entities, page.deleted_entities) {
                store.apply_delta(entity_type, &modified, &deleted).await?;
            }
            if !watermark.is_empty() {
                store
                    .set_checkpoint(&SyncCheckpoint::new(&watermark, &cycle.report.session_id))
                    .await?;
            }

            cycle.report.pages += 1;
            cycle.report.downloaded += records;
            debug!(
                "Applied delta page {} ({} records), checkpoint {}",
                cycle.report.pages, records, watermark
            );
            self.services.events.emit(SyncEvent::CycleProgress {
                session_id: cycle.report.session_id.clone(),
                phase: SyncPhase::Download,
                processed: cycle.report.downloaded,
                total: cycle.report.downloaded,
            });

            if !has_more {
                break;
            }
            if watermark.is_empty() || watermark == since {
                warn!("Delta watermark did not advance past {}, stopping download", since);
                break;
            }
            since = watermark;
        }
        Ok(())
    }

    async fn apply(&self, conflict: &Conflict, resolution: &Resolution) -> SyncResult<()> {
        apply_resolution(
            &self.services.queue,
            self.services.store.as_ref(),
            conflict,
            resolution,
        )
        .await
    }

    /// Close a conflict with data chosen by a person and apply it
    pub async fn resolve_manually(&self, conflict_id: &str, data: Value) -> SyncResult<Conflict> {
        let (conflict, resolution) = self.services.resolver.resolve_manually(conflict_id, data)?;
        self.apply(&conflict, &resolution).await?;
        Ok(conflict)
    }

    /// Resolve a stored conflict with an explicit strategy and apply the result
    pub async fn resolve_with(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ResolutionResult> {
        let conflict = self
            .services
            .resolver
            .get(conflict_id)?
            .ok_or_else(|| SyncError::Config(format!("No conflict with id {conflict_id}")))?;
        let result = self
            .services
            .resolver
            .resolve_conflict(&conflict, Some(strategy))?;
        if let ResolutionResult::Resolved(resolution) = &result {
            self.apply(&conflict, resolution).await?;
        }
        Ok(result)
    }
}

async fn wait_offline(mut network: watch::Receiver<NetworkState>) -> bool {
    network.wait_for(|state| !state.is_online()).await.is_ok()
}

type EntityChanges = (Vec<ModifiedEntity>, Vec<DeletedEntity>);

fn group_by_entity(
    modified: Vec<ModifiedEntity>,
    deleted: Vec<DeletedEntity>,
) -> BTreeMap<EntityType, EntityChanges> {
    let mut groups: BTreeMap<EntityType, EntityChanges> = BTreeMap::new();
    for entity in modified {
        groups.entry(entity.entity_type).or_default().0.push(entity);
    }
    for entity in deleted {
        groups.entry(entity.entity_type).or_default().1.push(entity);
    }
    groups
}

/// Carry a resolution into the queue and the local store
///
/// Server-side outcomes drop the queued operation and overwrite the local
/// record. Client-side outcomes put the operation back in line with the
/// resolved data. Applies only while the queue entry still waits on this
/// conflict. The local store is written first, so a failed write leaves the
/// entry CONFLICTED and the next cycle applies it again.
pub async fn apply_resolution(
    queue: &SyncQueue,
    store: &dyn LocalStore,
    conflict: &Conflict,
    resolution: &Resolution,
) -> SyncResult<()> {
    let waiting = queue
        .get(&conflict.local_id)?
        .is_some_and(|op| {
            op.status == OperationStatus::Conflicted
                && op.conflict_id.as_deref() == Some(conflict.conflict_id.as_str())
        });
    if !waiting {
        debug!(
            "Conflict {} already applied, operation {} no longer waits on it",
            conflict.conflict_id, conflict.local_id
        );
        return Ok(());
    }

    match resolution.outcome {
        ResolutionOutcome::AcceptServer => {
            let data = (!conflict.server.deleted && !resolution.data.is_null())
                .then_some(&resolution.data);
            store
                .apply_resolved(
                    conflict.entity_type,
                    &conflict.entity_id,
                    data,
                    conflict.server.version,
                )
                .await?;
            queue.remove(&conflict.local_id)?;
        }
        ResolutionOutcome::Push(operation_type) => {
            if operation_type != OperationType::Delete {
                store
                    .apply_resolved(
                        conflict.entity_type,
                        &conflict.entity_id,
                        Some(&resolution.data),
                        None,
                    )
                    .await?;
            }
            queue.requeue_resolved(&conflict.local_id, operation_type, &resolution.data)?;
        }
    }
    debug!(
        "Applied {} resolution of conflict {}",
        resolution.strategy, conflict.conflict_id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectionType;
    use crate::sync::message::{DeltaResponse, OperationError, ServerConflict};
    use crate::sync::testing::{harness, modified, update, Harness, LATEST};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn orchestrator(services: SyncServices) -> SyncOrchestrator {
        SyncOrchestrator::new(services, SyncOptions::new("device-1"))
    }

    fn report(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Coalesced => panic!("cycle was coalesced"),
        }
    }

    fn online() -> NetworkState {
        NetworkState {
            is_connected: true,
            is_internet_reachable: true,
            connection_type: ConnectionType::Wifi,
            ..Default::default()
        }
    }

    fn enqueue(h: &Harness, local_id: &str, entity_type: EntityType, entity_id: &str) {
        h.queue
            .enqueue(update(entity_type, entity_id, json!({"name": entity_id})).with_local_id(local_id))
            .unwrap();
    }

    #[tokio::test]
    async fn test_cycle_uploads_then_downloads() {
        let h = harness();
        enqueue(&h, "op-product", EntityType::Product, "p-1");
        enqueue(&h, "op-sale", EntityType::Sale, "s-1");
        h.transport.push_page(Ok(DeltaResponse {
            modified_entities: vec![modified(EntityType::Product, "p-9", json!({"name": "Soap"}))],
            server_timestamp: "2026-10-18T10:00:00Z".to_string(),
            ..Default::default()
        }));

        let orchestrator = orchestrator(h.services.clone());
        let report = report(orchestrator.sync_now(SyncTrigger::Manual).await);

        assert_eq!(report.state, SyncState::Success);
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.pages, 1);
        assert_eq!(h.queue.pending_count().unwrap(), 0);
        assert_eq!(h.store.record(EntityType::Product, "p-9"), Some(json!({"name": "Soap"})));
        assert_eq!(h.store.watermark().as_deref(), Some("2026-10-18T10:00:00Z"));

        let batches = h.transport.batches();
        assert_eq!(batches.len(), 1);
        let order: Vec<&str> = batches[0].operations.iter().map(|op| op.local_id.as_str()).collect();
        assert_eq!(order, vec!["op-sale", "op-product"]);
        assert_eq!(batches[0].device_id, "device-1");

        assert_eq!(orchestrator.state(), SyncState::Idle);
        assert_eq!(orchestrator.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_partial_batch_failure_leaves_only_failed_pending() {
        let h = harness();
        for (i, id) in ["op-1", "op-2", "op-3"].iter().enumerate() {
            enqueue(&h, id, EntityType::Product, &format!("p-{i}"));
        }
        h.transport.on_upload(|request| {
            Ok(BatchResponse::from_results(
                request
                    .operations
                    .iter()
                    .map(|op| {
                        if op.local_id == "op-2" {
                            OperationResult::failed(
                                &op.local_id,
                                OperationError {
                                    error_code: "SERVER_ERROR".to_string(),
                                    error_message: "database busy".to_string(),
                                    http_status: None,
                                    retryable: None,
                                },
                            )
                        } else {
                            OperationResult::success(&op.local_id, None)
                        }
                    })
                    .collect(),
            ))
        });

        let report = report(orchestrator(h.services.clone()).sync_now(SyncTrigger::Manual).await);

        assert_eq!(report.state, SyncState::PartialFailure);
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 1);

        let remaining = h.queue.list(None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].local_id, "op-2");
        assert_eq!(remaining[0].status, OperationStatus::Pending);
        assert_eq!(remaining[0].retry_count, 1);
        // not sent a second time within the same cycle
        assert_eq!(h.transport.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_dead_lettered() {
        let h = harness();
        enqueue(&h, "op-1", EntityType::Product, "p-1");
        h.transport.on_upload(|request| {
            Ok(BatchResponse::from_results(vec![OperationResult::failed(
                &request.operations[0].local_id,
                OperationError {
                    error_code: "VALIDATION_ERROR".to_string(),
                    error_message: "sku missing".to_string(),
                    http_status: None,
                    retryable: None,
                },
            )]))
        });

        let report = report(orchestrator(h.services.clone()).sync_now(SyncTrigger::Manual).await);

        assert_eq!(report.state, SyncState::PartialFailure);
        assert_eq!(report.retried, 0);
        let op = h.queue.get("op-1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.last_error.unwrap().contains("sku missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_failure_leaves_queue_untouched() {
        let h = harness();
        enqueue(&h, "op-1", EntityType::Product, "p-1");
        enqueue(&h, "op-2", EntityType::Sale, "s-1");
        h.transport
            .on_upload(|_| Err(SyncError::from_status(503, "maintenance", None)));

        let report = report(orchestrator(h.services.clone()).sync_now(SyncTrigger::Manual).await);

        assert_eq!(report.state, SyncState::Failed);
        assert!(report.last_error.unwrap().contains("503"));
        // every attempt of the sync profile was used
        assert_eq!(h.transport.batches().len(), RetryConfig::sync().max_attempts as usize);
        // aborted before delta download
        assert!(h.transport.delta_requests().is_empty());

        for op in h.queue.list(None).unwrap() {
            assert_eq!(op.status, OperationStatus::Pending);
            assert_eq!(op.retry_count, 0);
        }
    }

    #[tokio::test]
    async fn test_crash_between_delta_pages_resumes_from_checkpoint() {
        let h = harness();
        let page_one = DeltaResponse {
            modified_entities: vec![modified(EntityType::Product, "p-1", json!({"name": "Tea"}))],
            server_timestamp: "t-0".to_string(),
            has_more: true,
            next_sync_timestamp: Some("t-1".to_string()),
            ..Default::default()
        };
        let page_two = DeltaResponse {
            modified_entities: vec![modified(EntityType::Product, "p-2", json!({"name": "Rice"}))],
            server_timestamp: "t-2".to_string(),
            ..Default::default()
        };
        h.transport.push_page(Ok(page_one));
        h.transport.push_page(Ok(page_two.clone()));
        h.store.fail_on(Some("p-2"));

        let orchestrator = orchestrator(h.services.clone());
        let first = report(orchestrator.sync_now(SyncTrigger::Manual).await);
        assert_eq!(first.state, SyncState::Failed);
        assert_eq!(first.pages, 1);
        assert_eq!(h.store.watermark().as_deref(), Some("t-1"));
        assert!(h.store.record(EntityType::Product, "p-1").is_some());

        h.store.fail_on(None);
        h.transport.push_page(Ok(page_two));
        let second = report(orchestrator.sync_now(SyncTrigger::Manual).await);
        assert_eq!(second.state, SyncState::Success);

        let requests = h.transport.delta_requests();
        assert_eq!(requests[0].last_sync_timestamp, DeltaRequest::EPOCH);
        assert_eq!(requests.last().unwrap().last_sync_timestamp, "t-1");
        assert_eq!(h.store.watermark().as_deref(), Some("t-2"));
        assert!(h.store.record(EntityType::Product, "p-2").is_some());
    }

    #[tokio::test]
    async fn test_download_stops_when_watermark_stalls() {
        let h = harness();
        for _ in 0..3 {
            h.transport.push_page(Ok(DeltaResponse {
                server_timestamp: "t-stuck".to_string(),
                has_more: true,
                ..Default::default()
            }));
        }
        let orchestrator = orchestrator(h.services.clone());
        orchestrator.sync_now(SyncTrigger::Manual).await;
        let report = report(orchestrator.sync_now(SyncTrigger::Manual).await);

        assert_eq!(report.pages, 1);
        assert_eq!(report.state, SyncState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_coalesce() {
        let h = harness();
        enqueue(&h, "op-1", EntityType::Product, "p-1");
        h.transport.set_upload_delay(Duration::from_secs(5));
        let orchestrator = orchestrator(h.services.clone());

        let (a, b) = tokio::join!(
            orchestrator.sync_now(SyncTrigger::Manual),
            orchestrator.sync_now(SyncTrigger::Periodic)
        );

        let completed = [&a, &b].iter().filter(|o| o.report().is_some()).count();
        let coalesced = [&a, &b]
            .iter()
            .filter(|o| ***o == CycleOutcome::Coalesced)
            .count();
        assert_eq!((completed, coalesced), (1, 1));
        assert_eq!(h.transport.batches().len(), 1);
        assert!(!orchestrator.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_loss_cancels_and_reverts_in_flight() {
        let h = harness();
        enqueue(&h, "op-1", EntityType::Product, "p-1");
        h.transport.set_upload_delay(Duration::from_secs(20));
        let (network_tx, network_rx) = watch::channel(online());
        let orchestrator = orchestrator(h.services.clone()).with_network(network_rx);

        let (outcome, _) = tokio::join!(orchestrator.sync_now(SyncTrigger::Manual), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            network_tx.send_replace(NetworkState::default());
        });

        let report = report(outcome);
        assert_eq!(report.state, SyncState::Failed);
        assert!(report.cancelled);
        let op = h.queue.get("op-1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_timeout_cancels() {
        let h = harness();
        enqueue(&h, "op-1", EntityType::Product, "p-1");
        h.transport.set_upload_delay(Duration::from_secs(20));
        let options = SyncOptions {
            cycle_timeout: Duration::from_secs(5),
            ..SyncOptions::new("device-1")
        };
        let orchestrator = SyncOrchestrator::new(h.services.clone(), options);

        let report = report(orchestrator.sync_now(SyncTrigger::Periodic).await);
        assert_eq!(report.state, SyncState::Failed);
        assert!(report.cancelled);
        assert!(report.last_error.unwrap().contains("Timed out"));
        assert_eq!(h.queue.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_cycle_touches_nothing() {
        let h = harness();
        enqueue(&h, "op-1", EntityType::Product, "p-1");
        let (_network_tx, network_rx) = watch::channel(NetworkState::default());
        let orchestrator = orchestrator(h.services.clone()).with_network(network_rx);

        let report = report(orchestrator.sync_now(SyncTrigger::Periodic).await);
        assert_eq!(report.state, SyncState::Failed);
        assert!(h.transport.batches().is_empty());
        assert_eq!(h.queue.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_large_batch_is_compressed() {
        let h = harness();
        h.queue
            .enqueue(update(
                EntityType::Product,
                "p-1",
                json!({"description": "organic ".repeat(400)}),
            ))
            .unwrap();

        let report = report(orchestrator(h.services.clone()).sync_now(SyncTrigger::Manual).await);
        assert_eq!(report.uploaded, 1);
        assert_eq!(h.transport.compressed_flags(), vec![true]);
    }

    #[tokio::test]
    async fn test_created_entity_gets_server_id() {
        let h = harness();
        h.queue
            .enqueue(
                SyncOperation::new(EntityType::Product, OperationType::Create, "", json!({"name": "Jam"}))
                    .with_local_id("op-new"),
            )
            .unwrap();
        h.transport.on_upload(|request| {
            Ok(BatchResponse::from_results(vec![OperationResult::success(
                &request.operations[0].local_id,
                Some("srv-42"),
            )]))
        });

        orchestrator(h.services.clone()).sync_now(SyncTrigger::Manual).await;
        assert_eq!(
            h.store.acknowledged(),
            vec![("op-new".to_string(), "srv-42".to_string())]
        );
    }

    #[tokio::test]
    async fn test_version_conflict_accepts_newer_server_price() {
        let h = harness();
        h.queue
            .enqueue(
                update(EntityType::Product, "p-1", json!({"price": 11}))
                    .with_local_id("op-1")
                    .with_base(json!({"price": 10, "version": 3}))
                    .with_timestamp(Utc::now() - ChronoDuration::seconds(60)),
            )
            .unwrap();
        h.transport.on_upload(|request| {
            Ok(BatchResponse::from_results(vec![OperationResult::conflict(
                &request.operations[0].local_id,
                ServerConflict {
                    server_data: Some(json!({"price": 12, "version": 4})),
                    server_version: Some(4),
                    server_timestamp: Some(Utc::now()),
                    ..Default::default()
                },
            )]))
        });

        let report = report(orchestrator(h.services.clone()).sync_now(SyncTrigger::Manual).await);

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(report.state, SyncState::Success);
        assert!(h.queue.get("op-1").unwrap().is_none());
        assert_eq!(
            h.store.record(EntityType::Product, "p-1"),
            Some(json!({"price": 12, "version": 4}))
        );
    }

    #[tokio::test]
    async fn test_manual_conflict_waits_then_requeues() {
        let h = harness();
        h.queue
            .enqueue(
                update(EntityType::Sale, "s-1", json!({"quantity": 2}))
                    .with_local_id("op-1")
                    .with_base(json!({"quantity": 1})),
            )
            .unwrap();
        h.transport.on_upload(|request| {
            Ok(BatchResponse::from_results(
                request
                    .operations
                    .iter()
                    .map(|op| {
                        OperationResult::conflict(
                            &op.local_id,
                            ServerConflict {
                                server_data: Some(json!({"quantity": 3})),
                                ..Default::default()
                            },
                        )
                    })
                    .collect(),
            ))
        });
        let orchestrator = orchestrator(h.services.clone());

        let report = report(orchestrator.sync_now(SyncTrigger::Manual).await);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.conflicts_resolved, 0);
        assert_eq!(report.conflicts_pending, 1);
        assert_eq!(report.state, SyncState::PartialFailure);
        let op = h.queue.get("op-1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Conflicted);

        let pending = h.services.resolver.pending().unwrap();
        assert_eq!(pending.len(), 1);
        orchestrator
            .resolve_manually(&pending[0].conflict_id, json!({"quantity": 5}))
            .await
            .unwrap();

        let op = h.queue.get("op-1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.entity_data, json!({"quantity": 5}));
        assert_eq!(h.store.record(EntityType::Sale, "s-1"), Some(json!({"quantity": 5})));

        // a second application is a no-op
        orchestrator
            .resolve_manually(&pending[0].conflict_id, json!({"quantity": 5}))
            .await
            .unwrap();
        assert_eq!(h.queue.list(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_resolution_write_is_applied_next_cycle() {
        let h = harness();
        h.queue
            .enqueue(
                update(EntityType::Product, "p-1", json!({"price": 11}))
                    .with_local_id("op-1")
                    .with_base(json!({"price": 10, "version": 3}))
                    .with_timestamp(Utc::now() - ChronoDuration::seconds(60)),
            )
            .unwrap();
        h.transport.on_upload(|request| {
            Ok(BatchResponse::from_results(vec![OperationResult::conflict(
                &request.operations[0].local_id,
                ServerConflict {
                    server_data: Some(json!({"price": 12, "version": 4})),
                    server_version: Some(4),
                    server_timestamp: Some(Utc::now()),
                    ..Default::default()
                },
            )]))
        });
        h.store.fail_next_resolved();
        let orchestrator = orchestrator(h.services.clone());

        let first = report(orchestrator.sync_now(SyncTrigger::Manual).await);
        assert_eq!(first.conflicts, 1);
        assert_eq!(first.conflicts_resolved, 0);
        assert_eq!(first.conflicts_pending, 1);
        assert_eq!(first.state, SyncState::PartialFailure);
        assert!(first.last_error.is_none());
        // download still ran
        assert_eq!(h.transport.delta_requests().len(), 1);
        let op = h.queue.get("op-1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Conflicted);

        let second = report(orchestrator.sync_now(SyncTrigger::Manual).await);
        assert_eq!(second.conflicts_resolved, 1);
        assert_eq!(second.conflicts_pending, 0);
        assert_eq!(second.state, SyncState::Success);
        assert!(h.queue.get("op-1").unwrap().is_none());
        assert_eq!(
            h.store.record(EntityType::Product, "p-1"),
            Some(json!({"price": 12, "version": 4}))
        );
        assert_eq!(h.transport.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cycle_reports_watermark() {
        let h = harness();
        let report = report(orchestrator(h.services.clone()).sync_now(SyncTrigger::Foreground).await);
        assert_eq!(report.state, SyncState::Success);
        assert_eq!(report.trigger, SyncTrigger::Foreground);
        assert_eq!(h.store.watermark().as_deref(), Some(LATEST));
    }
}
