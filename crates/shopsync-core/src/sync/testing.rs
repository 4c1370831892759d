//! Test doubles for sync cycles

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::message::{
    BatchRequest, BatchResponse, DeletedEntity, DeltaRequest, DeltaResponse, ModifiedEntity,
    OperationResult,
};
use super::orchestrator::SyncServices;
use super::transport::{RequestBody, SyncTransport};
use crate::compression::PayloadCompressor;
use crate::conflict::{ConflictResolver, ConflictStore, ResolverConfig};
use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::models::{EntityType, OperationType, SyncOperation};
use crate::queue::{SyncQueue, DEFAULT_MAX_RETRIES};
use crate::retry::RetryCoordinator;
use crate::storage::Database;
use crate::store::{LocalStore, SyncCheckpoint};

/// Watermark of the empty page served once scripted pages run out
pub(crate) const LATEST: &str = "2026-10-01T00:00:00Z";

type UploadHandler = Box<dyn FnMut(&BatchRequest) -> SyncResult<BatchResponse> + Send>;

/// Accept every operation in the batch
pub(crate) fn accept_all(request: &BatchRequest) -> SyncResult<BatchResponse> {
    Ok(BatchResponse::from_results(
        request
            .operations
            .iter()
            .map(|op| OperationResult::success(&op.local_id, None))
            .collect(),
    ))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scripted sync server
pub(crate) struct MockTransport {
    handler: Mutex<UploadHandler>,
    pages: Mutex<VecDeque<SyncResult<DeltaResponse>>>,
    delay: Mutex<Option<Duration>>,
    batches: Mutex<Vec<(BatchRequest, bool)>>,
    delta_requests: Mutex<Vec<DeltaRequest>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let handler: UploadHandler = Box::new(accept_all);
        Self {
            handler: Mutex::new(handler),
            pages: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            batches: Mutex::new(Vec::new()),
            delta_requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn on_upload(
        &self,
        handler: impl FnMut(&BatchRequest) -> SyncResult<BatchResponse> + Send + 'static,
    ) {
        let handler: UploadHandler = Box::new(handler);
        *lock(&self.handler) = handler;
    }

    pub(crate) fn push_page(&self, page: SyncResult<DeltaResponse>) {
        lock(&self.pages).push_back(page);
    }

    /// Hold every upload for `delay` before answering
    pub(crate) fn set_upload_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub(crate) fn batches(&self) -> Vec<BatchRequest> {
        lock(&self.batches).iter().map(|(b, _)| b.clone()).collect()
    }

    pub(crate) fn compressed_flags(&self) -> Vec<bool> {
        lock(&self.batches).iter().map(|(_, c)| *c).collect()
    }

    pub(crate) fn delta_requests(&self) -> Vec<DeltaRequest> {
        lock(&self.delta_requests).clone()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn upload_batch(&self, body: &RequestBody) -> SyncResult<BatchResponse> {
        let request: BatchRequest = match body {
            RequestBody::Json(bytes) => serde_json::from_slice(bytes)?,
            RequestBody::Gzip(bytes) => {
                serde_json::from_value(PayloadCompressor::default().decompress(bytes)?.data)?
            }
        };
        lock(&self.batches).push((request.clone(), body.is_compressed()));

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut handler = lock(&self.handler);
        (*handler)(&request)
    }

    async fn fetch_delta(&self, request: &DeltaRequest) -> SyncResult<DeltaResponse> {
        lock(&self.delta_requests).push(request.clone());
        lock(&self.pages).pop_front().unwrap_or_else(|| {
            Ok(DeltaResponse {
                server_timestamp: LATEST.to_string(),
                ..Default::default()
            })
        })
    }
}

/// In-memory app database
#[derive(Default)]
pub(crate) struct MemoryLocalStore {
    records: Mutex<BTreeMap<(EntityType, String), Value>>,
    checkpoint: Mutex<Option<SyncCheckpoint>>,
    fail_on: Mutex<Option<String>>,
    fail_resolved: Mutex<bool>,
    acknowledged: Mutex<Vec<(String, String)>>,
}

impl MemoryLocalStore {
    pub(crate) fn record(&self, entity_type: EntityType, entity_id: &str) -> Option<Value> {
        lock(&self.records)
            .get(&(entity_type, entity_id.to_string()))
            .cloned()
    }

    pub(crate) fn watermark(&self) -> Option<String> {
        lock(&self.checkpoint)
            .as_ref()
            .map(|c| c.last_sync_timestamp.clone())
    }

    /// Make `apply_delta` fail for any page carrying this entity
    pub(crate) fn fail_on(&self, entity_id: Option<&str>) {
        *lock(&self.fail_on) = entity_id.map(str::to_string);
    }

    /// Make the next `apply_resolved` fail
    pub(crate) fn fail_next_resolved(&self) {
        *lock(&self.fail_resolved) = true;
    }

    pub(crate) fn acknowledged(&self) -> Vec<(String, String)> {
        lock(&self.acknowledged).clone()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn apply_delta(
        &self,
        entity_type: EntityType,
        modified: &[ModifiedEntity],
        deleted: &[DeletedEntity],
    ) -> SyncResult<()> {
        if let Some(id) = lock(&self.fail_on).as_deref() {
            if modified.iter().any(|e| e.entity_id == id) {
                return Err(SyncError::Unknown(format!("crashed while applying {id}")));
            }
        }
        let mut records = lock(&self.records);
        for entity in modified {
            records.insert((entity_type, entity.entity_id.clone()), entity.entity_data.clone());
        }
        for entity in deleted {
            records.remove(&(entity_type, entity.entity_id.clone()));
        }
        Ok(())
    }

    async fn apply_resolved(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        data: Option<&Value>,
        _version: Option<i64>,
    ) -> SyncResult<()> {
        if std::mem::take(&mut *lock(&self.fail_resolved)) {
            return Err(SyncError::Unknown(format!("crashed while writing {entity_id}")));
        }
        let key = (entity_type, entity_id.to_string());
        let mut records = lock(&self.records);
        match data {
            Some(data) => records.insert(key, data.clone()),
            None => records.remove(&key),
        };
        Ok(())
    }

    async fn acknowledge(&self, op: &SyncOperation, server_id: &str) -> SyncResult<()> {
        lock(&self.acknowledged).push((op.local_id.clone(), server_id.to_string()));
        Ok(())
    }

    async fn get_checkpoint(&self) -> SyncResult<Option<SyncCheckpoint>> {
        Ok(lock(&self.checkpoint).clone())
    }

    async fn set_checkpoint(&self, checkpoint: &SyncCheckpoint) -> SyncResult<()> {
        *lock(&self.checkpoint) = Some(checkpoint.clone());
        Ok(())
    }
}

/// Services wired to in-memory doubles
pub(crate) struct Harness {
    pub services: SyncServices,
    pub queue: SyncQueue,
    pub store: Arc<MemoryLocalStore>,
    pub transport: Arc<MockTransport>,
}

pub(crate) fn harness() -> Harness {
    let db = Database::open_in_memory().unwrap();
    let events = EventBus::default();
    let queue = SyncQueue::open(db.clone(), DEFAULT_MAX_RETRIES).unwrap();
    let store = Arc::new(MemoryLocalStore::default());
    let transport = Arc::new(MockTransport::new());
    let resolver = ConflictResolver::new(
        ResolverConfig::default(),
        ConflictStore::new(db),
        events.clone(),
    );

    let services = SyncServices {
        queue: queue.clone(),
        store: store.clone(),
        transport: transport.clone(),
        resolver: Arc::new(resolver),
        retry: Arc::new(RetryCoordinator::new(events.clone())),
        compressor: Arc::new(PayloadCompressor::default()),
        events,
    };
    Harness {
        services,
        queue,
        store,
        transport,
    }
}

pub(crate) fn update(entity_type: EntityType, entity_id: &str, data: Value) -> SyncOperation {
    SyncOperation::new(entity_type, OperationType::Update, entity_id, data)
}

pub(crate) fn modified(entity_type: EntityType, entity_id: &str, data: Value) -> ModifiedEntity {
    ModifiedEntity {
        entity_id: entity_id.to_string(),
        entity_type,
        entity_data: data,
        last_modified: Utc::now(),
        version: 1,
        operation_type: OperationType::Update,
    }
}
