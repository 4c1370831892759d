//! Conflict resolver
//!
//! Owns conflict lifecycle: detection results are persisted, strategies are
//! selected and applied, failures are counted and eventually escalated to
//! manual review.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::detect::detect_conflicts;
use super::rules::ResolverConfig;
use super::store::ConflictStore;
use super::strategies::{self, BusinessRule, Resolved};
use super::types::{
    Conflict, ConflictStatus, Resolution, ResolutionOutcome, ResolutionStrategy,
};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::models::{EntityType, OperationType, SyncOperation};
use crate::sync::message::OperationResult;

/// Result of one resolution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionResult {
    Resolved(Resolution),
    /// Waiting for a human decision
    Manual,
    Failed {
        error: String,
        attempts: u32,
        escalated: bool,
    },
}

impl ResolutionResult {
    pub fn resolution(&self) -> Option<&Resolution> {
        match self {
            ResolutionResult::Resolved(resolution) => Some(resolution),
            _ => None,
        }
    }
}

/// Counts over stored conflicts and resolution attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMetrics {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub failed: usize,
    pub escalated: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_entity_type: BTreeMap<String, usize>,
    pub by_strategy: BTreeMap<String, usize>,
    pub resolution_attempts: u64,
    pub resolution_failures: u64,
}

impl ConflictMetrics {
    /// Share of automatic resolution attempts that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.resolution_attempts == 0 {
            return 0.0;
        }
        (self.resolution_attempts - self.resolution_failures) as f64
            / self.resolution_attempts as f64
    }
}

pub struct ConflictResolver {
    config: ResolverConfig,
    store: ConflictStore,
    events: EventBus,
    business_rules: RwLock<HashMap<EntityType, BusinessRule>>,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl ConflictResolver {
    /// Create a resolver with the built-in stock quantity rule registered
    pub fn new(config: ResolverConfig, store: ConflictStore, events: EventBus) -> Self {
        let mut rules: HashMap<EntityType, BusinessRule> = HashMap::new();
        let stock: BusinessRule = Arc::new(strategies::sum_quantity_deltas);
        rules.insert(EntityType::StockMovement, stock.clone());
        rules.insert(EntityType::Product, stock);

        Self {
            config,
            store,
            events,
            business_rules: RwLock::new(rules),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Register or replace the business rule for an entity type
    pub fn register_business_rule(&self, entity_type: EntityType, rule: BusinessRule) {
        match self.business_rules.write() {
            Ok(mut rules) => {
                rules.insert(entity_type, rule);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(entity_type, rule);
            }
        }
    }

    fn business_rule(&self, entity_type: EntityType) -> Option<BusinessRule> {
        match self.business_rules.read() {
            Ok(rules) => rules.get(&entity_type).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&entity_type).cloned(),
        }
    }

    /// Classify and persist conflicts for the rejected operations of a batch
    pub fn detect_conflicts(
        &self,
        ops: &[SyncOperation],
        results: &[OperationResult],
    ) -> SyncResult<Vec<Conflict>> {
        let conflicts = detect_conflicts(ops, results);
        for conflict in &conflicts {
            self.store.save(conflict)?;
            info!(
                "Conflict {} on {} {}: {} ({})",
                conflict.conflict_id,
                conflict.entity_type,
                conflict.entity_id,
                conflict.conflict_type,
                conflict.severity
            );
            self.events.emit(SyncEvent::ConflictDetected {
                conflict_id: conflict.conflict_id.clone(),
                entity_type: conflict.entity_type,
                entity_id: conflict.entity_id.clone(),
                conflict_type: conflict.conflict_type,
                severity: conflict.severity,
            });
        }
        Ok(conflicts)
    }

    fn apply_strategy(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
    ) -> Result<Resolved, String> {
        match strategy {
            ResolutionStrategy::LastWriteWins => Ok(strategies::last_write_wins(conflict)),
            ResolutionStrategy::ClientWins => Ok(strategies::client_wins(conflict)),
            ResolutionStrategy::ServerWins => Ok(strategies::server_wins(conflict)),
            ResolutionStrategy::Merge => Ok(strategies::merge(conflict)),
            ResolutionStrategy::BusinessRules => {
                let rule = self.business_rule(conflict.entity_type);
                strategies::business_rules(conflict, rule.as_ref())
            }
            ResolutionStrategy::Manual => Err("manual strategy cannot be applied automatically".into()),
        }
    }

    fn leave_for_manual(&self, mut conflict: Conflict) -> SyncResult<ResolutionResult> {
        conflict.status = ConflictStatus::Pending;
        self.store.save(&conflict)?;
        debug!("Conflict {} left for manual resolution", conflict.conflict_id);
        self.events.emit(SyncEvent::ManualResolutionRequired {
            conflict_id: conflict.conflict_id,
        });
        Ok(ResolutionResult::Manual)
    }

    fn mark_resolved(
        &self,
        mut conflict: Conflict,
        strategy: ResolutionStrategy,
        resolved: Resolved,
        resolved_by: &str,
    ) -> SyncResult<Resolution> {
        let now = Utc::now();
        let resolution = Resolution {
            strategy,
            outcome: resolved.outcome,
            data: resolved.data,
            resolved_by: resolved_by.to_string(),
            resolved_at: now,
        };
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution.clone());
        conflict.resolved_at = Some(now);
        conflict.last_error = None;
        self.store.save(&conflict)?;

        match self.store.trim_resolved(self.config.history_limit) {
            Ok(0) => {}
            Ok(trimmed) => debug!("Rotated {} resolved conflicts out of history", trimmed),
            Err(e) => warn!("Could not trim resolved conflict history: {}", e),
        }

        info!("Conflict {} resolved with {}", conflict.conflict_id, strategy);
        self.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict.conflict_id,
            strategy,
        });
        Ok(resolution)
    }

    /// Resolve one conflict, optionally forcing a strategy
    ///
    /// Re-resolving a resolved conflict returns the stored resolution.
    pub fn resolve_conflict(
        &self,
        conflict: &Conflict,
        strategy: Option<ResolutionStrategy>,
    ) -> SyncResult<ResolutionResult> {
        let mut conflict = self
            .store
            .get(&conflict.conflict_id)?
            .unwrap_or_else(|| conflict.clone());

        if conflict.is_resolved() {
            if let Some(resolution) = conflict.resolution {
                return Ok(ResolutionResult::Resolved(resolution));
            }
        }

        let strategy = match strategy {
            Some(strategy) => strategy,
            None if conflict.escalated => ResolutionStrategy::Manual,
            None => self.config.select_strategy(&conflict),
        };
        if strategy == ResolutionStrategy::Manual {
            return self.leave_for_manual(conflict);
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        match self.apply_strategy(&conflict, strategy) {
            Ok(resolved) => match self.mark_resolved(conflict.clone(), strategy, resolved, "system") {
                Ok(resolution) => Ok(ResolutionResult::Resolved(resolution)),
                Err(e) => {
                    // Keep it visible to retry_failed
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    conflict.attempts += 1;
                    conflict.status = ConflictStatus::Failed;
                    conflict.last_error = Some(e.to_string());
                    if let Err(save) = self.store.save(&conflict) {
                        warn!(
                            "Could not record failed resolution of conflict {}: {}",
                            conflict.conflict_id, save
                        );
                    }
                    Err(e)
                }
            },
            Err(error) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                conflict.attempts += 1;
                conflict.last_error = Some(error.clone());
                let attempts = conflict.attempts;
                let escalated = attempts >= self.config.max_resolution_attempts;

                if escalated {
                    warn!(
                        "Conflict {} escalated to manual review after {} failed attempts: {}",
                        conflict.conflict_id, attempts, error
                    );
                    conflict.escalated = true;
                    conflict.status = ConflictStatus::Pending;
                    self.store.save(&conflict)?;
                    self.events.emit(SyncEvent::ConflictEscalated {
                        conflict_id: conflict.conflict_id.clone(),
                        attempts,
                    });
                    self.events.emit(SyncEvent::ManualResolutionRequired {
                        conflict_id: conflict.conflict_id,
                    });
                } else {
                    warn!(
                        "Resolving conflict {} with {} failed ({}/{}): {}",
                        conflict.conflict_id,
                        strategy,
                        attempts,
                        self.config.max_resolution_attempts,
                        error
                    );
                    conflict.status = ConflictStatus::Failed;
                    self.store.save(&conflict)?;
                }

                Ok(ResolutionResult::Failed {
                    error,
                    attempts,
                    escalated,
                })
            }
        }
    }

    /// Resolve each conflict independently
    pub fn resolve_conflicts(
        &self,
        conflicts: &[Conflict],
    ) -> Vec<(String, SyncResult<ResolutionResult>)> {
        conflicts
            .iter()
            .map(|conflict| {
                let result = self.resolve_conflict(conflict, None);
                if let Err(e) = &result {
                    warn!("Could not resolve conflict {}: {}", conflict.conflict_id, e);
                }
                (conflict.conflict_id.clone(), result)
            })
            .collect()
    }

    /// Retry every FAILED conflict
    pub fn retry_failed(&self) -> SyncResult<Vec<(Conflict, ResolutionResult)>> {
        let failed = self.store.list(Some(ConflictStatus::Failed))?;
        if !failed.is_empty() {
            debug!("Retrying {} failed conflict resolutions", failed.len());
        }
        let mut results = Vec::with_capacity(failed.len());
        for conflict in failed {
            match self.resolve_conflict(&conflict, None) {
                Ok(result) => results.push((conflict, result)),
                Err(e) => warn!("Retrying conflict {} failed: {}", conflict.conflict_id, e),
            }
        }
        Ok(results)
    }

    /// Close a conflict with data chosen by a person
    pub fn resolve_manually(&self, conflict_id: &str, data: Value) -> SyncResult<(Conflict, Resolution)> {
        let conflict = self
            .store
            .get(conflict_id)?
            .ok_or_else(|| SyncError::Config(format!("No conflict with id {conflict_id}")))?;
        if let (true, Some(resolution)) = (conflict.is_resolved(), &conflict.resolution) {
            return Ok((conflict.clone(), resolution.clone()));
        }

        let outcome = if data == conflict.server.data || (data.is_null() && conflict.server.deleted) {
            ResolutionOutcome::AcceptServer
        } else if data.is_null() {
            ResolutionOutcome::Push(OperationType::Delete)
        } else if conflict.server.deleted {
            ResolutionOutcome::Push(OperationType::Create)
        } else {
            ResolutionOutcome::Push(OperationType::Update)
        };

        let resolution = self.mark_resolved(
            conflict.clone(),
            ResolutionStrategy::Manual,
            Resolved { outcome, data },
            "user",
        )?;
        let stored = self.store.get(conflict_id)?.unwrap_or(conflict);
        Ok((stored, resolution))
    }

    pub fn get(&self, conflict_id: &str) -> SyncResult<Option<Conflict>> {
        Ok(self.store.get(conflict_id)?)
    }

    pub fn list(&self, status: Option<ConflictStatus>) -> SyncResult<Vec<Conflict>> {
        Ok(self.store.list(status)?)
    }

    pub fn pending(&self) -> SyncResult<Vec<Conflict>> {
        self.list(Some(ConflictStatus::Pending))
    }

    pub fn metrics(&self) -> SyncResult<ConflictMetrics> {
        let mut metrics = ConflictMetrics {
            resolution_attempts: self.attempts.load(Ordering::Relaxed),
            resolution_failures: self.failures.load(Ordering::Relaxed),
            ..Default::default()
        };

        for conflict in self.store.list(None)? {
            metrics.total += 1;
            match conflict.status {
                ConflictStatus::Pending => metrics.pending += 1,
                ConflictStatus::Resolved => metrics.resolved += 1,
                ConflictStatus::Failed => metrics.failed += 1,
            }
            if conflict.escalated {
                metrics.escalated += 1;
            }
            *metrics
                .by_type
                .entry(conflict.conflict_type.to_string())
                .or_default() += 1;
            *metrics
                .by_severity
                .entry(conflict.severity.to_string())
                .or_default() += 1;
            *metrics
                .by_entity_type
                .entry(conflict.entity_type.to_string())
                .or_default() += 1;
            if let Some(resolution) = &conflict.resolution {
                *metrics
                    .by_strategy
                    .entry(resolution.strategy.to_string())
                    .or_default() += 1;
            }
        }
        Ok(metrics)
    }
}
