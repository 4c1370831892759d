//! Conflict detection and resolution
//!
//! - `detect`: classify server-rejected operations
//! - `rules`: pick a strategy (custom rules, per type, per entity, severity)
//! - `strategies`: apply a strategy to produce the resolved record
//! - `resolver`: lifecycle, persistence, escalation and metrics

pub mod detect;
mod resolver;
mod rules;
mod store;
pub mod strategies;
mod types;

pub use detect::{assess_severity, conflicting_fields, detect_conflict, detect_conflicts, field_sensitivity};
pub use resolver::{ConflictMetrics, ConflictResolver, ResolutionResult};
pub use rules::{
    ResolutionRule, ResolverConfig, RuleCondition, DEFAULT_HISTORY_LIMIT,
    DEFAULT_MAX_RESOLUTION_ATTEMPTS,
};
pub use store::ConflictStore;
pub use strategies::BusinessRule;
pub use types::{
    Conflict, ConflictSeverity, ConflictStatus, ConflictType, Resolution, ResolutionOutcome,
    ResolutionStrategy, Snapshot,
};
