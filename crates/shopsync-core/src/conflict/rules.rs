//! Strategy selection
//!
//! Resolution order for a conflict with no explicit override:
//! 1. custom rules, top-down, first match wins
//! 2. per conflict type
//! 3. per entity type
//! 4. severity defaults (critical → manual, high → merge)
//! 5. the global default

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Conflict, ConflictSeverity, ConflictType, ResolutionStrategy};
use crate::models::EntityType;

/// Default number of failed automatic attempts before escalation to manual
pub const DEFAULT_MAX_RESOLUTION_ATTEMPTS: u32 = 3;

/// Default number of resolved conflicts kept for audit
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Predicate over a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    EntityType { entity_type: EntityType },
    ConflictType { conflict_type: ConflictType },
    SeverityAtLeast { severity: ConflictSeverity },
    /// The field is among the conflicting fields
    FieldConflicting { field: String },
    /// The local (or else server) value of the field equals `value`
    FieldEquals { field: String, value: Value },
    All { conditions: Vec<RuleCondition> },
    Any { conditions: Vec<RuleCondition> },
}

impl RuleCondition {
    pub fn matches(&self, conflict: &Conflict) -> bool {
        match self {
            RuleCondition::EntityType { entity_type } => conflict.entity_type == *entity_type,
            RuleCondition::ConflictType { conflict_type } => {
                conflict.conflict_type == *conflict_type
            }
            RuleCondition::SeverityAtLeast { severity } => conflict.severity >= *severity,
            RuleCondition::FieldConflicting { field } => {
                conflict.conflicting_fields.iter().any(|f| f == field)
            }
            RuleCondition::FieldEquals { field, value } => conflict
                .local
                .data
                .get(field)
                .or_else(|| conflict.server.data.get(field))
                .is_some_and(|v| v == value),
            RuleCondition::All { conditions } => conditions.iter().all(|c| c.matches(conflict)),
            RuleCondition::Any { conditions } => conditions.iter().any(|c| c.matches(conflict)),
        }
    }
}

fn default_active() -> bool {
    true
}

/// A named `condition -> strategy` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRule {
    pub name: String,
    pub condition: RuleCondition,
    pub strategy: ResolutionStrategy,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ResolutionRule {
    pub fn new(name: impl Into<String>, condition: RuleCondition, strategy: ResolutionStrategy) -> Self {
        Self {
            name: name.into(),
            condition,
            strategy,
            active: true,
        }
    }
}

/// Resolver settings, the `[conflicts]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub default_strategy: ResolutionStrategy,
    /// Keyed by conflict type name, e.g. `update_delete = "server_wins"`
    pub by_conflict_type: BTreeMap<String, ResolutionStrategy>,
    /// Keyed by entity type name, e.g. `stock_movement = "business_rules"`
    pub by_entity_type: BTreeMap<String, ResolutionStrategy>,
    /// Pick manual for critical and merge for high severity when nothing else matched
    pub severity_defaults: bool,
    pub rules: Vec<ResolutionRule>,
    pub max_resolution_attempts: u32,
    pub history_limit: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let mut by_entity_type = BTreeMap::new();
        by_entity_type.insert(
            EntityType::StockMovement.as_str().to_string(),
            ResolutionStrategy::BusinessRules,
        );

        Self {
            default_strategy: ResolutionStrategy::LastWriteWins,
            by_conflict_type: BTreeMap::new(),
            by_entity_type,
            severity_defaults: true,
            rules: Vec::new(),
            max_resolution_attempts: DEFAULT_MAX_RESOLUTION_ATTEMPTS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ResolverConfig {
    /// Strategy for `conflict` when the caller gives no override
    pub fn select_strategy(&self, conflict: &Conflict) -> ResolutionStrategy {
        if let Some(rule) = self
            .rules
            .iter()
            .find(|rule| rule.active && rule.condition.matches(conflict))
        {
            return rule.strategy;
        }

        if let Some(strategy) = self.by_conflict_type.get(conflict.conflict_type.as_str()) {
            return *strategy;
        }
        if let Some(strategy) = self.by_entity_type.get(conflict.entity_type.as_str()) {
            return *strategy;
        }

        if self.severity_defaults {
            match conflict.severity {
                ConflictSeverity::Critical => return ResolutionStrategy::Manual,
                ConflictSeverity::High => return ResolutionStrategy::Merge,
                _ => {}
            }
        }

        self.default_strategy
    }
}
