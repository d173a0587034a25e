//! Conflict records and the declarative severity rule table.

use crate::error::{CoreError, CoreResult};
use crate::types::{ChangeId, ConflictId, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity of a detected conflict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Cosmetic fields.
    #[default]
    Low,
    /// Descriptive fields.
    Medium,
    /// Commercial fields such as price.
    High,
    /// Fields that must never be overwritten blindly.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Rebase the staged change onto the live version and keep it.
    KeepStaged,
    /// Drop the staged change in favour of the live state.
    DiscardStaged,
}

/// A divergence between a staged change's base and the live entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict identifier.
    pub id: ConflictId,
    /// The staged change that conflicts.
    pub staged_change_id: ChangeId,
    /// The entity both sides touch.
    pub entity_id: EntityId,
    /// Fields whose live value differs from the diff's `before`.
    pub conflicting_fields: Vec<String>,
    /// Assigned severity.
    pub severity: Severity,
    /// Version the change assumed.
    pub base_version: u64,
    /// Version found in the store.
    pub live_version: u64,
    /// Detection time.
    pub detected_at: Timestamp,
    /// Resolution, `None` while unresolved.
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Creates an unresolved conflict.
    pub fn new(
        staged_change_id: ChangeId,
        entity_id: EntityId,
        conflicting_fields: Vec<String>,
        severity: Severity,
        base_version: u64,
        live_version: u64,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            staged_change_id,
            entity_id,
            conflicting_fields,
            severity,
            base_version,
            live_version,
            detected_at: Timestamp::now(),
            resolution: None,
        }
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Weight and severity assigned to a field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Relative weight in confidence scoring.
    pub weight: f64,
    /// Severity when the field conflicts.
    pub severity: Severity,
}

impl FieldRule {
    /// Creates a rule.
    pub const fn new(weight: f64, severity: Severity) -> Self {
        Self { weight, severity }
    }
}

impl Default for FieldRule {
    fn default() -> Self {
        Self::new(1.0, Severity::Low)
    }
}

/// Declarative `field -> {weight, severity}` table.
///
/// Deserializes from a JSON object keyed by field name. Fields without a
/// rule use the table's fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRules {
    /// Per-field rules.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,
    /// Rule for fields not in the table.
    #[serde(default)]
    pub fallback: FieldRule,
}

impl ConflictRules {
    /// Creates an empty table with the default fallback.
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
            fallback: FieldRule::default(),
        }
    }

    /// Adds or replaces a rule.
    #[must_use]
    pub fn with_rule(mut self, field: impl Into<String>, weight: f64, severity: Severity) -> Self {
        self.fields
            .insert(field.into(), FieldRule::new(weight, severity));
        self
    }

    /// Looks up the rule for a field.
    pub fn rule(&self, field: &str) -> FieldRule {
        self.fields.get(field).copied().unwrap_or(self.fallback)
    }

    /// Highest severity among the given fields, `Low` when empty.
    pub fn severity_of<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> Severity {
        fields
            .into_iter()
            .map(|f| self.rule(f).severity)
            .max()
            .unwrap_or(Severity::Low)
    }

    /// Parses a table from JSON.
    pub fn from_json(text: &str) -> CoreResult<Self> {
        let rules: Self =
            serde_json::from_str(text).map_err(|e| CoreError::Validation(e.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Rejects negative or non-finite weights.
    pub fn validate(&self) -> CoreResult<()> {
        let named = self.fields.iter().map(|(k, r)| (k.as_str(), r));
        for (name, rule) in named.chain(std::iter::once(("<fallback>", &self.fallback))) {
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                return Err(CoreError::Validation(format!(
                    "rule weight for {name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ConflictRules {
    /// Catalog defaults: commercial fields weigh most.
    fn default() -> Self {
        Self::empty()
            .with_rule("price", 3.0, Severity::High)
            .with_rule("compare_at_price", 2.0, Severity::High)
            .with_rule("inventory_quantity", 2.0, Severity::High)
            .with_rule("sku", 3.0, Severity::Critical)
            .with_rule("status", 2.0, Severity::Medium)
            .with_rule("title", 1.5, Severity::Medium)
            .with_rule("description", 1.0, Severity::Low)
            .with_rule("tags", 0.5, Severity::Low)
    }
}
