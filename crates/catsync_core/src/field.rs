//! Field values, field maps and field-level diffs.
//!
//! Entities carry a flat map of named fields. Keys that start with `_` are
//! internal bookkeeping and never count as a user-visible difference.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum accepted field name length.
pub const MAX_FIELD_NAME_LEN: usize = 128;

/// Maximum accepted text value length in bytes.
pub const MAX_TEXT_LEN: usize = 64 * 1024;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point (prices, weights).
    Float(f64),
    /// Text.
    Text(String),
}

impl FieldValue {
    /// Returns the numeric value, if this is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Ordered map of field name to value.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Builds a field map from `(name, value)` pairs.
pub fn field_map<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Returns true if the field is user-visible.
#[must_use]
pub fn is_visible(name: &str) -> bool {
    !name.starts_with('_')
}

/// Returns only the user-visible fields.
#[must_use]
pub fn visible_fields(fields: &FieldMap) -> FieldMap {
    fields
        .iter()
        .filter(|(k, _)| is_visible(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Before/after pair for one field. `None` means absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value before the change.
    pub before: Option<FieldValue>,
    /// Value after the change.
    pub after: Option<FieldValue>,
}

impl FieldChange {
    /// Divergence magnitude in `[0, 1]`.
    ///
    /// Numbers use relative change capped at 1; other value changes count
    /// 0.5; adding or removing a field counts 1.
    #[must_use]
    pub fn divergence(&self) -> f64 {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => match (before.as_f64(), after.as_f64()) {
                (Some(b), Some(a)) => ((a - b).abs() / b.abs().max(1.0)).min(1.0),
                _ if before == after => 0.0,
                _ => 0.5,
            },
            (None, None) => 0.0,
            _ => 1.0,
        }
    }
}

/// Field-level diff keyed by field name.
pub type FieldDiff = BTreeMap<String, FieldChange>;

/// Computes the user-visible diff from `current` to `candidate`.
///
/// Only fields present in the candidate are compared: the candidate is a
/// partial update, and omitted fields keep their current value. A field set
/// to [`FieldValue::Null`] in the candidate is removed.
#[must_use]
pub fn diff_fields(current: &FieldMap, candidate: &FieldMap) -> FieldDiff {
    let mut diff = FieldDiff::new();
    for (name, value) in candidate.iter().filter(|(k, _)| is_visible(k)) {
        let before = current.get(name).cloned();
        let after = match value {
            FieldValue::Null => None,
            other => Some(other.clone()),
        };
        if before != after {
            diff.insert(name.clone(), FieldChange { before, after });
        }
    }
    diff
}

/// Computes a diff that removes every visible field (used for deletes).
#[must_use]
pub fn removal_diff(current: &FieldMap) -> FieldDiff {
    current
        .iter()
        .filter(|(k, _)| is_visible(k))
        .map(|(k, v)| {
            (
                k.clone(),
                FieldChange {
                    before: Some(v.clone()),
                    after: None,
                },
            )
        })
        .collect()
}

/// Applies the `after` side of a diff onto a field map.
pub fn apply_diff(fields: &mut FieldMap, diff: &FieldDiff) {
    for (name, change) in diff {
        match &change.after {
            Some(value) => {
                fields.insert(name.clone(), value.clone());
            }
            None => {
                fields.remove(name);
            }
        }
    }
}

/// Validates a candidate field map.
pub fn validate_fields(fields: &FieldMap) -> CoreResult<()> {
    for (name, value) in fields {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("field name must not be empty".into()));
        }
        if name.len() > MAX_FIELD_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "field name exceeds {MAX_FIELD_NAME_LEN} bytes: {name}"
            )));
        }
        match value {
            FieldValue::Float(v) if !v.is_finite() => {
                return Err(CoreError::Validation(format!(
                    "field {name} must be a finite number"
                )));
            }
            FieldValue::Text(s) if s.len() > MAX_TEXT_LEN => {
                return Err(CoreError::Validation(format!(
                    "field {name} exceeds {MAX_TEXT_LEN} bytes"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
