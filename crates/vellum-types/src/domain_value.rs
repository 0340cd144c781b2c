use serde::{Deserialize, Serialize};

use crate::change_set::null_when_empty;
use crate::error::TypeError;
use crate::pattern::{join_pattern, split_pattern};
use crate::value::Value;

/// One value variant of a configuration key.
///
/// A variant is scoped by a domain pattern and optionally tagged with a
/// change set. Within one key, `(pattern, change_set)` identifies a variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainValue {
    pattern: Option<String>,
    value: Option<Value>,
    change_set: Option<String>,
}

impl DomainValue {
    /// Create a variant without change set from domain parts.
    pub fn new<S: AsRef<str>>(domain_parts: &[S], value: Option<Value>) -> Result<Self, TypeError> {
        Ok(Self::from_pattern(join_pattern(domain_parts)?, value, None))
    }

    /// Create a variant tagged with a change set from domain parts.
    pub fn with_change_set<S: AsRef<str>>(
        change_set: &str,
        domain_parts: &[S],
        value: Option<Value>,
    ) -> Result<Self, TypeError> {
        Ok(Self::from_pattern(
            join_pattern(domain_parts)?,
            value,
            Some(change_set),
        ))
    }

    /// Create a variant from an already serialized pattern.
    ///
    /// An empty change-set label is stored as no change set.
    pub fn from_pattern(pattern: impl Into<String>, value: Option<Value>, change_set: Option<&str>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            value,
            change_set: null_when_empty(change_set).map(str::to_string),
        }
    }

    /// Create a variant that carries no pattern at all.
    ///
    /// Aggregates built outside this crate may hand such variants to the
    /// persistence layer, which rejects them.
    pub fn unscoped(value: Option<Value>, change_set: Option<&str>) -> Self {
        Self {
            pattern: None,
            value,
            change_set: null_when_empty(change_set).map(str::to_string),
        }
    }

    /// The serialized pattern, if any.
    pub fn pattern_str(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    /// The pattern split into its domain parts.
    pub fn domain_parts(&self) -> Vec<&str> {
        self.pattern.as_deref().map(split_pattern).unwrap_or_default()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn change_set(&self) -> Option<&str> {
        self.change_set.as_deref()
    }

    /// Returns `true` when this variant belongs to the given change set.
    ///
    /// An empty label and no label are the same change set.
    pub fn change_set_is(&self, change_set: Option<&str>) -> bool {
        null_when_empty(self.change_set.as_deref()) == null_when_empty(change_set)
    }
}
