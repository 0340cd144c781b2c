//! The aggregate of all value variants of one key.
//!
//! [`KeyValues`] is the seam between the persistence layer and the
//! configuration API that resolves values at read time. The persistence
//! layer only reads the description and the variant set, and rebuilds
//! aggregates through [`KeyValues::put`] / [`KeyValues::put_with_change_set`]
//! on instances handed out by a [`KeyValuesFactory`].

use std::collections::BTreeMap;

use crate::change_set::null_when_empty;
use crate::domain_value::DomainValue;
use crate::error::TypeError;
use crate::value::Value;

/// In-memory aggregate of one key's description and value variants.
pub trait KeyValues {
    fn description(&self) -> Option<&str>;

    fn set_description(&mut self, description: Option<String>);

    /// All variants, across every change set.
    ///
    /// Returns `None` when the aggregate carries no variant set at all, which
    /// is distinct from an empty set.
    fn domain_values(&self) -> Option<Vec<DomainValue>>;

    /// Add (or replace) a variant without change set.
    fn put(&mut self, value: Option<Value>, domain_parts: &[&str]) -> Result<(), TypeError>;

    /// Add (or replace) a variant tagged with `change_set`.
    fn put_with_change_set(
        &mut self,
        change_set: &str,
        value: Option<Value>,
        domain_parts: &[&str],
    ) -> Result<(), TypeError>;
}

/// Creates fresh, empty aggregates.
pub trait KeyValuesFactory {
    type KeyValues: KeyValues;

    fn create(&self) -> Self::KeyValues;
}

type VariantKey = (Option<String>, Option<String>);

/// Default [`KeyValues`] implementation keyed by `(pattern, change_set)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DomainKeyValues {
    description: Option<String>,
    values: BTreeMap<VariantKey, DomainValue>,
}

impl DomainKeyValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            values: BTreeMap::new(),
        }
    }

    /// Add (or replace) a prebuilt variant.
    pub fn insert(&mut self, value: DomainValue) {
        let key = (
            value.pattern_str().map(str::to_string),
            value.change_set().map(str::to_string),
        );
        self.values.insert(key, value);
    }

    /// Look up the variant for an exact pattern and change set.
    pub fn get(&self, pattern: &str, change_set: Option<&str>) -> Option<&DomainValue> {
        let key = (
            Some(pattern.to_string()),
            null_when_empty(change_set).map(str::to_string),
        );
        self.values.get(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainValue> {
        self.values.values()
    }
}

impl KeyValues for DomainKeyValues {
    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }

    fn domain_values(&self) -> Option<Vec<DomainValue>> {
        Some(self.values.values().cloned().collect())
    }

    fn put(&mut self, value: Option<Value>, domain_parts: &[&str]) -> Result<(), TypeError> {
        self.insert(DomainValue::new(domain_parts, value)?);
        Ok(())
    }

    fn put_with_change_set(
        &mut self,
        change_set: &str,
        value: Option<Value>,
        domain_parts: &[&str],
    ) -> Result<(), TypeError> {
        self.insert(DomainValue::with_change_set(change_set, domain_parts, value)?);
        Ok(())
    }
}

/// Factory for [`DomainKeyValues`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DomainKeyValuesFactory;

impl KeyValuesFactory for DomainKeyValuesFactory {
    type KeyValues = DomainKeyValues;

    fn create(&self) -> DomainKeyValues {
        DomainKeyValues::new()
    }
}
