//! Foundation types for the Vellum configuration store.
//!
//! This crate provides the in-memory side of a configuration entry: the
//! domain-scoped value variants of a key and the aggregate that collects
//! them. Every other Vellum crate depends on `vellum-types`.
//!
//! # Key Types
//!
//! - [`DomainValue`] -- One value variant scoped by a domain pattern and an optional change set
//! - [`KeyValues`] -- Trait for the aggregate of all variants of one key
//! - [`DomainKeyValues`] -- Default `BTreeMap`-backed aggregate
//! - [`ValueKind`] -- Classification of raw payloads
//!
//! Raw payloads are plain [`serde_json::Value`]s; JSON `null` means "no value".

pub mod change_set;
pub mod domain_value;
pub mod error;
pub mod key_values;
pub mod pattern;
pub mod value;

pub use change_set::{change_set_sentinel, null_when_empty, NO_CHANGE_SET};
pub use domain_value::DomainValue;
pub use error::TypeError;
pub use key_values::{DomainKeyValues, DomainKeyValuesFactory, KeyValues, KeyValuesFactory};
pub use pattern::{join_pattern, split_pattern, PATTERN_SEPARATOR};
pub use value::{is_nil, Value, ValueKind};
