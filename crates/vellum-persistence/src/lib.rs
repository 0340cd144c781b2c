//! Persistence reconciliation for Vellum.
//!
//! Loads key aggregates from the relational store and writes them back by
//! diffing against the stored rows.
//!
//! # Operations
//!
//! - [`Persistence::load`] / [`Persistence::load_all`] / [`Persistence::reload`]
//! - [`Persistence::store`] -- insert new variants, update changed ones
//! - [`Persistence::remove`] -- remove matching variants, or the whole key
//! - [`Persistence::remove_value`] -- remove one variant by identity
//! - [`Persistence::find_keys`] / [`Persistence::all_keys`]
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use vellum_persistence::{Persistence, PersistenceConfig};
//! use vellum_store::MemoryBackend;
//! use vellum_types::{DomainKeyValues, DomainKeyValuesFactory, KeyValues};
//!
//! let engine = Persistence::new(Arc::new(MemoryBackend::new()), PersistenceConfig::default());
//!
//! let mut color = DomainKeyValues::with_description("Main color");
//! color.put(Some(json!("red")), &[]).unwrap();
//! engine.store("color", &color, None).unwrap();
//!
//! let loaded = engine.load("color", &DomainKeyValuesFactory).unwrap().unwrap();
//! assert_eq!(loaded, color);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod transformer;

pub use config::{LoadStrategy, PersistenceConfig};
pub use engine::Persistence;
pub use error::{PersistenceError, PersistenceResult};
pub use transformer::{prepare_value, to_key_values, PreparedValue};
