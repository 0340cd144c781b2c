//! Relational row storage for Vellum.
//!
//! Two tables back every configuration key: the key table (id, description)
//! and the value table (one row per value variant, identified within a key
//! by pattern and change set). This crate holds the row model and everything
//! needed to read and write it, without any knowledge of how rows relate to
//! the in-memory aggregate.
//!
//! # Layers
//!
//! - [`ValueCodec`] -- which payloads the value column accepts
//! - [`Query`] / [`Criterion`] -- store-agnostic predicates
//! - [`Backend`] -- the storage engine seam; [`MemoryBackend`] implements it
//!   with constraint checks and an optional [`Journal`]
//! - [`KeyStore`] / [`ValueStore`] -- read accessors
//! - [`TransactionScope`] -- begin/end wrapper around a unit of work
//!
//! # Design Rules
//!
//! 1. Reads never hold a write lock; read contexts are released on drop.
//! 2. Nothing written through a unit of work is visible before commit.
//! 3. Commits are all-or-nothing and checked against the table constraints.
//! 4. A stored NULL change set is never replaced by a sentinel; the `""`
//!    sentinel exists only inside identity lookups.

pub mod accessor;
pub mod codec;
pub mod error;
pub mod journal;
pub mod memory;
pub mod query;
pub mod row;
pub mod traits;
pub mod transaction;

pub use accessor::{KeyStore, ValueStore};
pub use codec::{CodecConfig, ValueCodec};
pub use error::{StoreError, StoreResult};
pub use journal::{Journal, JournalConfig, SyncMode};
pub use memory::{Change, MemoryBackend};
pub use query::{escape_like, like_matches, Criterion, Field, Projection, Query, Table};
pub use row::{EncodedValue, KeyRow, Row, ValueId, ValueRow};
pub use traits::{Backend, CommitSummary, ReadContext, WriteUnit};
pub use transaction::{ScopeState, TransactionScope, WriteStats};
