use uuid::Uuid;

use crate::error::StoreResult;
use crate::query::Query;
use crate::row::Row;

/// A relational storage engine holding the key and value tables.
///
/// Implementations must satisfy these invariants:
/// - Read contexts see committed state only. They are short-lived and
///   released when dropped, on every exit path.
/// - A unit of work buffers its changes. Nothing becomes visible to readers
///   before [`WriteUnit::commit`], and a unit dropped without committing
///   leaves the store untouched.
/// - Commits are atomic: every buffered change applies, or none does.
/// - Referential constraints are checked at commit: value rows reference an
///   existing key, and `(key_id, pattern, change_set)` is unique.
pub trait Backend: Send + Sync {
    /// Open a read context.
    fn read(&self) -> StoreResult<Box<dyn ReadContext + '_>>;

    /// Open a unit of work.
    fn begin(&self) -> StoreResult<Box<dyn WriteUnit + '_>>;
}

/// Scoped read access to committed rows.
pub trait ReadContext {
    /// Run a row query.
    ///
    /// Returns `Ok(None)` when the backend cannot express the query.
    fn select(&self, query: &Query) -> StoreResult<Option<Vec<Row>>>;

    /// Run a count query. A well-formed count yields exactly one row.
    ///
    /// Returns `Ok(None)` when the backend cannot express the query.
    fn count(&self, query: &Query) -> StoreResult<Option<Vec<u64>>>;
}

/// A unit of work against the store.
///
/// Rows read through a [`ReadContext`] are *detached*: the unit does not
/// manage them until they are merged. Rows become managed when persisted or
/// merged through this unit.
pub trait WriteUnit {
    /// Identifier of this unit, for logs.
    fn id(&self) -> Uuid;

    /// Whether the row is managed by this unit.
    fn contains(&self, row: &Row) -> bool;

    /// Schedule an insert of a new row. The row becomes managed.
    fn persist(&mut self, row: Row) -> StoreResult<()>;

    /// Attach a row, scheduling its current state to be written. Returns the
    /// managed row.
    fn merge(&mut self, row: Row) -> StoreResult<Row>;

    /// Schedule deletion of a managed row.
    fn remove(&mut self, row: &Row) -> StoreResult<()>;

    /// Apply every scheduled change atomically.
    fn commit(self: Box<Self>) -> StoreResult<CommitSummary>;
}

/// What a commit applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}
