//! Transaction scope: one unit of work at a time, begun and ended explicitly.

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::row::Row;
use crate::traits::{Backend, CommitSummary, WriteUnit};

/// Lifecycle state of a [`TransactionScope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeState {
    Idle,
    Active,
}

/// Writes issued through a scope since its last `begin`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub persisted: usize,
    pub merged: usize,
    pub removed: usize,
}

impl WriteStats {
    pub fn total(&self) -> usize {
        self.persisted + self.merged + self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Stateful wrapper around a backend unit of work.
///
/// Not reentrant: a second `begin` while active fails. Use one scope per
/// in-flight operation.
pub struct TransactionScope<'a> {
    backend: &'a dyn Backend,
    unit: Option<Box<dyn WriteUnit + 'a>>,
    stats: WriteStats,
}

impl<'a> TransactionScope<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            unit: None,
            stats: WriteStats::default(),
        }
    }

    pub fn state(&self) -> ScopeState {
        if self.unit.is_some() {
            ScopeState::Active
        } else {
            ScopeState::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ScopeState::Active
    }

    /// Writes issued since the last `begin`. Still readable after `end`.
    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Open a unit of work.
    pub fn begin(&mut self) -> StoreResult<()> {
        if self.unit.is_some() {
            return Err(StoreError::TransactionAlreadyActive);
        }
        let unit = self.backend.begin()?;
        debug!(transaction = %unit.id(), "transaction begun");
        self.unit = Some(unit);
        self.stats = WriteStats::default();
        Ok(())
    }

    /// Commit the unit of work. The scope is idle afterwards even when the
    /// commit fails.
    pub fn end(&mut self) -> StoreResult<CommitSummary> {
        let unit = self.unit.take().ok_or(StoreError::NoActiveTransaction)?;
        let id = unit.id();
        let summary = unit.commit()?;
        debug!(
            transaction = %id,
            persisted = self.stats.persisted,
            merged = self.stats.merged,
            removed = self.stats.removed,
            "transaction ended"
        );
        Ok(summary)
    }

    /// Schedule an insert of a new row.
    pub fn persist_row(&mut self, row: impl Into<Row>) -> StoreResult<()> {
        self.unit_mut()?.persist(row.into())?;
        self.stats.persisted += 1;
        Ok(())
    }

    /// Schedule a write of the row's current state, returning the managed row.
    pub fn merge_row(&mut self, row: impl Into<Row>) -> StoreResult<Row> {
        let managed = self.unit_mut()?.merge(row.into())?;
        self.stats.merged += 1;
        Ok(managed)
    }

    /// Schedule deletion of a row, attaching it first when it was read
    /// outside this unit of work.
    pub fn remove_row(&mut self, row: impl Into<Row>) -> StoreResult<()> {
        let row = row.into();
        let unit = self.unit_mut()?;
        let managed = if unit.contains(&row) {
            row
        } else {
            unit.merge(row)?
        };
        unit.remove(&managed)?;
        self.stats.removed += 1;
        Ok(())
    }

    fn unit_mut(&mut self) -> StoreResult<&mut (dyn WriteUnit + 'a)> {
        self.unit.as_deref_mut().ok_or(StoreError::NoActiveTransaction)
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            warn!(
                transaction = %unit.id(),
                "transaction scope dropped while active; discarding unit of work"
            );
        }
    }
}

impl std::fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("state", &self.state())
            .field("stats", &self.stats)
            .finish()
    }
}
