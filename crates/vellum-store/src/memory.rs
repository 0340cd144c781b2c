//! In-memory relational backend.
//!
//! [`MemoryBackend`] keeps both tables in `BTreeMap`s behind a `RwLock`.
//! Units of work buffer [`Change`]s and apply them at commit against a
//! staged copy of the tables, so a failed constraint check leaves the
//! committed state untouched. With a journal attached, every committed batch
//! is appended to disk before it becomes visible, and reopening the journal
//! replays the batches.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, JournalConfig};
use crate::query::{Criterion, Field, Projection, Query, Table};
use crate::row::{KeyRow, Row, ValueId, ValueRow};
use crate::traits::{Backend, CommitSummary, ReadContext, WriteUnit};

/// A single buffered change, as recorded by a unit of work and the journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    InsertKey(KeyRow),
    /// Insert the key, or overwrite it if it exists.
    MergeKey(KeyRow),
    DeleteKey(String),
    /// Insert a value row. The id is assigned at commit when absent.
    InsertValue(ValueRow),
    UpdateValue(ValueRow),
    DeleteValue(ValueId),
}

/// A committed unit of work as written to the journal.
#[derive(Debug, Serialize, Deserialize)]
struct Batch {
    transaction: Uuid,
    changes: Vec<Change>,
}

#[derive(Clone, Debug)]
struct Tables {
    keys: BTreeMap<String, KeyRow>,
    values: BTreeMap<ValueId, ValueRow>,
    next_value_id: u64,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            keys: BTreeMap::new(),
            values: BTreeMap::new(),
            next_value_id: 1,
        }
    }
}

impl Tables {
    /// Apply a batch, assigning ids to new value rows in place, then check
    /// constraints for every key the batch touched.
    fn apply_all(&mut self, changes: &mut [Change]) -> StoreResult<CommitSummary> {
        let mut summary = CommitSummary::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut deleted_keys: BTreeSet<String> = BTreeSet::new();

        for change in changes.iter_mut() {
            match change {
                Change::InsertKey(row) => {
                    if self.keys.contains_key(&row.id) {
                        return Err(StoreError::PrimaryKeyViolation {
                            table: Table::Keys,
                            id: row.id.clone(),
                        });
                    }
                    touched.insert(row.id.clone());
                    self.keys.insert(row.id.clone(), row.clone());
                    summary.inserted += 1;
                }
                Change::MergeKey(row) => {
                    touched.insert(row.id.clone());
                    if self.keys.insert(row.id.clone(), row.clone()).is_some() {
                        summary.updated += 1;
                    } else {
                        summary.inserted += 1;
                    }
                }
                Change::DeleteKey(id) => {
                    if self.keys.remove(id.as_str()).is_none() {
                        return Err(StoreError::StaleRow {
                            table: Table::Keys,
                            identity: id.clone(),
                        });
                    }
                    touched.insert(id.clone());
                    deleted_keys.insert(id.clone());
                    summary.deleted += 1;
                }
                Change::InsertValue(row) => {
                    let id = match row.id {
                        Some(id) => {
                            if self.values.contains_key(&id) {
                                return Err(StoreError::PrimaryKeyViolation {
                                    table: Table::Values,
                                    id: id.to_string(),
                                });
                            }
                            id
                        }
                        None => ValueId(self.next_value_id),
                    };
                    self.next_value_id = self.next_value_id.max(id.0 + 1);
                    row.id = Some(id);
                    touched.insert(row.key_id.clone());
                    self.values.insert(id, row.clone());
                    summary.inserted += 1;
                }
                Change::UpdateValue(row) => {
                    let id = row.id.ok_or_else(|| {
                        StoreError::DetachedRow(Row::Value(row.clone()).describe())
                    })?;
                    let previous = self.values.insert(id, row.clone()).ok_or_else(|| {
                        StoreError::StaleRow {
                            table: Table::Values,
                            identity: id.to_string(),
                        }
                    })?;
                    touched.insert(previous.key_id);
                    touched.insert(row.key_id.clone());
                    summary.updated += 1;
                }
                Change::DeleteValue(id) => {
                    let previous = self.values.remove(&*id).ok_or_else(|| StoreError::StaleRow {
                        table: Table::Values,
                        identity: id.to_string(),
                    })?;
                    touched.insert(previous.key_id);
                    summary.deleted += 1;
                }
            }
        }

        self.check_constraints(&touched, &deleted_keys)?;
        Ok(summary)
    }

    fn check_constraints(
        &self,
        touched: &BTreeSet<String>,
        deleted_keys: &BTreeSet<String>,
    ) -> StoreResult<()> {
        for key in touched {
            let rows: Vec<(&ValueId, &ValueRow)> =
                self.values.iter().filter(|(_, v)| &v.key_id == key).collect();

            if !self.keys.contains_key(key) {
                if let Some((id, _)) = rows.first() {
                    let reason = if deleted_keys.contains(key) {
                        format!(
                            "key removed while {} value rows still reference it",
                            rows.len()
                        )
                    } else {
                        format!("value {id} references a missing key")
                    };
                    return Err(StoreError::ForeignKeyViolation {
                        key: key.clone(),
                        reason,
                    });
                }
                continue;
            }

            // NULL change sets count as equal here.
            let mut seen: HashMap<(&str, Option<&str>), ValueId> = HashMap::new();
            for (id, row) in rows {
                let identity = (row.pattern.as_str(), row.change_set.as_deref());
                if let Some(first) = seen.insert(identity, *id) {
                    return Err(StoreError::UniqueViolation {
                        key: key.clone(),
                        pattern: row.pattern.clone(),
                        change_set: row.change_set.clone(),
                        first,
                        second: *id,
                    });
                }
            }
        }
        Ok(())
    }
}

/// In-memory relational backend with optional journal-based durability.
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    journal: Option<Journal>,
    open_reads: AtomicUsize,
    commits: AtomicU64,
    applied_changes: AtomicU64,
}

impl MemoryBackend {
    /// Create a new empty, purely in-memory backend.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            journal: None,
            open_reads: AtomicUsize::new(0),
            commits: AtomicU64::new(0),
            applied_changes: AtomicU64::new(0),
        }
    }

    /// Open a journal-backed backend, replaying every committed batch.
    pub fn open(path: &Path, config: JournalConfig) -> StoreResult<Self> {
        let (journal, batches) = Journal::open::<Batch>(path, config)?;
        let mut tables = Tables::default();
        for (index, mut batch) in batches.into_iter().enumerate() {
            tables
                .apply_all(&mut batch.changes)
                .map_err(|e| StoreError::CorruptJournal {
                    entry: index,
                    reason: format!("replay of transaction {} failed: {e}", batch.transaction),
                })?;
        }
        info!(
            path = %path.display(),
            keys = tables.keys.len(),
            values = tables.values.len(),
            "backend restored from journal"
        );

        Ok(Self {
            tables: RwLock::new(tables),
            journal: Some(journal),
            open_reads: AtomicUsize::new(0),
            commits: AtomicU64::new(0),
            applied_changes: AtomicU64::new(0),
        })
    }

    /// Number of read contexts currently open.
    pub fn open_read_contexts(&self) -> usize {
        self.open_reads.load(Ordering::SeqCst)
    }

    /// Number of units of work committed since this backend was created.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of row changes applied by those commits.
    pub fn applied_changes(&self) -> u64 {
        self.applied_changes.load(Ordering::SeqCst)
    }

    pub fn key_count(&self) -> StoreResult<usize> {
        Ok(self.lock_read()?.keys.len())
    }

    pub fn value_count(&self) -> StoreResult<usize> {
        Ok(self.lock_read()?.values.len())
    }

    fn lock_read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(format!("tables: {e}")))
    }

    fn apply_batch(&self, transaction: Uuid, mut changes: Vec<Change>) -> StoreResult<CommitSummary> {
        if changes.is_empty() {
            self.commits.fetch_add(1, Ordering::SeqCst);
            debug!(%transaction, "empty commit");
            return Ok(CommitSummary::default());
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|e| StoreError::LockPoisoned(format!("tables: {e}")))?;
        let mut staged = tables.clone();
        let summary = staged.apply_all(&mut changes)?;

        if let Some(journal) = &self.journal {
            journal.append(&Batch {
                transaction,
                changes,
            })?;
        }
        *tables = staged;

        self.commits.fetch_add(1, Ordering::SeqCst);
        self.applied_changes.fetch_add(
            (summary.inserted + summary.updated + summary.deleted) as u64,
            Ordering::SeqCst,
        );
        debug!(
            %transaction,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            "commit applied"
        );
        Ok(summary)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("journal", &self.journal)
            .field("commits", &self.commits())
            .field("open_read_contexts", &self.open_read_contexts())
            .finish()
    }
}

impl Backend for MemoryBackend {
    fn read(&self) -> StoreResult<Box<dyn ReadContext + '_>> {
        let tables = self.lock_read()?;
        self.open_reads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReadContext {
            tables,
            open_reads: &self.open_reads,
        }))
    }

    fn begin(&self) -> StoreResult<Box<dyn WriteUnit + '_>> {
        let id = Uuid::now_v7();
        debug!(transaction = %id, "unit of work started");
        Ok(Box::new(MemoryWriteUnit {
            backend: self,
            id,
            changes: Vec::new(),
            managed_keys: HashSet::new(),
            managed_values: HashSet::new(),
        }))
    }
}

struct MemoryReadContext<'a> {
    tables: RwLockReadGuard<'a, Tables>,
    open_reads: &'a AtomicUsize,
}

impl Drop for MemoryReadContext<'_> {
    fn drop(&mut self) {
        self.open_reads.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Column value of a key row. `None` when the field is not a key column.
fn key_column(row: &KeyRow, field: Field) -> Option<Option<&str>> {
    match field {
        Field::KeyId => Some(Some(row.id.as_str())),
        Field::Description => Some(row.description.as_deref()),
        _ => None,
    }
}

/// Text column value of a value row. `None` when the field is not a text
/// column of the value table.
fn value_column(row: &ValueRow, field: Field) -> Option<Option<&str>> {
    match field {
        Field::ValueKey => Some(Some(row.key_id.as_str())),
        Field::Pattern => Some(Some(row.pattern.as_str())),
        Field::ChangeSet => Some(row.change_set.as_deref()),
        _ => None,
    }
}

/// Whether every criterion can be evaluated against the query's table.
fn supported(query: &Query) -> bool {
    query
        .criteria
        .iter()
        .all(|c| c.field().table() == query.table && c.field().is_text())
}

fn all_match<'r>(criteria: &[Criterion], column: impl Fn(Field) -> Option<Option<&'r str>>) -> bool {
    criteria
        .iter()
        .all(|c| column(c.field()).is_some_and(|value| c.matches(value)))
}

impl MemoryReadContext<'_> {
    fn matching(&self, query: &Query) -> Vec<Row> {
        match query.table {
            Table::Keys => self
                .tables
                .keys
                .values()
                .filter(|row| all_match(&query.criteria, |f| key_column(row, f)))
                .cloned()
                .map(Row::Key)
                .collect(),
            Table::Values => self
                .tables
                .values
                .values()
                .filter(|row| all_match(&query.criteria, |f| value_column(row, f)))
                .cloned()
                .map(Row::Value)
                .collect(),
        }
    }
}

impl ReadContext for MemoryReadContext<'_> {
    fn select(&self, query: &Query) -> StoreResult<Option<Vec<Row>>> {
        if query.projection != Projection::Rows || !supported(query) {
            return Ok(None);
        }
        Ok(Some(self.matching(query)))
    }

    fn count(&self, query: &Query) -> StoreResult<Option<Vec<u64>>> {
        if query.projection != Projection::Count || !supported(query) {
            return Ok(None);
        }
        Ok(Some(vec![self.matching(query).len() as u64]))
    }
}

struct MemoryWriteUnit<'a> {
    backend: &'a MemoryBackend,
    id: Uuid,
    changes: Vec<Change>,
    managed_keys: HashSet<String>,
    managed_values: HashSet<ValueId>,
}

impl WriteUnit for MemoryWriteUnit<'_> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn contains(&self, row: &Row) -> bool {
        match row {
            Row::Key(k) => self.managed_keys.contains(&k.id),
            Row::Value(v) => v.id.is_some_and(|id| self.managed_values.contains(&id)),
        }
    }

    fn persist(&mut self, row: Row) -> StoreResult<()> {
        match row {
            Row::Key(k) => {
                self.managed_keys.insert(k.id.clone());
                self.changes.push(Change::InsertKey(k));
            }
            Row::Value(v) => {
                if v.is_persisted() {
                    return Err(StoreError::DetachedRow(format!(
                        "{} is already persisted; merge it instead",
                        Row::Value(v).describe()
                    )));
                }
                self.changes.push(Change::InsertValue(v));
            }
        }
        Ok(())
    }

    fn merge(&mut self, row: Row) -> StoreResult<Row> {
        match &row {
            Row::Key(k) => {
                self.managed_keys.insert(k.id.clone());
                self.changes.push(Change::MergeKey(k.clone()));
            }
            Row::Value(v) => match v.id {
                Some(id) => {
                    self.managed_values.insert(id);
                    self.changes.push(Change::UpdateValue(v.clone()));
                }
                None => self.changes.push(Change::InsertValue(v.clone())),
            },
        }
        Ok(row)
    }

    fn remove(&mut self, row: &Row) -> StoreResult<()> {
        if !self.contains(row) {
            return Err(StoreError::DetachedRow(row.describe()));
        }
        match row {
            Row::Key(k) => {
                self.managed_keys.remove(&k.id);
                self.changes.push(Change::DeleteKey(k.id.clone()));
            }
            Row::Value(v) => {
                // `contains` guarantees the id.
                if let Some(id) = v.id {
                    self.managed_values.remove(&id);
                    self.changes.push(Change::DeleteValue(id));
                }
            }
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<CommitSummary> {
        let MemoryWriteUnit {
            backend,
            id,
            changes,
            ..
        } = *self;
        backend.apply_batch(id, changes)
    }
}
