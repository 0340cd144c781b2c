//! Read accessors over the key and value tables.
//!
//! Every call opens its own read context and drops it before returning, on
//! success and on error alike. Accessors never mutate; writes go through a
//! [`TransactionScope`](crate::TransactionScope).

use std::sync::Arc;

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::query::{Criterion, Field, Query, Table};
use crate::row::{KeyRow, Row, ValueRow};
use crate::traits::Backend;

fn select(backend: &dyn Backend, query: &Query) -> StoreResult<Vec<Row>> {
    let ctx = backend.read()?;
    ctx.select(query)?
        .ok_or_else(|| StoreError::NoTypedQuery(query.to_string()))
}

fn key_rows(rows: Vec<Row>, query: &Query) -> StoreResult<Vec<KeyRow>> {
    rows.into_iter()
        .map(|row| match row {
            Row::Key(k) => Ok(k),
            other => Err(StoreError::InvalidQuery(format!(
                "{query} returned {}",
                other.describe()
            ))),
        })
        .collect()
}

fn value_rows(rows: Vec<Row>, query: &Query) -> StoreResult<Vec<ValueRow>> {
    rows.into_iter()
        .map(|row| match row {
            Row::Value(v) => Ok(v),
            other => Err(StoreError::InvalidQuery(format!(
                "{query} returned {}",
                other.describe()
            ))),
        })
        .collect()
}

/// Collapse a result set that may hold at most one row.
fn at_most_one<T>(mut rows: Vec<T>, table: Table, identity: impl FnOnce() -> String) -> StoreResult<Option<T>> {
    match rows.len() {
        0 | 1 => Ok(rows.pop()),
        found => Err(StoreError::MultipleResults {
            table,
            identity: identity(),
            found,
        }),
    }
}

/// Accessor for the key table.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn Backend>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// The key row with this id, if any.
    pub fn find_key(&self, id: &str) -> StoreResult<Option<KeyRow>> {
        let query = Query::equality(Table::Keys, vec![Criterion::equals(Field::KeyId, id)])?;
        let rows = key_rows(select(self.backend.as_ref(), &query)?, &query)?;
        at_most_one(rows, Table::Keys, || format!("id '{id}'"))
    }

    /// Every key row, in no particular order.
    pub fn find_all_keys(&self) -> StoreResult<Vec<KeyRow>> {
        let query = Query::all(Table::Keys);
        key_rows(select(self.backend.as_ref(), &query)?, &query)
    }

    /// Ids of keys containing `fragment`, ignoring case.
    pub fn find_keys_by_substring(&self, fragment: &str) -> StoreResult<Vec<String>> {
        let query = Query::likeness(Table::Keys, vec![Criterion::contains(Field::KeyId, fragment)])?;
        let ids: Vec<String> = key_rows(select(self.backend.as_ref(), &query)?, &query)?
            .into_iter()
            .map(|k| k.id)
            .collect();
        debug!(fragment, found = ids.len(), "keys found by substring");
        Ok(ids)
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

/// Accessor for the value table.
#[derive(Clone)]
pub struct ValueStore {
    backend: Arc<dyn Backend>,
}

impl ValueStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// All value rows of a key, in no particular order.
    pub fn find_values(&self, key_id: &str) -> StoreResult<Vec<ValueRow>> {
        let query = Query::equality(Table::Values, vec![Criterion::equals(Field::ValueKey, key_id)])?;
        value_rows(select(self.backend.as_ref(), &query)?, &query)
    }

    /// The value row with this logical identity, if any.
    ///
    /// `change_set_sentinel` is the change set with "none" normalized to
    /// `""`; a stored NULL change set compares equal to `""`.
    pub fn find_value(
        &self,
        key_id: &str,
        pattern: &str,
        change_set_sentinel: &str,
    ) -> StoreResult<Option<ValueRow>> {
        let query = Query::equality(
            Table::Values,
            vec![
                Criterion::equals(Field::ValueKey, key_id),
                Criterion::equals(Field::Pattern, pattern),
                Criterion::equals_coalesced(Field::ChangeSet, "", change_set_sentinel),
            ],
        )?;
        let rows = value_rows(select(self.backend.as_ref(), &query)?, &query)?;
        at_most_one(rows, Table::Values, || {
            format!("key '{key_id}', pattern '{pattern}', change set '{change_set_sentinel}'")
        })
    }

    /// Number of value rows of a key.
    pub fn count_values(&self, key_id: &str) -> StoreResult<u64> {
        let query = Query::count(Table::Values, vec![Criterion::equals(Field::ValueKey, key_id)]);
        let ctx = self.backend.read()?;
        let counts = ctx
            .count(&query)?
            .ok_or_else(|| StoreError::NoTypedQuery(query.to_string()))?;
        at_most_one(counts, Table::Values, || format!("count of key '{key_id}'"))?.ok_or_else(|| {
            StoreError::MissingCount {
                key: key_id.to_string(),
            }
        })
    }
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore").finish_non_exhaustive()
    }
}
