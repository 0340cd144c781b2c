//! The reconciliation engine.
//!
//! [`Persistence`] loads key aggregates from the relational store and writes
//! them back by diffing each aggregate against the stored rows. Every public
//! operation runs in exactly one [`TransactionScope`] and ends it before
//! returning. Validation failures end the scope first and then raise, so the
//! unit of work is always released.
//!
//! Invariant: a stored key has at least one value row. `load` and
//! `load_all` treat a violation as corruption; `reload` treats a key that
//! disappeared between snapshots as expected drift and drops it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vellum_store::{
    Backend, KeyRow, KeyStore, TransactionScope, ValueCodec, ValueRow, ValueStore, WriteStats,
};
use vellum_types::{
    change_set_sentinel, is_nil, null_when_empty, DomainValue, KeyValues, KeyValuesFactory, Value,
};

use crate::config::{LoadStrategy, PersistenceConfig};
use crate::error::{PersistenceError, PersistenceResult};
use crate::transformer::{prepare_value, to_key_values, PreparedValue};

/// Persistence engine over a relational [`Backend`].
pub struct Persistence {
    backend: Arc<dyn Backend>,
    keys: KeyStore,
    values: ValueStore,
    codec: ValueCodec,
    config: PersistenceConfig,
}

impl Persistence {
    pub fn new(backend: Arc<dyn Backend>, config: PersistenceConfig) -> Self {
        Self {
            keys: KeyStore::new(backend.clone()),
            values: ValueStore::new(backend.clone()),
            codec: ValueCodec::new(config.codec.clone()),
            backend,
            config,
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Load the aggregate of one key.
    ///
    /// Returns `None` when the key is not stored. A stored key without value
    /// rows is [`PersistenceError::InconsistentStore`].
    pub fn load<F: KeyValuesFactory>(
        &self,
        key: &str,
        factory: &F,
    ) -> PersistenceResult<Option<F::KeyValues>> {
        validate_key(key)?;
        let Some(key_row) = self.keys.find_key(key)? else {
            debug!(key, "key not stored");
            return Ok(None);
        };

        let rows = self.values.find_values(key)?;
        if rows.is_empty() {
            return Err(PersistenceError::InconsistentStore {
                key: key.to_string(),
            });
        }
        debug!(key, values = rows.len(), "key loaded");
        to_key_values(&rows, key_row.description.as_deref(), factory, &self.codec)
    }

    /// Load every stored key.
    ///
    /// Strict: a listed key that then loads as absent or without values
    /// fails the whole call. Under [`LoadStrategy::Lazy`] the store is not
    /// read and the map is empty.
    pub fn load_all<F: KeyValuesFactory>(
        &self,
        factory: &F,
    ) -> PersistenceResult<HashMap<String, F::KeyValues>> {
        if self.config.load_strategy == LoadStrategy::Lazy {
            debug!("lazy load strategy; skipping bulk load");
            return Ok(HashMap::new());
        }

        let key_rows = self.keys.find_all_keys()?;
        let mut loaded = HashMap::with_capacity(key_rows.len());
        for key_row in key_rows {
            let key_values = self.load(&key_row.id, factory)?.ok_or_else(|| {
                PersistenceError::InconsistentStore {
                    key: key_row.id.clone(),
                }
            })?;
            loaded.insert(key_row.id, key_values);
        }
        info!(keys = loaded.len(), "all keys loaded");
        Ok(loaded)
    }

    /// Reload the keys of an existing snapshot.
    ///
    /// Lenient: keys that are gone, or left without values, are omitted.
    /// Under [`LoadStrategy::Lazy`] the store is not read and the map is
    /// empty.
    pub fn reload<F: KeyValuesFactory, V>(
        &self,
        existing: &HashMap<String, V>,
        factory: &F,
    ) -> PersistenceResult<HashMap<String, F::KeyValues>> {
        if self.config.load_strategy == LoadStrategy::Lazy {
            debug!("lazy load strategy; skipping reload");
            return Ok(HashMap::new());
        }

        let mut reloaded = HashMap::with_capacity(existing.len());
        for key in existing.keys() {
            match self.load(key, factory) {
                Ok(Some(key_values)) => {
                    reloaded.insert(key.clone(), key_values);
                }
                Ok(None) => debug!(key = %key, "key removed since last snapshot"),
                Err(PersistenceError::InconsistentStore { key }) => {
                    warn!(key = %key, "key has no values; omitted from reload")
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            requested = existing.len(),
            reloaded = reloaded.len(),
            "keys reloaded"
        );
        Ok(reloaded)
    }

    /// Write the variants of `key_values` tagged with `change_set`.
    ///
    /// New variants are inserted, changed ones updated in place, unchanged
    /// ones skipped. Variants of other change sets are left alone. The key
    /// row is created on first store and its description is never updated.
    pub fn store<K: KeyValues + ?Sized>(
        &self,
        key: &str,
        key_values: &K,
        change_set: Option<&str>,
    ) -> PersistenceResult<WriteStats> {
        validate_key(key)?;
        let change_set = null_when_empty(change_set);
        let sentinel = change_set_sentinel(change_set);

        let mut scope = TransactionScope::new(self.backend.as_ref());
        scope.begin()?;

        let variants = match key_values.domain_values() {
            None => {
                return end_with(
                    &mut scope,
                    PersistenceError::NullValues {
                        key: key.to_string(),
                        description: key_values.description().map(str::to_string),
                    },
                )
            }
            Some(v) if v.is_empty() => {
                return end_with(
                    &mut scope,
                    PersistenceError::EmptyValues {
                        key: key.to_string(),
                        description: key_values.description().map(str::to_string),
                    },
                )
            }
            Some(v) => v,
        };

        // Validate every variant of this change set before writing anything.
        let mut prepared: BTreeMap<String, PreparedValue> = BTreeMap::new();
        for variant in variants.iter().filter(|v| v.change_set_is(change_set)) {
            match prepare_value(key, variant, &self.codec) {
                Ok(p) => {
                    prepared.insert(p.pattern.clone(), p);
                }
                Err(e) => return end_with(&mut scope, e),
            }
        }

        if prepared.is_empty() {
            debug!(key, change_set = sentinel, "no variants for change set; nothing to store");
            scope.end()?;
            return Ok(scope.stats());
        }

        if self.keys.find_key(key)?.is_none() {
            scope.persist_row(KeyRow::new(
                key,
                key_values.description().map(str::to_string),
            ))?;
            info!(key, "key created");
        }

        for PreparedValue { pattern, value } in prepared.into_values() {
            match self.values.find_value(key, &pattern, sentinel)? {
                None => {
                    debug!(key, pattern = %pattern, change_set = sentinel, "value inserted");
                    scope.persist_row(ValueRow::new(
                        key,
                        pattern,
                        value,
                        change_set.map(str::to_string),
                    ))?;
                }
                Some(mut row) => {
                    let mut dirty = false;
                    if row.change_set.as_deref() != change_set {
                        row.change_set = change_set.map(str::to_string);
                        dirty = true;
                    }
                    if row.value != value {
                        row.value = value;
                        dirty = true;
                    }
                    if dirty {
                        debug!(key, pattern = %pattern, id = ?row.id, "value updated");
                        scope.merge_row(row)?;
                    } else {
                        debug!(key, pattern = %pattern, "value unchanged");
                    }
                }
            }
        }

        scope.end()?;
        Ok(scope.stats())
    }

    /// Remove variants of a key, or the whole key when `key_values` is
    /// `None`.
    ///
    /// Every stored row whose pattern and value match a requested variant is
    /// removed. When as many rows were removed as variants were requested,
    /// the key row is removed as well. `change_set` does not take part in
    /// matching.
    ///
    /// Only removal of every stored variant completes cleanly. Removing a
    /// strict subset one row per variant schedules the key row while other
    /// values still reference it, so the commit fails with
    /// [`ForeignKeyViolation`](vellum_store::StoreError::ForeignKeyViolation)
    /// and nothing changes. A variant matching rows in several change sets
    /// removes all of them and keeps the key row, which can leave the key
    /// without values; a later `load` then fails with
    /// [`PersistenceError::InconsistentStore`].
    pub fn remove<K: KeyValues + ?Sized>(
        &self,
        key: &str,
        key_values: Option<&K>,
        change_set: Option<&str>,
    ) -> PersistenceResult<WriteStats> {
        validate_key(key)?;
        let mut scope = TransactionScope::new(self.backend.as_ref());
        scope.begin()?;

        let Some(key_row) = self.keys.find_key(key)? else {
            debug!(key, "key not stored; nothing to remove");
            scope.end()?;
            return Ok(scope.stats());
        };

        let rows = self.values.find_values(key)?;
        if rows.is_empty() {
            return end_with(
                &mut scope,
                PersistenceError::InconsistentStore {
                    key: key.to_string(),
                },
            );
        }

        let Some(key_values) = key_values else {
            let removed = rows.len();
            for row in rows {
                scope.remove_row(row)?;
            }
            scope.remove_row(key_row)?;
            info!(key, values = removed, "key removed");
            scope.end()?;
            return Ok(scope.stats());
        };

        let variants = match key_values.domain_values() {
            None => {
                return end_with(
                    &mut scope,
                    PersistenceError::NullValues {
                        key: key.to_string(),
                        description: key_values.description().map(str::to_string),
                    },
                )
            }
            Some(v) if v.is_empty() => {
                return end_with(
                    &mut scope,
                    PersistenceError::EmptyValues {
                        key: key.to_string(),
                        description: key_values.description().map(str::to_string),
                    },
                )
            }
            Some(v) => v,
        };

        let mut remaining: Vec<(ValueRow, Option<Value>)> = Vec::with_capacity(rows.len());
        for row in rows {
            let value = self.codec.decode(row.value.as_ref())?;
            remaining.push((row, value));
        }

        let mut removed = 0;
        for variant in &variants {
            let (matched, rest): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|(row, value)| matches_variant(row, value.as_ref(), variant));
            remaining = rest;
            for (row, _) in matched {
                debug!(key, pattern = %row.pattern, id = ?row.id, "value removed");
                scope.remove_row(row)?;
                removed += 1;
            }
        }

        if removed == variants.len() {
            scope.remove_row(key_row)?;
            info!(key, values = removed, "key removed with its last requested values");
        }
        debug!(
            key,
            change_set = change_set_sentinel(null_when_empty(change_set)),
            requested = variants.len(),
            removed,
            "values removed"
        );
        scope.end()?;
        Ok(scope.stats())
    }

    /// Remove a single variant of a key, identified by its pattern and
    /// `change_set`. The key row goes with it when it was the key's only
    /// value.
    pub fn remove_value(
        &self,
        key: &str,
        variant: &DomainValue,
        change_set: Option<&str>,
    ) -> PersistenceResult<WriteStats> {
        validate_key(key)?;
        let mut scope = TransactionScope::new(self.backend.as_ref());
        scope.begin()?;

        let Some(key_row) = self.keys.find_key(key)? else {
            debug!(key, "key not stored; nothing to remove");
            scope.end()?;
            return Ok(scope.stats());
        };

        let count = self.values.count_values(key)?;

        if is_nil(variant.value()) {
            return end_with(
                &mut scope,
                PersistenceError::MissingValue {
                    key: key.to_string(),
                },
            );
        }
        if let Err(e) = self.codec.assert_storable(variant.value()) {
            return end_with(&mut scope, e.into());
        }
        let Some(pattern) = variant.pattern_str() else {
            return end_with(
                &mut scope,
                PersistenceError::MissingPattern {
                    key: key.to_string(),
                },
            );
        };

        let sentinel = change_set_sentinel(null_when_empty(change_set));
        let Some(row) = self.values.find_value(key, pattern, sentinel)? else {
            debug!(key, pattern, change_set = sentinel, "value already gone");
            scope.end()?;
            return Ok(scope.stats());
        };

        debug!(key, pattern, id = ?row.id, "value removed");
        scope.remove_row(row)?;
        if count == 1 {
            scope.remove_row(key_row)?;
            info!(key, "key removed with its last value");
        }
        scope.end()?;
        Ok(scope.stats())
    }

    /// Ids of stored keys containing `fragment`, ignoring case.
    pub fn find_keys(&self, fragment: &str) -> PersistenceResult<Vec<String>> {
        Ok(self.keys.find_keys_by_substring(fragment)?)
    }

    /// Ids of every stored key.
    pub fn all_keys(&self) -> PersistenceResult<Vec<String>> {
        Ok(self
            .keys
            .find_all_keys()?
            .into_iter()
            .map(|k| k.id)
            .collect())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_key(key: &str) -> PersistenceResult<()> {
    if key.trim().is_empty() {
        return Err(PersistenceError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// End the scope, then fail with `err`.
fn end_with<T>(scope: &mut TransactionScope<'_>, err: PersistenceError) -> PersistenceResult<T> {
    scope.end()?;
    Err(err)
}

fn matches_variant(row: &ValueRow, stored: Option<&Value>, variant: &DomainValue) -> bool {
    if variant.pattern_str() != Some(row.pattern.as_str()) {
        return false;
    }
    match (is_nil(stored), is_nil(variant.value())) {
        (true, true) => true,
        (false, false) => stored == variant.value(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vellum_store::{
        CodecConfig, CommitSummary, JournalConfig, MemoryBackend, Query, ReadContext, Row,
        StoreError, StoreResult, SyncMode, WriteUnit,
    };
    use vellum_types::{DomainKeyValues, DomainKeyValuesFactory, TypeError};

    const F: DomainKeyValuesFactory = DomainKeyValuesFactory;

    fn engine() -> (Arc<MemoryBackend>, Persistence) {
        let backend = Arc::new(MemoryBackend::new());
        let engine = Persistence::new(backend.clone(), PersistenceConfig::default());
        (backend, engine)
    }

    fn color() -> DomainKeyValues {
        let mut kv = DomainKeyValues::with_description("Main color");
        kv.put(Some(json!("red")), &[]).unwrap();
        kv.put(Some(json!("blue")), &["de"]).unwrap();
        kv.put(Some(json!("green")), &["de", "mobile"]).unwrap();
        kv
    }

    fn single(pattern: &[&str], value: Value) -> DomainKeyValues {
        let mut kv = DomainKeyValues::new();
        kv.put(Some(value), pattern).unwrap();
        kv
    }

    /// Delete every value row of a key behind the engine's back.
    fn delete_values_out_of_band(backend: &Arc<MemoryBackend>, key: &str) {
        let rows = ValueStore::new(backend.clone()).find_values(key).unwrap();
        let mut unit = backend.begin().unwrap();
        for row in rows {
            let managed = unit.merge(row.into()).unwrap();
            unit.remove(&managed).unwrap();
        }
        unit.commit().unwrap();
    }

    // -----------------------------------------------------------------------
    // load
    // -----------------------------------------------------------------------

    #[test]
    fn load_missing_key_is_none() {
        let (_, engine) = engine();
        assert!(engine.load("color", &F).unwrap().is_none());
    }

    #[test]
    fn store_then_load_round_trips() {
        let (_, engine) = engine();
        let stats = engine.store("color", &color(), None).unwrap();
        assert_eq!(stats.persisted, 4);

        let loaded = engine.load("color", &F).unwrap().unwrap();
        assert_eq!(loaded, color());
        assert_eq!(loaded.description(), Some("Main color"));
    }

    #[test]
    fn example_color_scenario() {
        let (backend, engine) = engine();
        let kv = single(&[], json!("red"));
        engine.store("color", &kv, None).unwrap();

        let loaded = engine.load("color", &F).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        let variant = loaded.get("", None).unwrap();
        assert_eq!(variant.value(), Some(&json!("red")));
        assert_eq!(variant.change_set(), None);

        engine.remove_value("color", variant, None).unwrap();
        assert!(engine.load("color", &F).unwrap().is_none());
        assert_eq!(backend.key_count().unwrap(), 0);
        assert_eq!(backend.value_count().unwrap(), 0);
    }

    #[test]
    fn key_without_values_is_inconsistent() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();
        delete_values_out_of_band(&backend, "color");

        let err = engine.load("color", &F).unwrap_err();
        assert!(matches!(err, PersistenceError::InconsistentStore { ref key } if key == "color"));
    }

    #[test]
    fn blank_keys_are_rejected() {
        let (backend, engine) = engine();
        for key in ["", "   "] {
            assert!(matches!(engine.load(key, &F), Err(PersistenceError::InvalidKey(_))));
            assert!(matches!(
                engine.store(key, &color(), None),
                Err(PersistenceError::InvalidKey(_))
            ));
            assert!(matches!(
                engine.remove::<DomainKeyValues>(key, None, None),
                Err(PersistenceError::InvalidKey(_))
            ));
        }
        assert_eq!(backend.commits(), 0);
    }

    // -----------------------------------------------------------------------
    // load_all / reload
    // -----------------------------------------------------------------------

    #[test]
    fn load_all_loads_every_key() {
        let (_, engine) = engine();
        engine.store("color", &color(), None).unwrap();
        engine.store("size", &single(&[], json!(12)), None).unwrap();

        let all = engine.load_all(&F).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["size"].get("", None).unwrap().value(), Some(&json!(12)));
    }

    #[test]
    fn load_all_is_strict_and_reload_is_lenient() {
        let (backend, engine) = engine();
        engine.store("A", &single(&[], json!("a")), None).unwrap();
        engine.store("B", &single(&[], json!("b")), None).unwrap();
        let snapshot = engine.load_all(&F).unwrap();

        delete_values_out_of_band(&backend, "B");

        let err = engine.load_all(&F).unwrap_err();
        assert!(matches!(err, PersistenceError::InconsistentStore { ref key } if key == "B"));

        let reloaded = engine.reload(&snapshot, &F).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains_key("A"));
    }

    #[test]
    fn reload_omits_removed_keys() {
        let (_, engine) = engine();
        engine.store("A", &single(&[], json!("a")), None).unwrap();
        engine.store("B", &single(&[], json!("b")), None).unwrap();
        let snapshot = engine.load_all(&F).unwrap();

        engine.remove::<DomainKeyValues>("B", None, None).unwrap();
        engine.store("A", &single(&[], json!("a2")), None).unwrap();

        let reloaded = engine.reload(&snapshot, &F).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded["A"].get("", None).unwrap().value(), Some(&json!("a2")));
    }

    #[test]
    fn lazy_strategy_skips_bulk_loads() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = Persistence::new(backend.clone(), PersistenceConfig::lazy());
        engine.store("color", &color(), None).unwrap();

        assert!(engine.load_all(&F).unwrap().is_empty());
        let snapshot: HashMap<String, ()> = [("color".to_string(), ())].into_iter().collect();
        assert!(engine.reload(&snapshot, &F).unwrap().is_empty());
        // Single loads are unaffected.
        assert!(engine.load("color", &F).unwrap().is_some());
    }

    // -----------------------------------------------------------------------
    // store
    // -----------------------------------------------------------------------

    #[test]
    fn second_identical_store_writes_nothing() {
        let (backend, engine) = engine();
        let first = engine.store("color", &color(), None).unwrap();
        assert_eq!(first.persisted, 4);

        let applied = backend.applied_changes();
        let second = engine.store("color", &color(), None).unwrap();
        assert!(second.is_empty(), "expected no writes, got {second:?}");
        assert_eq!(backend.applied_changes(), applied);
    }

    #[test]
    fn changed_value_is_updated_in_place() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let mut changed = color();
        changed.put(Some(json!("black")), &["de"]).unwrap();
        let stats = engine.store("color", &changed, None).unwrap();
        assert_eq!(stats, WriteStats { persisted: 0, merged: 1, removed: 0 });
        assert_eq!(backend.value_count().unwrap(), 3);

        let loaded = engine.load("color", &F).unwrap().unwrap();
        assert_eq!(loaded.get("de", None).unwrap().value(), Some(&json!("black")));
    }

    #[test]
    fn nil_value_is_stored_as_null() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let mut cleared = color();
        cleared.put(None, &["de"]).unwrap();
        let stats = engine.store("color", &cleared, None).unwrap();
        assert_eq!(stats.merged, 1);

        let row = ValueStore::new(backend.clone()).find_value("color", "de", "").unwrap().unwrap();
        assert_eq!(row.value, None);
        let loaded = engine.load("color", &F).unwrap().unwrap();
        assert_eq!(loaded.get("de", None).unwrap().value(), None);
    }

    #[test]
    fn store_round_trip_reproduces_rows() {
        let (backend, engine) = engine();
        let mut kv = color();
        kv.put_with_change_set("summer", Some(json!("yellow")), &["de"]).unwrap();
        engine.store("color", &kv, None).unwrap();
        engine.store("color", &kv, Some("summer")).unwrap();
        let rows_before = ValueStore::new(backend.clone()).find_values("color").unwrap();

        let loaded = engine.load("color", &F).unwrap().unwrap();
        let again = engine.store("color", &loaded, None).unwrap();
        let again_summer = engine.store("color", &loaded, Some("summer")).unwrap();
        assert!(again.is_empty());
        assert!(again_summer.is_empty());

        let mut rows_after = ValueStore::new(backend.clone()).find_values("color").unwrap();
        let mut rows_before = rows_before;
        rows_before.sort_by_key(|r| r.id);
        rows_after.sort_by_key(|r| r.id);
        assert_eq!(rows_before, rows_after);
        assert_eq!(rows_after.len(), 4);
    }

    #[test]
    fn store_only_touches_its_change_set() {
        let (backend, engine) = engine();
        let mut kv = single(&["de"], json!("red"));
        kv.put_with_change_set("summer", Some(json!("yellow")), &["de"]).unwrap();

        let stats = engine.store("color", &kv, None).unwrap();
        assert_eq!(stats.persisted, 2, "key row and the unscoped variant");
        assert_eq!(backend.value_count().unwrap(), 1);

        let stats = engine.store("color", &kv, Some("summer")).unwrap();
        assert_eq!(stats.persisted, 1);

        let values = ValueStore::new(backend.clone());
        let summer = values.find_value("color", "de", "summer").unwrap().unwrap();
        assert_eq!(summer.change_set.as_deref(), Some("summer"));
        let plain = values.find_value("color", "de", "").unwrap().unwrap();
        assert_eq!(plain.change_set, None);
    }

    #[test]
    fn empty_change_set_label_means_none() {
        let (backend, engine) = engine();
        engine.store("color", &color(), Some("")).unwrap();
        let rows = ValueStore::new(backend.clone()).find_values("color").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.change_set.is_none()));
        assert!(engine.store("color", &color(), None).unwrap().is_empty());
    }

    #[test]
    fn description_is_set_only_on_creation() {
        let (_, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let mut renamed = color();
        renamed.set_description(Some("Other".into()));
        engine.store("color", &renamed, None).unwrap();

        let loaded = engine.load("color", &F).unwrap().unwrap();
        assert_eq!(loaded.description(), Some("Main color"));
    }

    #[test]
    fn store_without_variants_for_change_set_creates_nothing() {
        let (backend, engine) = engine();
        let mut kv = DomainKeyValues::new();
        kv.put_with_change_set("summer", Some(json!("yellow")), &[]).unwrap();

        let stats = engine.store("color", &kv, None).unwrap();
        assert!(stats.is_empty());
        assert_eq!(backend.key_count().unwrap(), 0);
    }

    // Aggregate that carries no variant set at all.
    struct NoVariants;

    impl KeyValues for NoVariants {
        fn description(&self) -> Option<&str> {
            Some("nothing here")
        }
        fn set_description(&mut self, _description: Option<String>) {}
        fn domain_values(&self) -> Option<Vec<DomainValue>> {
            None
        }
        fn put(&mut self, _value: Option<Value>, _parts: &[&str]) -> Result<(), TypeError> {
            Ok(())
        }
        fn put_with_change_set(
            &mut self,
            _change_set: &str,
            _value: Option<Value>,
            _parts: &[&str],
        ) -> Result<(), TypeError> {
            Ok(())
        }
    }

    // Aggregate with a fixed, possibly malformed, variant list.
    struct FixedVariants(Vec<DomainValue>);

    impl KeyValues for FixedVariants {
        fn description(&self) -> Option<&str> {
            None
        }
        fn set_description(&mut self, _description: Option<String>) {}
        fn domain_values(&self) -> Option<Vec<DomainValue>> {
            Some(self.0.clone())
        }
        fn put(&mut self, value: Option<Value>, parts: &[&str]) -> Result<(), TypeError> {
            self.0.push(DomainValue::new(parts, value)?);
            Ok(())
        }
        fn put_with_change_set(
            &mut self,
            change_set: &str,
            value: Option<Value>,
            parts: &[&str],
        ) -> Result<(), TypeError> {
            self.0.push(DomainValue::with_change_set(change_set, parts, value)?);
            Ok(())
        }
    }

    #[test]
    fn store_rejects_missing_or_empty_variant_sets() {
        let (backend, engine) = engine();

        let err = engine.store("color", &NoVariants, None).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::NullValues { ref description, .. } if description.as_deref() == Some("nothing here")
        ));

        let err = engine.store("color", &DomainKeyValues::new(), None).unwrap_err();
        assert!(matches!(err, PersistenceError::EmptyValues { .. }));

        assert_eq!(backend.key_count().unwrap(), 0);
        // Each failure still ended its transaction.
        assert_eq!(backend.commits(), 2);
    }

    #[test]
    fn store_rejects_variant_without_pattern() {
        let (backend, engine) = engine();
        let kv = FixedVariants(vec![
            DomainValue::from_pattern("de", Some(json!("red")), None),
            DomainValue::unscoped(Some(json!("blue")), None),
        ]);
        let err = engine.store("color", &kv, None).unwrap_err();
        assert!(matches!(err, PersistenceError::MissingPattern { ref key } if key == "color"));
        assert_eq!(backend.key_count().unwrap(), 0);
        assert_eq!(backend.value_count().unwrap(), 0);
    }

    #[test]
    fn store_rejects_unsupported_value_kinds() {
        let backend = Arc::new(MemoryBackend::new());
        let config = PersistenceConfig {
            codec: CodecConfig::scalars_only(),
            ..PersistenceConfig::default()
        };
        let engine = Persistence::new(backend.clone(), config);

        let kv = single(&["de"], json!(["red", "blue"]));
        let err = engine.store("color", &kv, None).unwrap_err();
        assert!(matches!(err, PersistenceError::Store(StoreError::NotSerializable { .. })));
        assert_eq!(backend.value_count().unwrap(), 0);
        assert_eq!(backend.open_read_contexts(), 0);
    }

    #[test]
    fn duplicate_variants_keep_the_last() {
        let (_, engine) = engine();
        let kv = FixedVariants(vec![
            DomainValue::from_pattern("de", Some(json!("red")), None),
            DomainValue::from_pattern("de", Some(json!("blue")), None),
        ]);
        let stats = engine.store("color", &kv, None).unwrap();
        assert_eq!(stats.persisted, 2);
        let loaded = engine.load("color", &F).unwrap().unwrap();
        assert_eq!(loaded.get("de", None).unwrap().value(), Some(&json!("blue")));
    }

    // -----------------------------------------------------------------------
    // remove (bulk)
    // -----------------------------------------------------------------------

    #[test]
    fn remove_missing_key_is_noop() {
        let (backend, engine) = engine();
        let stats = engine.remove("color", Some(&color()), None).unwrap();
        assert!(stats.is_empty());
        assert_eq!(backend.commits(), 1);
    }

    #[test]
    fn remove_whole_key() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();
        let stats = engine.remove::<DomainKeyValues>("color", None, None).unwrap();
        assert_eq!(stats.removed, 4);
        assert_eq!(backend.key_count().unwrap(), 0);
        assert_eq!(backend.value_count().unwrap(), 0);
    }

    #[test]
    fn remove_every_stored_variant_removes_key() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let stats = engine.remove("color", Some(&color()), None).unwrap();
        assert_eq!(stats.removed, 4);
        assert!(engine.load("color", &F).unwrap().is_none());
        assert_eq!(backend.value_count().unwrap(), 0);
    }

    #[test]
    fn remove_with_unmatched_variant_keeps_key() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let mut request = single(&["de"], json!("blue"));
        request.put(Some(json!("purple")), &["fr"]).unwrap();
        let stats = engine.remove("color", Some(&request), None).unwrap();

        assert_eq!(stats.removed, 1);
        assert_eq!(backend.key_count().unwrap(), 1);
        assert_eq!(backend.value_count().unwrap(), 2);
    }

    #[test]
    fn remove_requires_matching_value() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let mut request = single(&["de"], json!("not blue"));
        request.put(Some(json!("nope")), &["fr"]).unwrap();
        let stats = engine.remove("color", Some(&request), None).unwrap();
        assert!(stats.is_empty());
        assert_eq!(backend.value_count().unwrap(), 3);
    }

    #[test]
    fn remove_strict_subset_trips_key_removal_and_fails() {
        // One requested variant, one matched: the key is scheduled for removal
        // while other values still reference it, so the commit is refused.
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let err = engine
            .remove("color", Some(&single(&["de"], json!("blue"))), None)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Store(StoreError::ForeignKeyViolation { .. })));
        assert_eq!(backend.key_count().unwrap(), 1);
        assert_eq!(backend.value_count().unwrap(), 3);
    }

    #[test]
    fn remove_matching_rows_in_several_change_sets_orphans_key() {
        let (backend, engine) = engine();
        let mut kv = single(&[], json!("red"));
        kv.put_with_change_set("summer", Some(json!("red")), &[]).unwrap();
        engine.store("color", &kv, None).unwrap();
        engine.store("color", &kv, Some("summer")).unwrap();
        assert_eq!(backend.value_count().unwrap(), 2);

        // One requested variant, two removed rows: the key row stays.
        let stats = engine
            .remove("color", Some(&single(&[], json!("red"))), None)
            .unwrap();
        assert_eq!(stats.removed, 2);
        assert_eq!(backend.key_count().unwrap(), 1);
        assert_eq!(backend.value_count().unwrap(), 0);

        let err = engine.load("color", &F).unwrap_err();
        assert!(matches!(err, PersistenceError::InconsistentStore { ref key } if key == "color"));
    }

    #[test]
    fn remove_on_key_without_values_is_inconsistent() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();
        delete_values_out_of_band(&backend, "color");

        let err = engine.remove("color", Some(&color()), None).unwrap_err();
        assert!(matches!(err, PersistenceError::InconsistentStore { .. }));
    }

    #[test]
    fn remove_rejects_missing_or_empty_variant_sets() {
        let (_, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let err = engine.remove("color", Some(&NoVariants), None).unwrap_err();
        assert!(matches!(err, PersistenceError::NullValues { .. }));
        let err = engine.remove("color", Some(&DomainKeyValues::new()), None).unwrap_err();
        assert!(matches!(err, PersistenceError::EmptyValues { .. }));
        assert!(engine.load("color", &F).unwrap().is_some());
    }

    // -----------------------------------------------------------------------
    // remove (single value)
    // -----------------------------------------------------------------------

    #[test]
    fn remove_value_keeps_key_while_others_remain() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();

        let variant = DomainValue::new(&["de"], Some(json!("blue"))).unwrap();
        let stats = engine.remove_value("color", &variant, None).unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(backend.key_count().unwrap(), 1);
        assert_eq!(backend.value_count().unwrap(), 2);
    }

    #[test]
    fn remove_value_of_last_row_removes_key() {
        let (backend, engine) = engine();
        engine.store("color", &single(&["de"], json!("blue")), None).unwrap();

        let variant = DomainValue::new(&["de"], Some(json!("anything"))).unwrap();
        let stats = engine.remove_value("color", &variant, None).unwrap();
        assert_eq!(stats.removed, 2);
        assert_eq!(backend.key_count().unwrap(), 0);
    }

    #[test]
    fn remove_value_uses_change_set_identity() {
        let (backend, engine) = engine();
        let mut kv = single(&["de"], json!("blue"));
        kv.put_with_change_set("summer", Some(json!("yellow")), &["de"]).unwrap();
        engine.store("color", &kv, None).unwrap();
        engine.store("color", &kv, Some("summer")).unwrap();

        let variant = DomainValue::with_change_set("summer", &["de"], Some(json!("yellow"))).unwrap();
        engine.remove_value("color", &variant, Some("summer")).unwrap();

        let values = ValueStore::new(backend.clone());
        assert!(values.find_value("color", "de", "summer").unwrap().is_none());
        assert!(values.find_value("color", "de", "").unwrap().is_some());
        assert_eq!(backend.key_count().unwrap(), 1);
    }

    #[test]
    fn remove_value_absent_row_is_noop() {
        let (backend, engine) = engine();
        engine.store("color", &color(), None).unwrap();
        let variant = DomainValue::new(&["fr"], Some(json!("blue"))).unwrap();
        assert!(engine.remove_value("color", &variant, None).unwrap().is_empty());
        assert_eq!(backend.value_count().unwrap(), 3);
        assert!(engine.remove_value("size", &variant, None).unwrap().is_empty());
    }

    #[test]
    fn remove_value_validates_value() {
        let backend = Arc::new(MemoryBackend::new());
        let config = PersistenceConfig {
            codec: CodecConfig::scalars_only(),
            ..PersistenceConfig::default()
        };
        let engine = Persistence::new(backend.clone(), config);
        engine.store("color", &single(&["de"], json!("blue")), None).unwrap();

        let nil = DomainValue::new(&["de"], None).unwrap();
        let err = engine.remove_value("color", &nil, None).unwrap_err();
        assert!(matches!(err, PersistenceError::MissingValue { ref key } if key == "color"));

        let object = DomainValue::new(&["de"], Some(json!({"r": 0}))).unwrap();
        let err = engine.remove_value("color", &object, None).unwrap_err();
        assert!(matches!(err, PersistenceError::Store(StoreError::NotSerializable { .. })));

        assert_eq!(backend.value_count().unwrap(), 1);
    }

    // -----------------------------------------------------------------------
    // key enumeration
    // -----------------------------------------------------------------------

    #[test]
    fn find_and_list_keys() {
        let (_, engine) = engine();
        engine.store("header.color", &single(&[], json!("red")), None).unwrap();
        engine.store("footer.Color", &single(&[], json!("blue")), None).unwrap();
        engine.store("size", &single(&[], json!(1)), None).unwrap();

        let mut found = engine.find_keys("color").unwrap();
        found.sort();
        assert_eq!(found, vec!["footer.Color", "header.color"]);

        let mut all = engine.all_keys().unwrap();
        all.sort();
        assert_eq!(all, vec!["footer.Color", "header.color", "size"]);
    }

    #[test]
    fn find_keys_treats_wildcards_literally() {
        let (_, engine) = engine();
        for key in ["axb", "a_b", "100x", "100%"] {
            engine.store(key, &single(&[], json!("red")), None).unwrap();
        }

        assert_eq!(engine.find_keys("a_b").unwrap(), vec!["a_b"]);
        assert_eq!(engine.find_keys("100%").unwrap(), vec!["100%"]);
        assert!(engine.find_keys("%").unwrap().iter().all(|k| k.contains('%')));
    }

    // -----------------------------------------------------------------------
    // Write counting
    // -----------------------------------------------------------------------

    // Wraps a backend and counts the row operations reaching its units.
    struct RecordingBackend {
        inner: MemoryBackend,
        persists: AtomicUsize,
        merges: AtomicUsize,
        removes: AtomicUsize,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                persists: AtomicUsize::new(0),
                merges: AtomicUsize::new(0),
                removes: AtomicUsize::new(0),
            }
        }

        fn writes(&self) -> (usize, usize, usize) {
            (
                self.persists.load(Ordering::SeqCst),
                self.merges.load(Ordering::SeqCst),
                self.removes.load(Ordering::SeqCst),
            )
        }
    }

    struct RecordingUnit<'a> {
        inner: Box<dyn WriteUnit + 'a>,
        backend: &'a RecordingBackend,
    }

    impl WriteUnit for RecordingUnit<'_> {
        fn id(&self) -> uuid::Uuid {
            self.inner.id()
        }
        fn contains(&self, row: &Row) -> bool {
            self.inner.contains(row)
        }
        fn persist(&mut self, row: Row) -> StoreResult<()> {
            self.backend.persists.fetch_add(1, Ordering::SeqCst);
            self.inner.persist(row)
        }
        fn merge(&mut self, row: Row) -> StoreResult<Row> {
            self.backend.merges.fetch_add(1, Ordering::SeqCst);
            self.inner.merge(row)
        }
        fn remove(&mut self, row: &Row) -> StoreResult<()> {
            self.backend.removes.fetch_add(1, Ordering::SeqCst);
            self.inner.remove(row)
        }
        fn commit(self: Box<Self>) -> StoreResult<CommitSummary> {
            self.inner.commit()
        }
    }

    impl Backend for RecordingBackend {
        fn read(&self) -> StoreResult<Box<dyn ReadContext + '_>> {
            self.inner.read()
        }
        fn begin(&self) -> StoreResult<Box<dyn WriteUnit + '_>> {
            Ok(Box::new(RecordingUnit {
                inner: self.inner.begin()?,
                backend: self,
            }))
        }
    }

    #[test]
    fn unchanged_store_issues_no_backend_writes() {
        let backend = Arc::new(RecordingBackend::new());
        let engine = Persistence::new(backend.clone(), PersistenceConfig::default());

        engine.store("color", &color(), None).unwrap();
        assert_eq!(backend.writes(), (4, 0, 0));

        engine.store("color", &color(), None).unwrap();
        assert_eq!(backend.writes(), (4, 0, 0));

        let mut changed = color();
        changed.put(Some(json!("black")), &[]).unwrap();
        engine.store("color", &changed, None).unwrap();
        assert_eq!(backend.writes(), (4, 1, 0));
    }

    #[test]
    fn remove_reattaches_rows_read_outside_the_unit() {
        let backend = Arc::new(RecordingBackend::new());
        let engine = Persistence::new(backend.clone(), PersistenceConfig::default());
        engine.store("color", &color(), None).unwrap();

        let stats = engine.remove::<DomainKeyValues>("color", None, None).unwrap();
        assert_eq!(stats.removed, 4);
        assert_eq!(stats.merged, 0);
        // Every removed row was read detached and merged before removal.
        assert_eq!(backend.writes(), (4, 4, 4));
    }

    // -----------------------------------------------------------------------
    // Misbehaving stores
    // -----------------------------------------------------------------------

    // Answers every key query with two identical rows and refuses counts.
    struct DuplicatingBackend;

    struct DuplicatingRead;

    impl ReadContext for DuplicatingRead {
        fn select(&self, _query: &Query) -> StoreResult<Option<Vec<Row>>> {
            let row = KeyRow::new("color", None);
            Ok(Some(vec![row.clone().into(), row.into()]))
        }
        fn count(&self, _query: &Query) -> StoreResult<Option<Vec<u64>>> {
            Ok(Some(vec![]))
        }
    }

    impl Backend for DuplicatingBackend {
        fn read(&self) -> StoreResult<Box<dyn ReadContext + '_>> {
            Ok(Box::new(DuplicatingRead))
        }
        fn begin(&self) -> StoreResult<Box<dyn WriteUnit + '_>> {
            Err(StoreError::NoActiveTransaction)
        }
    }

    #[test]
    fn duplicate_key_rows_surface_multiple_results() {
        let engine = Persistence::new(Arc::new(DuplicatingBackend), PersistenceConfig::default());
        let err = engine.load("color", &F).unwrap_err();
        assert!(matches!(err, PersistenceError::Store(StoreError::MultipleResults { found: 2, .. })));
    }

    // -----------------------------------------------------------------------
    // Durability
    // -----------------------------------------------------------------------

    #[test]
    fn journal_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vellum.journal");
        let config = JournalConfig {
            sync_mode: SyncMode::EveryCommit,
        };

        {
            let backend = Arc::new(MemoryBackend::open(&path, config.clone()).unwrap());
            let engine = Persistence::new(backend, PersistenceConfig::default());
            engine.store("color", &color(), None).unwrap();
            engine.store("size", &single(&[], json!(12)), None).unwrap();
            engine.remove::<DomainKeyValues>("size", None, None).unwrap();
        }

        let backend = Arc::new(MemoryBackend::open(&path, config).unwrap());
        let engine = Persistence::new(backend, PersistenceConfig::default());
        let all = engine.load_all(&F).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["color"], color());
    }
}
