//! Batched column fetch tasks.
//!
//! All root requests of a cycle that want the same columns of the same type
//! share one task, and the task loads its keys in chunks so that no single
//! query carries more than `max_keys_per_query` keys.

use graphfetch_core::{EntityState, Error, Key, ModelRegistry, Result, TypeId};
use graphfetch_query::{ColumnFetchSpec, FetchSpec, PlanCache, QueuedQuery, cache_key, decode_entity};
use graphfetch_session::{QueryHandle, UnitOfWork};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// Structural identity of a column fetch task.
///
/// The hash is computed once, since task keys are looked up for every root
/// request of a cycle.
#[derive(Debug, Clone)]
pub struct ColumnTaskKey {
    type_id: TypeId,
    columns: Arc<[usize]>,
    hash: u64,
}

impl ColumnTaskKey {
    /// Key for `columns` of `type_id`; the columns are sorted and deduplicated.
    pub fn new(type_id: TypeId, columns: impl IntoIterator<Item = usize>) -> Self {
        let mut columns: Vec<usize> = columns.into_iter().collect();
        columns.sort_unstable();
        columns.dedup();
        let hash = cache_key(&(type_id, &columns));
        Self {
            type_id,
            columns: columns.into(),
            hash,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }
}

impl PartialEq for ColumnTaskKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.type_id == other.type_id && self.columns == other.columns
    }
}

impl Eq for ColumnTaskKey {}

impl Hash for ColumnTaskKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// What a column task learned from its results.
#[derive(Debug, Default)]
pub(crate) struct ColumnMerge {
    pub found: Vec<Key>,
    /// Requested keys with no row.
    pub missing: Vec<Key>,
}

/// Loads a fixed column set of one type for many keys.
#[derive(Debug)]
pub struct ColumnFetchTask {
    key: ColumnTaskKey,
    keys: Vec<Key>,
    exact: HashMap<Key, bool>,
    handles: Vec<QueryHandle>,
    plan: Option<Arc<FetchSpec>>,
}

impl ColumnFetchTask {
    pub fn new(key: ColumnTaskKey) -> Self {
        Self {
            key,
            keys: Vec::new(),
            exact: HashMap::new(),
            handles: Vec::new(),
            plan: None,
        }
    }

    pub fn key(&self) -> &ColumnTaskKey {
        &self.key
    }

    /// Number of distinct keys registered.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Register `key`. The first registration of a key decides whether it
    /// counts as requested with its exact type.
    pub fn add_key(&mut self, key: Key, exact_type_requested: bool) -> bool {
        if self.exact.contains_key(&key) {
            return false;
        }
        self.exact.insert(key.clone(), exact_type_requested);
        self.keys.push(key);
        true
    }

    /// Register one query per chunk of at most `chunk_size` keys on the unit
    /// of work's queue. Returns the number of queries registered.
    ///
    /// Nothing runs until the unit of work executes its queue.
    pub fn build_and_run<U: UnitOfWork>(
        &mut self,
        uow: &mut U,
        plans: &mut PlanCache,
        chunk_size: usize,
    ) -> Result<usize> {
        let spec = ColumnFetchSpec::new(uow.model(), self.key.type_id, self.key.columns.iter().copied())?;
        let plan = plans.intern(FetchSpec::Columns(spec));
        for chunk in self.keys.chunks(chunk_size.max(1)) {
            let handle = uow.register_query(QueuedQuery::columns(Arc::clone(&plan), chunk.to_vec()));
            self.handles.push(handle);
        }
        debug!(
            type_id = ?self.key.type_id,
            keys = self.keys.len(),
            queries = self.handles.len(),
            "Column fetch task registered"
        );
        self.plan = Some(plan);
        Ok(self.handles.len())
    }

    /// Write every returned row into the state cache and mark requested keys
    /// that did not come back.
    pub(crate) fn merge_results<U: UnitOfWork>(
        &mut self,
        uow: &mut U,
        model: &ModelRegistry,
        merged: &mut Vec<Arc<EntityState>>,
    ) -> Result<ColumnMerge> {
        let Some(plan) = self.plan.take() else {
            return Ok(ColumnMerge::default());
        };
        let Some(spec) = plan.as_columns() else {
            return Err(Error::InvariantViolation(
                "column task holds a collection plan".to_string(),
            ));
        };

        let mut outcome = ColumnMerge::default();
        let mut found = HashSet::new();
        for handle in std::mem::take(&mut self.handles) {
            for row in uow.take_results(handle)? {
                let (key, tuple) = decode_entity(model, spec.type_id, &spec.columns, &row)?;
                found.insert(key.clone());
                merged.push(uow.update_state(key.clone(), Some(tuple)));
                outcome.found.push(key);
            }
        }

        for key in &self.keys {
            if found.contains(key) {
                continue;
            }
            outcome.missing.push(key.clone());
            if !self.exact.get(key).copied().unwrap_or(false) {
                continue;
            }
            let contradicted = uow.lookup(key).is_some_and(|state| {
                state.key().is_exact_type() && !model.is_assignable(state.key().type_id(), spec.type_id)
            });
            if contradicted {
                trace!(key = %key, "Absent key has a different exact type; not marking removed");
                continue;
            }
            merged.push(uow.update_state(key.clone(), None));
        }
        if !outcome.missing.is_empty() {
            debug!(
                type_id = ?spec.type_id,
                missing = outcome.missing.len(),
                "Requested keys were not found"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphfetch_core::{ModelBuilder, PersistenceState, Value};
    use graphfetch_session::{MemorySession, MemoryStore};

    fn session(rows: i64) -> (MemorySession, TypeId) {
        let mut m = ModelBuilder::new();
        let item = m.declare("Item");
        m.entity(item).key("id").column("label").finish().unwrap();
        let mut store = MemoryStore::new(Arc::new(m.build().unwrap()));
        for id in 0..rows {
            store.insert(item, &[("id", Value::BigInt(id))]).unwrap();
        }
        (MemorySession::new(store), item)
    }

    fn keys(session: &MemorySession, item: TypeId, ids: std::ops::Range<i64>) -> Vec<Key> {
        ids.map(|id| Key::new(session.model(), item, vec![Value::BigInt(id)]).unwrap())
            .collect()
    }

    #[test]
    fn test_task_key_is_structural() {
        let a = ColumnTaskKey::new(TypeId(1), [3, 1, 2, 3]);
        let b = ColumnTaskKey::new(TypeId(1), [1, 2, 3]);
        assert_eq!(a, b);
        assert_eq!(cache_key(&a), cache_key(&b));
        assert_ne!(a, ColumnTaskKey::new(TypeId(2), [1, 2, 3]));
        assert_eq!(a.columns(), &[1, 2, 3]);
    }

    #[test]
    fn test_chunking() {
        for (n, expected) in [(40, 1), (41, 2), (80, 2), (81, 3)] {
            let (mut session, item) = session(0);
            let mut task = ColumnFetchTask::new(ColumnTaskKey::new(item, [2]));
            for key in keys(&session, item, 0..n) {
                task.add_key(key, true);
            }
            let mut plans = PlanCache::default();
            assert_eq!(task.build_and_run(&mut session, &mut plans, 40).unwrap(), expected);
            assert_eq!(session.queued_len(), expected);
            assert_eq!(plans.len(), 1);
        }
    }

    #[test]
    fn test_first_registration_wins() {
        let (session, item) = session(0);
        let key = keys(&session, item, 0..1).remove(0);
        let mut task = ColumnFetchTask::new(ColumnTaskKey::new(item, [2]));
        assert!(task.add_key(key.clone(), false));
        assert!(!task.add_key(key, true));
        assert_eq!(task.len(), 1);
        assert_eq!(task.exact.values().copied().collect::<Vec<_>>(), vec![false]);
    }

    #[test]
    fn test_merge_marks_only_exact_missing_keys() {
        let (mut session, item) = session(2);
        let mut task = ColumnFetchTask::new(ColumnTaskKey::new(item, [2]));
        let ks = keys(&session, item, 0..4);
        task.add_key(ks[0].clone(), true);
        task.add_key(ks[1].clone(), true);
        task.add_key(ks[2].clone(), true);
        task.add_key(ks[3].clone(), false);

        let mut plans = PlanCache::default();
        task.build_and_run(&mut session, &mut plans, 40).unwrap();
        session.execute_queued(false).unwrap();

        let model = Arc::clone(session.model());
        let mut merged = Vec::new();
        let outcome = task.merge_results(&mut session, &model, &mut merged).unwrap();
        assert_eq!(outcome.found.len(), 2);
        assert_eq!(outcome.missing.len(), 2);
        // Exact-requested key 2 is removed; the inexact-requested key 3 is not.
        assert_eq!(merged.len(), 3);
        assert_eq!(
            session.lookup(&ks[2]).unwrap().persistence(),
            PersistenceState::Removed
        );
        assert!(session.lookup(&ks[3]).is_none());
    }
}
