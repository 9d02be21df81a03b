//! In-memory unit of work.
//!
//! [`MemorySession`] implements [`UnitOfWork`] over a [`MemoryStore`]. It
//! keeps a log of every query it executed, grouped by batch, which is what
//! tests use to observe how the engine batches its work.

use crate::state_cache::StateCache;
use crate::store::MemoryStore;
use crate::unit_of_work::{QueryHandle, UnitOfWork};
use graphfetch_core::{
    CollectionState, Cx, EntityState, Error, FieldId, Key, ModelRegistry, Outcome, QueryError,
    QueryErrorKind, Result, Row, Tuple, TypeId, Value,
};
use graphfetch_query::{FetchSpec, QueryParams, QueuedQuery};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Counters kept by a [`MemorySession`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Batches that executed at least one query.
    pub batches: u64,
    /// Physical queries executed.
    pub queries: u64,
    /// Rows returned.
    pub rows: u64,
    /// Staged writes applied before a batch.
    pub writes_applied: u64,
}

/// One executed query.
#[derive(Debug, Clone)]
pub struct ExecutedQuery {
    /// 1-based batch number.
    pub batch: u64,
    pub plan: Arc<FetchSpec>,
    pub params: QueryParams,
    pub rows: usize,
}

impl ExecutedQuery {
    /// Type the query selects from.
    pub fn target_type(&self) -> TypeId {
        match &*self.plan {
            FetchSpec::Columns(spec) => spec.type_id,
            FetchSpec::Collection(spec) => spec.target_type,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(&*self.plan, FetchSpec::Collection(_))
    }
}

#[derive(Debug, Clone)]
struct StagedWrite {
    type_id: TypeId,
    values: Vec<(String, Value)>,
}

/// A [`UnitOfWork`] backed by memory.
#[derive(Debug)]
pub struct MemorySession {
    model: Arc<ModelRegistry>,
    store: MemoryStore,
    cache: StateCache,
    queued: Vec<(QueryHandle, QueuedQuery)>,
    results: HashMap<QueryHandle, Vec<Row>>,
    next_handle: u64,
    staged: Vec<StagedWrite>,
    stats: SessionStats,
    executed: Vec<ExecutedQuery>,
    fail_next: Option<String>,
}

impl MemorySession {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            model: Arc::clone(store.model()),
            store,
            cache: StateCache::new(),
            queued: Vec::new(),
            results: HashMap::new(),
            next_handle: 0,
            staged: Vec::new(),
            stats: SessionStats::default(),
            executed: Vec::new(),
            fail_next: None,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MemoryStore {
        &mut self.store
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut StateCache {
        &mut self.cache
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Every query executed so far, in execution order.
    pub fn executed(&self) -> &[ExecutedQuery] {
        &self.executed
    }

    /// Queries executed in batch number `batch`.
    pub fn executed_in(&self, batch: u64) -> impl Iterator<Item = &ExecutedQuery> {
        self.executed.iter().filter(move |q| q.batch == batch)
    }

    /// Number of queries waiting for the next batch.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Stage an insert that is applied before the next batch unless the batch
    /// skips side effects.
    pub fn stage_insert(&mut self, type_id: TypeId, values: &[(&str, Value)]) {
        self.staged.push(StagedWrite {
            type_id,
            values: values
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
        });
    }

    /// Make the next batch fail with a query error.
    pub fn fail_next_batch(&mut self, message: impl Into<String>) {
        self.fail_next = Some(message.into());
    }

    fn apply_staged(&mut self) -> Result<()> {
        for write in std::mem::take(&mut self.staged) {
            let values: Vec<(&str, Value)> = write
                .values
                .iter()
                .map(|(name, value)| (name.as_str(), value.clone()))
                .collect();
            self.store.insert(write.type_id, &values)?;
            self.stats.writes_applied += 1;
        }
        Ok(())
    }

    fn run(&self, query: &QueuedQuery) -> Result<Vec<Row>> {
        match (&*query.plan, &query.params) {
            (FetchSpec::Columns(spec), QueryParams::Keys(keys)) => {
                self.store.select_columns(spec, keys)
            }
            (FetchSpec::Collection(spec), QueryParams::Owner(owner)) => {
                self.store.select_collection(spec, owner)
            }
            _ => Err(Error::Query(QueryError {
                kind: QueryErrorKind::Execution,
                message: "query parameters do not match the plan".to_string(),
                source: None,
            })),
        }
    }
}

impl UnitOfWork for MemorySession {
    fn model(&self) -> &Arc<ModelRegistry> {
        &self.model
    }

    fn lookup(&self, key: &Key) -> Option<Arc<EntityState>> {
        self.cache.lookup(key)
    }

    fn update_state(&mut self, key: Key, tuple: Option<Tuple>) -> Arc<EntityState> {
        self.cache.update(key, tuple)
    }

    fn update_collection(
        &mut self,
        owner: &Key,
        field: FieldId,
        state: CollectionState,
    ) -> Result<Arc<EntityState>> {
        self.cache.update_collection(owner, field, state)
    }

    fn register_query(&mut self, query: QueuedQuery) -> QueryHandle {
        self.next_handle += 1;
        let handle = QueryHandle(self.next_handle);
        self.queued.push((handle, query));
        handle
    }

    fn take_results(&mut self, handle: QueryHandle) -> Result<Vec<Row>> {
        if let Some(rows) = self.results.remove(&handle) {
            return Ok(rows);
        }
        let (kind, message) = if self.queued.iter().any(|(h, _)| *h == handle) {
            (QueryErrorKind::NotExecuted, "query has not been executed yet")
        } else {
            (QueryErrorKind::UnknownHandle, "unknown or already consumed query handle")
        };
        Err(Error::Query(QueryError {
            kind,
            message: format!("{message}: {:?}", handle),
            source: None,
        }))
    }

    fn discard_pending(&mut self) {
        if !self.queued.is_empty() || !self.results.is_empty() {
            debug!(
                queued = self.queued.len(),
                untaken = self.results.len(),
                "Discarding pending queries"
            );
        }
        self.queued.clear();
        self.results.clear();
    }

    fn execute_queued(&mut self, skip_side_effects: bool) -> Result<bool> {
        if !skip_side_effects {
            self.apply_staged()?;
        }
        if self.queued.is_empty() {
            return Ok(false);
        }
        let queued = std::mem::take(&mut self.queued);
        if let Some(message) = self.fail_next.take() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Execution,
                message,
                source: None,
            }));
        }

        let batch = self.stats.batches + 1;
        let mut executed = Vec::with_capacity(queued.len());
        for (handle, query) in queued {
            let rows = self.run(&query)?;
            executed.push(ExecutedQuery {
                batch,
                plan: query.plan,
                params: query.params,
                rows: rows.len(),
            });
            self.results.insert(handle, rows);
        }

        self.stats.batches = batch;
        self.stats.queries += executed.len() as u64;
        self.stats.rows += executed.iter().map(|q| q.rows as u64).sum::<u64>();
        info!(
            batch,
            queries = executed.len(),
            skip_side_effects,
            "Executed queued fetch batch"
        );
        self.executed.extend(executed);
        Ok(true)
    }

    fn execute_queued_async(
        &mut self,
        cx: &Cx,
        skip_side_effects: bool,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let outcome = if let Some(reason) = cx.cancel_reason() {
            self.queued.clear();
            Outcome::Cancelled(reason)
        } else {
            match self.execute_queued(skip_side_effects) {
                Ok(executed) => Outcome::Ok(executed),
                Err(e) => Outcome::Err(e),
            }
        };
        async move { outcome }
    }
}
