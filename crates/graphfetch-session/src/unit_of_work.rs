//! The unit-of-work contract consumed by the prefetch engine.

use graphfetch_core::{
    CollectionState, Cx, EntityState, Error, FieldId, Key, ModelRegistry, Outcome, Result, Row,
    Tuple,
};
use graphfetch_query::QueuedQuery;
use std::future::Future;
use std::sync::Arc;

/// Handle of a query registered on a unit of work's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHandle(pub u64);

/// A session-like collaborator owning the entity-state cache and a queue of
/// delayed queries.
///
/// Queries are registered first and executed together as one batch. Results
/// of a batch are then taken per handle.
pub trait UnitOfWork: Send {
    /// The model the cached states and queued queries refer to.
    fn model(&self) -> &Arc<ModelRegistry>;

    /// Cached state for `key`.
    fn lookup(&self, key: &Key) -> Option<Arc<EntityState>>;

    /// Merge `tuple` into the cached state for `key`; `None` marks the entity
    /// removed.
    fn update_state(&mut self, key: Key, tuple: Option<Tuple>) -> Arc<EntityState>;

    /// Record what is known about a collection of a cached owner.
    fn update_collection(
        &mut self,
        owner: &Key,
        field: FieldId,
        state: CollectionState,
    ) -> Result<Arc<EntityState>>;

    /// Queue a query for the next batch.
    fn register_query(&mut self, query: QueuedQuery) -> QueryHandle;

    /// Take the rows of an executed query.
    fn take_results(&mut self, handle: QueryHandle) -> Result<Vec<Row>>;

    /// Drop queued queries and results nobody took.
    fn discard_pending(&mut self);

    /// Execute every queued query as one batch.
    ///
    /// Returns whether any physical execution happened.
    fn execute_queued(&mut self, skip_side_effects: bool) -> Result<bool>;

    /// Suspendable counterpart of [`execute_queued`](Self::execute_queued).
    fn execute_queued_async(
        &mut self,
        cx: &Cx,
        skip_side_effects: bool,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send;
}
