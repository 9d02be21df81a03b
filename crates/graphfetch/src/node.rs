//! Fetch graph nodes.
//!
//! A cycle holds at most one node per `(key, type)` pair. Every request for
//! the same entity in the same cycle lands on that node, which is how work
//! for an entity is merged before any query is built.

use crate::collection_task::CollectionFetchTask;
use crate::descriptor::FieldDescriptor;
use crate::request::{DeferredReferenceRequest, RootFetchRequest};
use graphfetch_core::{Error, FieldId, Key, ModelRegistry, Result, Tuple, TypeId};

/// Identity of a node within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct NodeKey {
    pub key: Key,
    pub type_id: TypeId,
}

#[derive(Debug)]
pub(crate) struct FetchNode {
    pub key: Key,
    pub type_id: TypeId,
    pub root: Option<RootFetchRequest>,
    pub deferred: Vec<DeferredReferenceRequest>,
    pub collections: Vec<CollectionFetchTask>,
}

impl FetchNode {
    pub fn new(key: Key, type_id: TypeId) -> Self {
        Self {
            key,
            type_id,
            root: None,
            deferred: Vec::new(),
            collections: Vec::new(),
        }
    }

    /// The root request of this node, created on first use.
    pub fn root_mut(&mut self, exact_type_requested: bool) -> &mut RootFetchRequest {
        let (key, type_id) = (&self.key, self.type_id);
        self.root
            .get_or_insert_with(|| RootFetchRequest::new(key.clone(), type_id, exact_type_requested))
    }

    pub fn add_deferred(&mut self, request: DeferredReferenceRequest) {
        match self.deferred.iter_mut().find(|d| d.field == request.field) {
            Some(existing) => existing.merge(&request),
            None => self.deferred.push(request),
        }
    }

    /// Register a collection fetch for `field` (resolved on this node's type),
    /// merging with an earlier request for the same field.
    pub fn add_collection(&mut self, field: FieldId, descriptor: &FieldDescriptor) {
        if let Some(task) = self.collections.iter_mut().find(|t| t.key().field == field) {
            tracing::trace!(key = %self.key, field = ?field, "Merging collection request");
            task.merge_descriptor(descriptor);
            return;
        }
        let task = CollectionFetchTask::new(self.key.clone(), self.type_id, field, descriptor.clone());
        self.collections.push(task);
    }

    pub fn has_work(&self) -> bool {
        self.root.is_some() || !self.collections.is_empty()
    }
}

/// The key a reference points at, read from the owner's loaded foreign-key
/// columns.
///
/// Returns `Ok(None)` for a null reference. Unloaded foreign-key columns are
/// a modeling error: the owner was merged with them requested.
pub(crate) fn referenced_key(
    model: &ModelRegistry,
    owner: &Key,
    tuple: &Tuple,
    fk_columns: &[usize],
    target: TypeId,
) -> Result<Option<Key>> {
    let values = tuple.values_at(fk_columns).ok_or_else(|| {
        Error::missing_column(format!(
            "foreign key columns {fk_columns:?} of {owner} are not loaded"
        ))
    })?;
    if values.iter().any(graphfetch_core::Value::is_null) {
        return Ok(None);
    }
    Key::new(model, target, values).map(Some)
}
