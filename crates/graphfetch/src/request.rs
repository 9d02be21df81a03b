//! Per-entity fetch requests collected on graph nodes during a cycle.

use crate::descriptor::FieldDescriptor;
use graphfetch_core::{FieldId, Key, TypeId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Columns of one entity that round 1 (or round 2) must load.
#[derive(Debug, Clone)]
pub(crate) struct RootFetchRequest {
    pub key: Key,
    pub type_id: TypeId,
    pub columns: BTreeSet<usize>,
    /// Whether the key's exact type was known when it was requested. Only
    /// such keys are marked removed when no row comes back.
    pub exact_type_requested: bool,
}

impl RootFetchRequest {
    pub fn new(key: Key, type_id: TypeId, exact_type_requested: bool) -> Self {
        Self {
            key,
            type_id,
            columns: BTreeSet::new(),
            exact_type_requested,
        }
    }

    pub fn add_columns(&mut self, columns: impl IntoIterator<Item = usize>) {
        self.columns.extend(columns);
    }
}

/// A reference whose foreign key was not loaded when it was requested.
///
/// The foreign-key columns ride along on the owner's root request; once the
/// owner is merged the reference is resolved like any other.
#[derive(Debug, Clone)]
pub(crate) struct DeferredReferenceRequest {
    /// The reference as resolved on the owner's type.
    pub field: FieldId,
    pub target: TypeId,
    pub fk_columns: Arc<[usize]>,
    pub descriptor: FieldDescriptor,
}

impl DeferredReferenceRequest {
    pub fn merge(&mut self, other: &DeferredReferenceRequest) {
        self.descriptor.merge(&other.descriptor);
    }
}
