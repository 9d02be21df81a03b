//! Per-cycle state.
//!
//! Everything in a [`Cycle`] lives from the first request after an execution
//! until the next execution finishes (or fails). The scheduler takes the
//! whole value out when it executes, so nothing leaks into the next cycle.

use crate::collection_task::CollectionFetchTask;
use crate::column_task::ColumnFetchTask;
use crate::descriptor::{FieldDescriptor, KeyExtractor};
use crate::node::{FetchNode, NodeKey};
use graphfetch_core::{EntityState, Key, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Where a cycle is in its two-round execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    #[default]
    RoundOne,
    RoundTwo,
    Done,
}

/// A request whose key's exact type was not known when it was made.
pub(crate) struct UnresolvedEntry {
    pub key: Key,
    pub declared: TypeId,
    pub descriptors: Vec<FieldDescriptor>,
    pub subscriber: Option<KeyExtractor>,
}

impl fmt::Debug for UnresolvedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnresolvedEntry")
            .field("key", &self.key)
            .field("declared", &self.declared)
            .field("descriptors", &self.descriptors)
            .field("subscriber", &self.subscriber.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Cycle {
    nodes: Vec<FetchNode>,
    index: HashMap<NodeKey, usize>,
    pub unresolved: Vec<UnresolvedEntry>,
    /// Keys requested this cycle that no query returned.
    pub missing: HashSet<Key>,
    /// Every state written this cycle, kept alive by the cycle's anchor.
    pub merged: Vec<Arc<EntityState>>,
    pub phase: CyclePhase,
    pub column_tasks: Vec<ColumnFetchTask>,
    pub collection_tasks: Vec<CollectionFetchTask>,
    /// Batches in which the unit of work reported physical execution.
    pub batches: u64,
}

impl Cycle {
    /// The node for `(key, type_id)`, created on first use.
    pub fn node_mut(&mut self, key: &Key, type_id: TypeId) -> &mut FetchNode {
        let node_key = NodeKey {
            key: key.clone(),
            type_id,
        };
        let idx = match self.index.get(&node_key) {
            Some(&idx) => {
                tracing::trace!(key = %key, type_id = ?type_id, "Reusing fetch node");
                idx
            }
            None => {
                self.nodes.push(FetchNode::new(key.clone(), type_id));
                self.index.insert(node_key, self.nodes.len() - 1);
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[idx]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[FetchNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [FetchNode] {
        &mut self.nodes
    }

    /// Whether anything was requested since the last execution.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.unresolved.is_empty()
    }
}
