//! Cached entity state.
//!
//! An [`EntityState`] is what the unit of work's state cache holds for one
//! [`Key`]: the row-value buffer loaded so far, whether the entity is known to
//! be removed, and what is known about its collections. States are shared as
//! `Arc<EntityState>` and replaced wholesale on update, so a state handed out
//! to a caller never changes underneath it.

use crate::key::Key;
use crate::model::FieldId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Positional row-value buffer. `None` marks a column that is not loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    slots: Vec<Option<Value>>,
}

impl Tuple {
    /// A buffer of `len` columns, none of them loaded.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    /// A fully loaded buffer.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            slots: values.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The loaded value at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(value);
    }

    /// Values of `columns`, or `None` if any of them is not loaded.
    pub fn values_at(&self, columns: &[usize]) -> Option<Vec<Value>> {
        columns.iter().map(|c| self.get(*c).cloned()).collect()
    }

    /// Overlay the loaded slots of `other` onto this buffer.
    pub fn merge_from(&mut self, other: &Tuple) {
        if other.slots.len() > self.slots.len() {
            self.slots.resize(other.slots.len(), None);
        }
        for (slot, incoming) in self.slots.iter_mut().zip(&other.slots) {
            if let Some(v) = incoming {
                *slot = Some(v.clone());
            }
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Persistence status of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Row data reflects storage.
    Synchronized,
    /// The entity is known not to exist.
    Removed,
    /// Only the identity is known.
    NotLoaded,
}

/// What is known about one collection field of a cached entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionState {
    pub members: Vec<Key>,
    /// All members are present in `members`.
    pub fully_loaded: bool,
    /// Refresh token the members were loaded with.
    pub refresh_token: u64,
}

/// One entry of the unit of work's state cache.
#[derive(Debug, Clone)]
pub struct EntityState {
    key: Key,
    tuple: Option<Tuple>,
    persistence: PersistenceState,
    collections: HashMap<FieldId, CollectionState>,
}

impl EntityState {
    pub fn loaded(key: Key, tuple: Tuple) -> Self {
        Self {
            key,
            tuple: Some(tuple),
            persistence: PersistenceState::Synchronized,
            collections: HashMap::new(),
        }
    }

    pub fn removed(key: Key) -> Self {
        Self {
            key,
            tuple: None,
            persistence: PersistenceState::Removed,
            collections: HashMap::new(),
        }
    }

    pub fn not_loaded(key: Key) -> Self {
        Self {
            key,
            tuple: None,
            persistence: PersistenceState::NotLoaded,
            collections: HashMap::new(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn tuple(&self) -> Option<&Tuple> {
        self.tuple.as_ref()
    }

    pub fn persistence(&self) -> PersistenceState {
        self.persistence
    }

    pub fn is_removed(&self) -> bool {
        self.persistence == PersistenceState::Removed
    }

    pub fn collection(&self, field: FieldId) -> Option<&CollectionState> {
        self.collections.get(&field)
    }

    /// A copy of this state with `tuple` merged in.
    ///
    /// An exact incoming key replaces an inexact one.
    #[must_use]
    pub fn merged(&self, key: Key, tuple: &Tuple) -> Self {
        let mut next = self.clone();
        if key.is_exact_type() || !next.key.is_exact_type() {
            next.key = key;
        }
        match next.tuple.as_mut() {
            Some(existing) => existing.merge_from(tuple),
            None => next.tuple = Some(tuple.clone()),
        }
        next.persistence = PersistenceState::Synchronized;
        next
    }

    /// A copy of this state marked removed. Collections are dropped.
    #[must_use]
    pub fn as_removed(&self) -> Self {
        Self::removed(self.key.clone())
    }

    /// A copy of this state with `field` set to `collection`.
    #[must_use]
    pub fn with_collection(&self, field: FieldId, collection: CollectionState) -> Self {
        let mut next = self.clone();
        next.collections.insert(field, collection);
        next
    }
}
