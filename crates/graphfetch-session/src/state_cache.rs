//! Entity-state cache.
//!
//! The state cache guarantees one [`EntityState`] per identity. Updates never
//! mutate a state in place: they build the next state and swap the `Arc`, so
//! anything still holding the previous state keeps a consistent snapshot.

use graphfetch_core::{CollectionState, EntityState, Error, FieldId, Key, Result, Tuple};
use std::collections::HashMap;
use std::sync::Arc;

/// Map from identity to its current cached state.
#[derive(Debug, Default)]
pub struct StateCache {
    entries: HashMap<Key, Arc<EntityState>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &Key) -> Option<Arc<EntityState>> {
        self.entries.get(key).cloned()
    }

    /// Merge `tuple` into the state of `key`, or mark it removed on `None`.
    pub fn update(&mut self, key: Key, tuple: Option<Tuple>) -> Arc<EntityState> {
        let next = match (self.entries.get(&key), tuple) {
            (Some(current), Some(tuple)) => current.merged(key.clone(), &tuple),
            (None, Some(tuple)) => EntityState::loaded(key.clone(), tuple),
            (Some(current), None) => current.as_removed(),
            (None, None) => EntityState::removed(key.clone()),
        };
        tracing::trace!(key = %key, persistence = ?next.persistence(), "State updated");
        let next = Arc::new(next);
        self.entries.insert(key, Arc::clone(&next));
        next
    }

    /// Record a collection on a cached owner.
    pub fn update_collection(
        &mut self,
        owner: &Key,
        field: FieldId,
        collection: CollectionState,
    ) -> Result<Arc<EntityState>> {
        let current = self.entries.get(owner).ok_or_else(|| {
            Error::consistency(format!("collection owner {owner} is not in the state cache"))
        })?;
        let next = Arc::new(current.with_collection(field, collection));
        self.entries.insert(owner.clone(), Arc::clone(&next));
        Ok(next)
    }

    /// Forget `key`.
    pub fn remove(&mut self, key: &Key) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of states marked removed.
    pub fn removed_count(&self) -> usize {
        self.entries.values().filter(|s| s.is_removed()).count()
    }

    /// Number of states holding row data.
    pub fn loaded_count(&self) -> usize {
        self.entries.values().filter(|s| s.tuple().is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityState>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphfetch_core::{ModelBuilder, ModelRegistry, PersistenceState, TypeId, Value};

    fn model() -> (ModelRegistry, TypeId) {
        let mut m = ModelBuilder::new();
        let user = m.declare("User");
        m.entity(user).key("id").column("name").column("email").finish().unwrap();
        (m.build().unwrap(), user)
    }

    fn key(model: &ModelRegistry, user: TypeId, id: i64) -> Key {
        Key::new(model, user, vec![Value::BigInt(id)]).unwrap()
    }

    #[test]
    fn updates_merge_and_replace_the_arc() {
        let (model, user) = model();
        let mut cache = StateCache::new();

        let mut first = Tuple::new(4);
        first.set(2, "ada".into());
        let a = cache.update(key(&model, user, 1), Some(first));

        let mut second = Tuple::new(4);
        second.set(3, "ada@example.com".into());
        let b = cache.update(key(&model, user, 1), Some(second));

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.tuple().unwrap().loaded_count(), 1);
        assert_eq!(b.tuple().unwrap().loaded_count(), 2);
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&cache.lookup(&key(&model, user, 1)).unwrap(), &b));
    }

    #[test]
    fn none_marks_removed() {
        let (model, user) = model();
        let mut cache = StateCache::new();
        let state = cache.update(key(&model, user, 9), None);
        assert_eq!(state.persistence(), PersistenceState::Removed);
        assert_eq!(cache.removed_count(), 1);
        assert_eq!(cache.loaded_count(), 0);
    }

    #[test]
    fn collection_owner_must_be_cached() {
        let (model, user) = model();
        let mut cache = StateCache::new();
        let err = cache
            .update_collection(&key(&model, user, 1), FieldId(0), CollectionState::default())
            .unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));

        cache.update(key(&model, user, 1), Some(Tuple::new(4)));
        let state = cache
            .update_collection(
                &key(&model, user, 1),
                FieldId(0),
                CollectionState {
                    members: Vec::new(),
                    fully_loaded: true,
                    refresh_token: 3,
                },
            )
            .unwrap();
        assert_eq!(state.collection(FieldId(0)).unwrap().refresh_token, 3);
    }
}
