//! Bounded LRU caches.
//!
//! [`LruCache`] backs both the plan cache here and the engine's column-index
//! cache. Entries remember when they were last used; once the cache is full
//! the least-recently-used entry is evicted on insert.

use crate::spec::FetchSpec;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    last_used: Instant,
    // Ties in `last_used` are broken by insertion order.
    tick: u64,
}

/// Hit/miss counters of an [`LruCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU cache with a fixed maximum number of entries.
///
/// # Example
///
/// ```
/// use graphfetch_query::LruCache;
///
/// let mut cache = LruCache::new(2);
/// cache.get_or_insert_with(1, || "one");
/// cache.get_or_insert_with(2, || "two");
/// cache.get_or_insert_with(1, || unreachable!());
/// cache.get_or_insert_with(3, || "three");
///
/// assert!(cache.contains(&1));
/// assert!(!cache.contains(&2));
/// ```
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    max_size: usize,
    tick: u64,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `max_size` entries (at least one).
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_size.min(256)),
            max_size: max_size.max(1),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    /// Get the cached value for `key`, building it with `builder` on a miss.
    pub fn get_or_insert_with(&mut self, key: K, builder: impl FnOnce() -> V) -> &V {
        match self.try_get_or_insert_with(key, || Ok::<V, Infallible>(builder())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`get_or_insert_with`](Self::get_or_insert_with).
    /// A failed build leaves no entry for `key`.
    pub fn try_get_or_insert_with<E>(
        &mut self,
        key: K,
        builder: impl FnOnce() -> Result<V, E>,
    ) -> Result<&V, E> {
        self.tick += 1;
        let tick = self.tick;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_lru();
        }
        let entry = match self.entries.entry(key) {
            Entry::Occupied(o) => {
                self.stats.hits += 1;
                o.into_mut()
            }
            Entry::Vacant(v) => {
                let value = builder()?;
                self.stats.misses += 1;
                v.insert(CacheEntry {
                    value,
                    last_used: Instant::now(),
                    tick,
                })
            }
        };
        entry.last_used = Instant::now();
        entry.tick = tick;
        Ok(&entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_lru(&mut self) {
        if let Some(lru_key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_used, entry.tick))
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&lru_key);
            self.stats.evictions += 1;
        }
    }
}

/// Compute a hash key from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Interns fetch specifications so that structurally equal specifications
/// share one `Arc`.
#[derive(Debug)]
pub struct PlanCache {
    plans: LruCache<FetchSpec, Arc<FetchSpec>>,
}

impl PlanCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            plans: LruCache::new(max_size),
        }
    }

    /// The shared plan for `spec`.
    pub fn intern(&mut self, spec: FetchSpec) -> Arc<FetchSpec> {
        let plan = Arc::clone(self.plans.get_or_insert_with(spec.clone(), || Arc::new(spec)));
        tracing::trace!(plans = self.plans.len(), "Plan interned");
        plan
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.plans.stats()
    }

    pub fn clear(&mut self) {
        self.plans.clear();
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ColumnFetchSpec;
    use graphfetch_core::TypeId;

    #[test]
    fn test_cache_hit() {
        let mut cache = LruCache::new(10);
        assert_eq!(*cache.get_or_insert_with(1, || "a".to_string()), "a");

        let called = std::cell::Cell::new(false);
        let v = cache
            .get_or_insert_with(1, || {
                called.set(true);
                "b".to_string()
            })
            .clone();
        assert_eq!(v, "a");
        assert!(!called.get());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_ordering() {
        let mut cache = LruCache::new(2);
        cache.get_or_insert_with(1, || 1);
        cache.get_or_insert_with(2, || 2);
        // Touch 1 so that 2 becomes least recently used.
        cache.get_or_insert_with(1, || 0);
        cache.get_or_insert_with(3, || 3);

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_failed_builder_caches_nothing() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4);
        let err = cache.try_get_or_insert_with(7, || Err("boom")).unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.is_empty());
        assert_eq!(*cache.try_get_or_insert_with(7, || Ok::<_, ()>(9)).unwrap(), 9);
        assert_eq!(*cache.try_get_or_insert_with(7, || Err(())).unwrap(), 9);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = LruCache::new(0);
        cache.get_or_insert_with("a", || 1);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_plan_interning_shares_equal_specs() {
        let spec = || {
            FetchSpec::Columns(ColumnFetchSpec {
                type_id: TypeId(3),
                columns: vec![0, 1, 4].into(),
            })
        };
        let mut plans = PlanCache::new(8);
        let a = plans.intern(spec());
        let b = plans.intern(spec());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(plans.len(), 1);
        assert_eq!(cache_key(&*a), cache_key(&spec()));
    }
}
