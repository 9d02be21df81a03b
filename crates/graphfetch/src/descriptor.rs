//! Field descriptors: what to prefetch for one field of an entity.

use graphfetch_core::{FieldId, Key, ModelRegistry, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Callback invoked with the key of every entity discovered through a
/// descriptor: collection members, or the target of a reference.
pub type KeyExtractor = Arc<dyn Fn(&Key) + Send + Sync>;

/// Prefetch request for one field.
///
/// Two descriptors are equal when they name the same field. Requesting the
/// same field twice on one entity merges the descriptors with [`merge`].
///
/// [`merge`]: FieldDescriptor::merge
#[derive(Clone)]
pub struct FieldDescriptor {
    pub field: FieldId,
    /// For reference fields: also fetch the referenced entity's default fields.
    pub fetch_referenced_fields: bool,
    /// For collection fields: fetch at most this many members.
    pub item_limit: Option<usize>,
    /// Load lazy columns of fetched targets too.
    pub include_lazy: bool,
    pub key_extractor: Option<KeyExtractor>,
    /// Collections recorded with an older token are fetched again.
    pub refresh_token: u64,
}

impl FieldDescriptor {
    pub fn new(field: FieldId) -> Self {
        Self {
            field,
            fetch_referenced_fields: false,
            item_limit: None,
            include_lazy: false,
            key_extractor: None,
            refresh_token: 0,
        }
    }

    /// Descriptor for a reference whose target should be fetched as well.
    pub fn reference(field: FieldId) -> Self {
        Self::new(field).fetching_referenced_fields()
    }

    /// Descriptor for a collection, optionally limited.
    pub fn collection(field: FieldId, item_limit: Option<usize>) -> Self {
        Self {
            item_limit,
            ..Self::new(field)
        }
    }

    #[must_use]
    pub fn fetching_referenced_fields(mut self) -> Self {
        self.fetch_referenced_fields = true;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.item_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_lazy(mut self) -> Self {
        self.include_lazy = true;
        self
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: u64) -> Self {
        self.refresh_token = token;
        self
    }

    #[must_use]
    pub fn with_key_extractor(mut self, extractor: impl Fn(&Key) + Send + Sync + 'static) -> Self {
        self.key_extractor = Some(Arc::new(extractor));
        self
    }

    /// Merge another request for the same field into this one.
    ///
    /// The result is the most permissive of both: no limit beats any limit,
    /// a larger limit beats a smaller one, flags are combined, and the newest
    /// refresh token wins. Both key extractors keep being called.
    pub fn merge(&mut self, other: &FieldDescriptor) {
        debug_assert_eq!(self.field, other.field);
        self.item_limit = match (self.item_limit, other.item_limit) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        self.fetch_referenced_fields |= other.fetch_referenced_fields;
        self.include_lazy |= other.include_lazy;
        self.refresh_token = self.refresh_token.max(other.refresh_token);
        self.key_extractor = match (self.key_extractor.take(), &other.key_extractor) {
            (None, other) => other.clone(),
            (Some(mine), None) => Some(mine),
            (Some(mine), Some(theirs)) if Arc::ptr_eq(&mine, theirs) => Some(mine),
            (Some(mine), Some(theirs)) => {
                let theirs = Arc::clone(theirs);
                Some(Arc::new(move |key: &Key| {
                    mine(key);
                    theirs(key);
                }))
            }
        };
    }

    /// Call the key extractor, if any.
    pub fn notify(&self, key: &Key) {
        if let Some(extractor) = &self.key_extractor {
            extractor(key);
        }
    }

    /// Whether anything beyond the owner's own columns is wanted for a
    /// reference field.
    pub(crate) fn follows_reference(&self) -> bool {
        self.fetch_referenced_fields || self.key_extractor.is_some()
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("field", &self.field)
            .field("fetch_referenced_fields", &self.fetch_referenced_fields)
            .field("item_limit", &self.item_limit)
            .field("include_lazy", &self.include_lazy)
            .field("key_extractor", &self.key_extractor.is_some())
            .field("refresh_token", &self.refresh_token)
            .finish()
    }
}

impl PartialEq for FieldDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field
    }
}

impl Eq for FieldDescriptor {}

impl Hash for FieldDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.field.hash(state);
    }
}

/// Descriptors for the default fields of `type_id`: every non-lazy column
/// and reference field. References are not followed.
pub fn default_descriptors(model: &ModelRegistry, type_id: TypeId) -> Vec<FieldDescriptor> {
    model
        .default_fields(type_id)
        .map(|f| FieldDescriptor::new(f.id))
        .collect()
}

/// [`default_descriptors`], plus lazy fields when `include_lazy` is set.
pub(crate) fn target_descriptors(
    model: &ModelRegistry,
    type_id: TypeId,
    include_lazy: bool,
) -> Vec<FieldDescriptor> {
    if !include_lazy {
        return default_descriptors(model, type_id);
    }
    model
        .type_info(type_id)
        .into_iter()
        .flat_map(|t| t.fields.iter())
        .filter(|f| !f.is_collection())
        .map(|f| FieldDescriptor::new(f.id))
        .collect()
}

/// Collapse descriptors naming the same field, keeping first-seen order.
pub fn merge_descriptors(
    descriptors: impl IntoIterator<Item = FieldDescriptor>,
) -> Vec<FieldDescriptor> {
    let mut out: Vec<FieldDescriptor> = Vec::new();
    for descriptor in descriptors {
        match out.iter_mut().find(|d| d.field == descriptor.field) {
            Some(existing) => existing.merge(&descriptor),
            None => out.push(descriptor),
        }
    }
    out
}
