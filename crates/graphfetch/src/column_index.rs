//! Long-lived cache of descriptor resolution.
//!
//! Resolving a descriptor list against a type (walking inheritance, mapping
//! interface fields by name, collecting column indexes) depends only on the
//! type and the field ids, so the result is cached across cycles.

use crate::descriptor::FieldDescriptor;
use graphfetch_core::{FieldId, FieldKind, ModelRegistry, Result, TypeId};
use graphfetch_query::LruCache;
use graphfetch_query::cache::CacheStats;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ColumnIndexKey {
    type_id: TypeId,
    fields: Vec<FieldId>,
}

/// How one requested field resolved on the node type.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedField {
    Column,
    Reference {
        field: FieldId,
        target: TypeId,
        fk_columns: Arc<[usize]>,
    },
    Collection {
        field: FieldId,
    },
    /// Not declared on the type (or any base or implemented interface).
    Unresolved,
}

/// Resolution of a descriptor list, parallel to the descriptors.
#[derive(Debug)]
pub(crate) struct ResolvedDescriptors {
    /// System columns plus every column and foreign-key column requested.
    pub columns: Arc<[usize]>,
    pub fields: Vec<ResolvedField>,
}

#[derive(Debug)]
pub(crate) struct ColumnIndexCache {
    entries: LruCache<ColumnIndexKey, Arc<ResolvedDescriptors>>,
}

impl ColumnIndexCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn resolve(
        &mut self,
        model: &ModelRegistry,
        type_id: TypeId,
        descriptors: &[FieldDescriptor],
    ) -> Result<Arc<ResolvedDescriptors>> {
        let key = ColumnIndexKey {
            type_id,
            fields: descriptors.iter().map(|d| d.field).collect(),
        };
        let fields = key.fields.clone();
        self.entries
            .try_get_or_insert_with(key, || build(model, type_id, &fields).map(Arc::new))
            .map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.stats()
    }
}

fn build(model: &ModelRegistry, type_id: TypeId, fields: &[FieldId]) -> Result<ResolvedDescriptors> {
    let info = model.require_type(type_id)?;
    let mut columns: BTreeSet<usize> = info.system_columns().collect();
    let resolved = fields
        .iter()
        .map(|id| match model.resolve_field(type_id, *id) {
            None => ResolvedField::Unresolved,
            Some(field) => match &field.kind {
                FieldKind::Column => {
                    columns.extend(field.columns.iter().copied());
                    ResolvedField::Column
                }
                FieldKind::Reference { target } => {
                    columns.extend(field.columns.iter().copied());
                    ResolvedField::Reference {
                        field: field.id,
                        target: *target,
                        fk_columns: field.columns.clone().into(),
                    }
                }
                FieldKind::Collection(_) => ResolvedField::Collection { field: field.id },
            },
        })
        .collect();
    tracing::trace!(type_id = ?type_id, fields = fields.len(), "Resolved descriptor columns");
    Ok(ResolvedDescriptors {
        columns: columns.into_iter().collect::<Vec<_>>().into(),
        fields: resolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphfetch_core::ModelBuilder;

    #[test]
    fn test_resolution_is_cached_and_evicted() {
        let mut m = ModelBuilder::new();
        let a = m.declare("A");
        let b = m.declare("B");
        m.entity(a).key("id").column("x").reference("b", b).finish().unwrap();
        m.entity(b).key("id").column("y").finish().unwrap();
        let x = m.field_id(a, "x").unwrap();
        let rb = m.field_id(a, "b").unwrap();
        let y = m.field_id(b, "y").unwrap();
        let model = m.build().unwrap();

        let mut cache = ColumnIndexCache::new(1);
        let descriptors = [FieldDescriptor::new(x), FieldDescriptor::reference(rb), FieldDescriptor::new(y)];
        let first = cache.resolve(&model, a, &descriptors).unwrap();
        assert_eq!(&*first.columns, &[0, 1, 2, 3]);
        assert!(matches!(first.fields[0], ResolvedField::Column));
        assert!(matches!(first.fields[1], ResolvedField::Reference { target, .. } if target == b));
        assert!(matches!(first.fields[2], ResolvedField::Unresolved));

        let again = cache.resolve(&model, a, &descriptors).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.stats().hits, 1);

        cache.resolve(&model, b, &[FieldDescriptor::new(y)]).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 1);
    }
}
