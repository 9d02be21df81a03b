//! Registration of fetch requests into the cycle's graph.
//!
//! [`GraphBuilder`] is a short-lived view over the scheduler's state that
//! turns one request (a key, a declared type, and field descriptors) into
//! work on the cycle's nodes. No query is built here; that happens when the
//! round coordinator prepares a round.

use crate::column_index::{ColumnIndexCache, ResolvedField};
use crate::cycle::{Cycle, UnresolvedEntry};
use crate::descriptor::{FieldDescriptor, KeyExtractor, merge_descriptors, target_descriptors};
use crate::node::referenced_key;
use crate::request::DeferredReferenceRequest;
use graphfetch_core::{EntityState, Error, Key, ModelRegistry, Result, Tuple, TypeId};
use graphfetch_session::UnitOfWork;
use std::sync::Arc;
use tracing::trace;

pub(crate) struct GraphBuilder<'a, U> {
    pub model: &'a ModelRegistry,
    pub uow: &'a U,
    pub columns: &'a mut ColumnIndexCache,
    pub cycle: &'a mut Cycle,
}

impl<U: UnitOfWork> GraphBuilder<'_, U> {
    /// Register `descriptors` for `key`, requested as `declared`.
    ///
    /// `subscriber` is called with the exact key as soon as it is known,
    /// which may be right away or after round 1.
    ///
    /// Returns the cached state of the entity, if any.
    pub fn request(
        &mut self,
        key: &Key,
        declared: TypeId,
        descriptors: &[FieldDescriptor],
        subscriber: Option<&KeyExtractor>,
    ) -> Result<Option<Arc<EntityState>>> {
        let model = self.model;
        if !model.are_compatible(key.type_id(), declared) {
            return Err(Error::incompatible_type(format!(
                "{key} ('{}') cannot be requested as '{}'",
                model.type_name(key.type_id()),
                model.type_name(declared)
            )));
        }

        let cached = self.uow.lookup(key);
        if let Some(state) = cached.as_ref().filter(|s| s.is_removed()) {
            trace!(key = %key, "Entity is known to be removed");
            return Ok(Some(Arc::clone(state)));
        }

        let (node_key, type_id, exact) = self.resolve_node(key, declared, cached.as_deref());
        if let Some(subscriber) = subscriber.filter(|_| exact) {
            subscriber(&node_key);
        }

        let descriptors = merge_descriptors(descriptors.iter().cloned());
        let resolved = self.columns.resolve(model, type_id, &descriptors)?;
        for (descriptor, field) in descriptors.iter().zip(&resolved.fields) {
            if !matches!(field, ResolvedField::Unresolved) {
                continue;
            }
            // Fields of the declared type are valid once the exact type is known.
            if !exact && declared != type_id && model.resolve_field(declared, descriptor.field).is_some() {
                continue;
            }
            let name = model
                .field(descriptor.field)
                .map_or_else(|| format!("{:?}", descriptor.field), |f| f.name.clone());
            return Err(Error::unknown_field(format!(
                "'{}' has no field '{name}'",
                model.type_name(type_id)
            )));
        }

        let tuple = cached.as_ref().and_then(|s| s.tuple());
        let mut known_fk = Vec::new();
        let node = self.cycle.node_mut(&node_key, type_id);
        let missing: Vec<usize> = resolved
            .columns
            .iter()
            .copied()
            .filter(|c| !tuple.is_some_and(|t| t.is_loaded(*c)))
            .collect();
        if !missing.is_empty() {
            node.root_mut(exact).add_columns(missing);
        }

        for (descriptor, field) in descriptors.iter().zip(&resolved.fields) {
            match field {
                ResolvedField::Column | ResolvedField::Unresolved => {}
                ResolvedField::Reference {
                    field,
                    target,
                    fk_columns,
                } => {
                    if !descriptor.follows_reference() {
                        continue;
                    }
                    let request = DeferredReferenceRequest {
                        field: *field,
                        target: *target,
                        fk_columns: Arc::clone(fk_columns),
                        descriptor: descriptor.clone(),
                    };
                    if tuple.is_some_and(|t| t.values_at(fk_columns).is_some()) {
                        known_fk.push(request);
                    } else {
                        node.add_deferred(request);
                    }
                }
                ResolvedField::Collection { field } => {
                    if let Some(state) = cached.as_ref().and_then(|s| s.collection(*field)) {
                        if state.fully_loaded && descriptor.refresh_token <= state.refresh_token {
                            trace!(
                                key = %node_key,
                                field = ?field,
                                token = descriptor.refresh_token,
                                "Collection already loaded; skipping"
                            );
                            for member in &state.members {
                                descriptor.notify(member);
                            }
                            continue;
                        }
                    }
                    node.add_collection(*field, descriptor);
                }
            }
        }

        if let Some(tuple) = tuple {
            for request in &known_fk {
                self.follow_reference(&node_key, tuple, request)?;
            }
        }

        if !exact {
            trace!(key = %node_key, declared = ?declared, "Exact type unknown; resolving after round one");
            self.cycle.unresolved.push(UnresolvedEntry {
                key: node_key,
                declared,
                descriptors,
                subscriber: subscriber.cloned(),
            });
        }
        Ok(cached)
    }

    /// Known-FK path: request the entity `request` points at from `owner`.
    pub fn follow_reference(
        &mut self,
        owner: &Key,
        tuple: &Tuple,
        request: &DeferredReferenceRequest,
    ) -> Result<()> {
        let Some(target) =
            referenced_key(self.model, owner, tuple, &request.fk_columns, request.target)?
        else {
            trace!(owner = %owner, field = ?request.field, "Null reference");
            return Ok(());
        };
        if request.descriptor.fetch_referenced_fields {
            let descriptors =
                target_descriptors(self.model, request.target, request.descriptor.include_lazy);
            self.request(
                &target,
                request.target,
                &descriptors,
                request.descriptor.key_extractor.as_ref(),
            )?;
        } else {
            let known = self
                .uow
                .lookup(&target)
                .map(|s| s.key().clone())
                .filter(Key::is_exact_type)
                .unwrap_or(target);
            request.descriptor.notify(&known);
        }
        Ok(())
    }

    /// Pick the node key and type for a request, and whether the exact type
    /// is known.
    ///
    /// Only the key itself or an exact key already in the cache make a
    /// request exact. A narrower declared type, even a leaf, only selects
    /// the columns to load; a row of another type must not count as absent.
    fn resolve_node(
        &self,
        key: &Key,
        declared: TypeId,
        cached: Option<&EntityState>,
    ) -> (Key, TypeId, bool) {
        if let Some(state) = cached {
            let known = state.key();
            if known.is_exact_type() {
                return (known.clone(), known.type_id(), true);
            }
        }
        if key.is_exact_type() {
            return (key.clone(), key.type_id(), true);
        }
        let model = self.model;
        let narrower = declared != key.type_id()
            && model.type_info(declared).is_some_and(|t| !t.is_interface())
            && model.is_assignable(declared, key.type_id());
        if narrower {
            return (key.clone(), declared, false);
        }
        (key.clone(), key.type_id(), false)
    }
}
