//! Collection fetch tasks.

use crate::descriptor::FieldDescriptor;
use graphfetch_core::{
    CollectionState, EntityState, Error, FieldId, Key, ModelRegistry, Result, TypeId,
};
use graphfetch_query::{
    CollectionFetchSpec, FetchSpec, PlanCache, QueuedQuery, decode_association_row,
};
use graphfetch_session::{QueryHandle, UnitOfWork};
use std::sync::Arc;
use tracing::debug;

/// Identity of a collection fetch on one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionTaskKey {
    pub field: FieldId,
    pub item_limit: Option<usize>,
}

/// Loads the members of one collection field of one owner.
#[derive(Debug)]
pub struct CollectionFetchTask {
    owner: Key,
    owner_type: TypeId,
    /// The collection field as resolved on `owner_type`.
    field: FieldId,
    descriptor: FieldDescriptor,
    handle: Option<QueryHandle>,
    plan: Option<Arc<FetchSpec>>,
}

impl CollectionFetchTask {
    pub fn new(owner: Key, owner_type: TypeId, field: FieldId, descriptor: FieldDescriptor) -> Self {
        Self {
            owner,
            owner_type,
            field,
            descriptor,
            handle: None,
            plan: None,
        }
    }

    pub fn key(&self) -> CollectionTaskKey {
        CollectionTaskKey {
            field: self.field,
            item_limit: self.descriptor.item_limit,
        }
    }

    pub fn owner(&self) -> &Key {
        &self.owner
    }

    pub fn descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    /// Widen this task with another request for the same field.
    pub fn merge_descriptor(&mut self, other: &FieldDescriptor) {
        self.descriptor.merge(other);
    }

    /// Register the collection query on the unit of work's queue.
    pub fn build_and_run<U: UnitOfWork>(&mut self, uow: &mut U, plans: &mut PlanCache) -> Result<()> {
        let model = Arc::clone(uow.model());
        let info = model.require_type(self.owner_type)?;
        let field = info.field(self.field).ok_or_else(|| {
            Error::unknown_field(format!("'{}' has no field {:?}", info.name, self.field))
        })?;
        let spec = CollectionFetchSpec::new(
            &model,
            self.owner_type,
            field,
            self.descriptor.item_limit,
            self.descriptor.include_lazy,
        )?;
        let plan = plans.intern(FetchSpec::Collection(spec));
        let query = QueuedQuery::collection(Arc::clone(&plan), self.owner.clone());
        self.handle = Some(uow.register_query(query));
        self.plan = Some(plan);
        Ok(())
    }

    /// Write member rows (and association rows) to the state cache and record
    /// the collection on its owner. Returns the member keys in result order.
    pub(crate) fn merge_results<U: UnitOfWork>(
        &mut self,
        uow: &mut U,
        model: &ModelRegistry,
        merged: &mut Vec<Arc<EntityState>>,
    ) -> Result<Vec<Key>> {
        let (Some(handle), Some(plan)) = (self.handle.take(), self.plan.take()) else {
            return Ok(Vec::new());
        };
        let Some(spec) = plan.as_collection() else {
            return Err(Error::InvariantViolation(
                "collection task holds a column plan".to_string(),
            ));
        };

        let mut members = Vec::new();
        for row in uow.take_results(handle)? {
            let decoded = decode_association_row(model, spec, &row)?;
            if let Some((key, tuple)) = decoded.auxiliary {
                merged.push(uow.update_state(key, Some(tuple)));
            }
            let (key, tuple) = decoded.target;
            merged.push(uow.update_state(key.clone(), Some(tuple)));
            members.push(key);
        }

        if uow.lookup(&self.owner).is_none() {
            return Err(Error::consistency(format!(
                "owner {} of collection {:?} is not in the state cache",
                self.owner, self.field
            )));
        }
        let fully_loaded = self
            .descriptor
            .item_limit
            .is_none_or(|limit| members.len() < limit);
        let state = CollectionState {
            members: members.clone(),
            fully_loaded,
            refresh_token: self.descriptor.refresh_token,
        };
        merged.push(uow.update_collection(&self.owner, self.field, state)?);
        debug!(
            owner = %self.owner,
            field = ?self.field,
            members = members.len(),
            fully_loaded,
            "Collection merged"
        );

        for member in &members {
            self.descriptor.notify(member);
        }
        Ok(members)
    }

    /// Drop this task's results without merging them.
    pub(crate) fn discard_results<U: UnitOfWork>(&mut self, uow: &mut U) -> Result<()> {
        self.plan = None;
        if let Some(handle) = self.handle.take() {
            uow.take_results(handle)?;
        }
        Ok(())
    }
}
