//! Two-round execution of a cycle.
//!
//! A cycle runs as a small state machine. [`RoundCoordinator::prepare`] turns
//! the pending work of the current round into queued queries, the driver
//! executes the queue (directly or suspendably), and
//! [`RoundCoordinator::complete`] merges the results and decides whether a
//! second round is needed. Both drivers share these two steps, so direct and
//! suspendable execution cannot drift apart.
//!
//! Round 1 loads every requested entity and collection. Requests that could
//! not be fully planned up front (unknown exact type, unknown foreign key)
//! are re-planned from round 1 results and loaded in round 2. Work raised
//! while completing round 2 is dropped.

use crate::column_index::ColumnIndexCache;
use crate::column_task::{ColumnFetchTask, ColumnTaskKey};
use crate::config::PrefetchConfig;
use crate::cycle::{Cycle, CyclePhase};
use crate::graph::GraphBuilder;
use crate::node::FetchNode;
use crate::request::DeferredReferenceRequest;
use graphfetch_core::{Error, Key, ModelRegistry, Result};
use graphfetch_query::PlanCache;
use graphfetch_session::UnitOfWork;
use std::collections::HashMap;
use tracing::{debug, trace};

pub(crate) struct RoundCoordinator<'a, U> {
    pub uow: &'a mut U,
    pub model: &'a ModelRegistry,
    pub plans: &'a mut PlanCache,
    pub columns: &'a mut ColumnIndexCache,
    pub config: &'a PrefetchConfig,
}

impl<U: UnitOfWork> RoundCoordinator<'_, U> {
    fn builder<'b>(&'b mut self, cycle: &'b mut Cycle) -> GraphBuilder<'b, U> {
        GraphBuilder {
            model: self.model,
            uow: &*self.uow,
            columns: &mut *self.columns,
            cycle,
        }
    }

    /// Queue the current round's queries. Returns `false` once the cycle has
    /// nothing left to execute.
    pub fn prepare(&mut self, cycle: &mut Cycle) -> Result<bool> {
        if cycle.phase == CyclePhase::Done {
            return Ok(false);
        }

        let mut column_tasks: Vec<ColumnFetchTask> = Vec::new();
        let mut by_key: HashMap<ColumnTaskKey, usize> = HashMap::new();
        let mut collection_tasks = Vec::new();
        for node in cycle.nodes_mut() {
            if let Some(root) = node.root.take() {
                let task_key = ColumnTaskKey::new(root.type_id, root.columns);
                let idx = *by_key.entry(task_key.clone()).or_insert_with(|| {
                    column_tasks.push(ColumnFetchTask::new(task_key));
                    column_tasks.len() - 1
                });
                column_tasks[idx].add_key(root.key, root.exact_type_requested);
            }
            collection_tasks.append(&mut node.collections);
        }

        if column_tasks.is_empty() && collection_tasks.is_empty() {
            self.drop_leftovers(cycle);
            cycle.phase = CyclePhase::Done;
            return Ok(false);
        }

        let mut queries = 0;
        for task in &mut column_tasks {
            queries += task.build_and_run(self.uow, self.plans, self.config.max_keys_per_query)?;
        }
        for task in &mut collection_tasks {
            task.build_and_run(self.uow, self.plans)?;
            queries += 1;
        }
        debug!(
            phase = ?cycle.phase,
            column_tasks = column_tasks.len(),
            collection_tasks = collection_tasks.len(),
            queries,
            "Round prepared"
        );
        cycle.column_tasks = column_tasks;
        cycle.collection_tasks = collection_tasks;
        Ok(true)
    }

    /// Merge the results of the round just executed and plan the next one.
    pub fn complete(&mut self, cycle: &mut Cycle, executed: bool) -> Result<()> {
        if executed {
            cycle.batches += 1;
        }

        // Columns first: collection owners and deferred references read the
        // rows merged here.
        for mut task in std::mem::take(&mut cycle.column_tasks) {
            let merge = task.merge_results(self.uow, self.model, &mut cycle.merged)?;
            cycle.missing.extend(merge.missing);
        }
        for mut task in std::mem::take(&mut cycle.collection_tasks) {
            let owner = task.owner();
            let owner_gone = cycle.missing.contains(owner)
                || self.uow.lookup(owner).is_some_and(|s| s.is_removed());
            if owner_gone {
                trace!(owner = %owner, "Collection owner does not exist; dropping its members");
                task.discard_results(self.uow)?;
                continue;
            }
            task.merge_results(self.uow, self.model, &mut cycle.merged)?;
        }

        match cycle.phase {
            CyclePhase::RoundOne => {
                let deferred: Vec<_> = cycle
                    .nodes_mut()
                    .iter_mut()
                    .filter(|n| !n.deferred.is_empty())
                    .map(|n| (n.key.clone(), std::mem::take(&mut n.deferred)))
                    .collect();
                self.resolve_unresolved(cycle)?;
                for (owner, requests) in deferred {
                    self.resolve_deferred(cycle, &owner, &requests)?;
                }
                if cycle.nodes().iter().any(FetchNode::has_work) {
                    cycle.phase = CyclePhase::RoundTwo;
                } else {
                    self.drop_leftovers(cycle);
                    cycle.phase = CyclePhase::Done;
                }
            }
            CyclePhase::RoundTwo => {
                self.drop_leftovers(cycle);
                cycle.phase = CyclePhase::Done;
            }
            CyclePhase::Done => {}
        }
        Ok(())
    }

    /// Notify subscribers of keys whose exact type round 1 revealed, and
    /// request them again with their original descriptors.
    fn resolve_unresolved(&mut self, cycle: &mut Cycle) -> Result<()> {
        let entries = std::mem::take(&mut cycle.unresolved);
        let model = self.model;
        let mut builder = self.builder(cycle);
        for entry in entries {
            let Some(state) = builder.uow.lookup(&entry.key) else {
                trace!(key = %entry.key, "No row for unresolved key");
                continue;
            };
            let exact = state.key();
            if state.is_removed() || !exact.is_exact_type() {
                continue;
            }
            if !model.is_assignable(exact.type_id(), entry.declared) {
                trace!(
                    key = %exact,
                    declared = ?entry.declared,
                    "Exact type is not an instance of the declared type"
                );
                continue;
            }
            if let Some(subscriber) = &entry.subscriber {
                subscriber(exact);
            }
            builder.request(exact, entry.declared, &entry.descriptors, None)?;
        }
        Ok(())
    }

    fn resolve_deferred(
        &mut self,
        cycle: &mut Cycle,
        owner: &Key,
        requests: &[DeferredReferenceRequest],
    ) -> Result<()> {
        let Some(state) = self.uow.lookup(owner) else {
            if cycle.missing.contains(owner) {
                trace!(owner = %owner, "Owner of deferred references does not exist");
                return Ok(());
            }
            return Err(Error::consistency(format!(
                "owner {owner} of a deferred reference is not in the state cache"
            )));
        };
        if state.is_removed() {
            return Ok(());
        }
        let tuple = state.tuple().ok_or_else(|| {
            Error::consistency(format!("owner {owner} is cached without row data"))
        })?;
        let mut builder = self.builder(cycle);
        for request in requests {
            builder.follow_reference(state.key(), tuple, request)?;
        }
        Ok(())
    }

    /// Drop work that would need a third round.
    fn drop_leftovers(&self, cycle: &mut Cycle) {
        let mut notified = 0;
        let unresolved = std::mem::take(&mut cycle.unresolved);
        let dropped = unresolved.len();
        for entry in unresolved {
            let Some(subscriber) = &entry.subscriber else {
                continue;
            };
            let exact = self
                .uow
                .lookup(&entry.key)
                .filter(|s| !s.is_removed() && s.key().is_exact_type())
                .map(|s| s.key().clone());
            if let Some(exact) = exact.filter(|k| self.model.is_assignable(k.type_id(), entry.declared)) {
                subscriber(&exact);
                notified += 1;
            }
        }
        let deferred: usize = cycle
            .nodes_mut()
            .iter_mut()
            .map(|n| std::mem::take(&mut n.deferred).len())
            .sum();
        if dropped > 0 || deferred > 0 {
            debug!(
                unresolved = dropped,
                notified,
                deferred,
                "Dropping work raised during the last round"
            );
        }
    }
}
