//! The prefetch scheduler.
//!
//! [`PrefetchScheduler`] collects fetch requests for entity graphs and turns
//! them into a small number of batched queries. Requests only register work;
//! nothing is loaded until [`execute_rounds`](PrefetchScheduler::execute_rounds)
//! runs (or the pending graph grows past
//! [`max_pending_nodes`](PrefetchConfig::max_pending_nodes)).
//!
//! # Example
//!
//! ```ignore
//! let mut scheduler = PrefetchScheduler::new(session);
//! for key in &customer_keys {
//!     scheduler.request_fetch(key, customer, &[FieldDescriptor::collection(orders, None)])?;
//! }
//! let anchor = scheduler.execute_rounds(false)?;
//! // Every customer row and every order collection is now cached.
//! ```

use crate::anchor::{Anchor, AnchorForest, SharedForest, join_anchors};
use crate::column_index::ColumnIndexCache;
use crate::config::PrefetchConfig;
use crate::coordinator::RoundCoordinator;
use crate::cycle::Cycle;
use crate::descriptor::FieldDescriptor;
use crate::graph::GraphBuilder;
use graphfetch_core::{Cx, EntityState, Error, Key, ModelRegistry, Outcome, Result, TypeId};
use graphfetch_query::PlanCache;
use graphfetch_query::cache::CacheStats;
use graphfetch_session::UnitOfWork;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Anchors over cached entity states.
pub type StateAnchors = AnchorForest<Arc<EntityState>>;

/// Owned anchor over cached entity states; released when dropped.
pub type StateAnchor = Anchor<Arc<EntityState>>;

/// Batches prefetch requests against a [`UnitOfWork`].
pub struct PrefetchScheduler<U: UnitOfWork> {
    uow: U,
    model: Arc<ModelRegistry>,
    config: PrefetchConfig,
    columns: ColumnIndexCache,
    plans: PlanCache,
    cycle: Cycle,
    anchors: SharedForest<Arc<EntityState>>,
    task_execution_count: u64,
}

impl<U: UnitOfWork> std::fmt::Debug for PrefetchScheduler<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchScheduler")
            .field("config", &self.config)
            .field("pending_nodes", &self.cycle.node_count())
            .field("anchors", &self.live_anchors())
            .field("task_execution_count", &self.task_execution_count)
            .finish_non_exhaustive()
    }
}

impl<U: UnitOfWork> PrefetchScheduler<U> {
    /// Create a scheduler with the default configuration.
    pub fn new(uow: U) -> Self {
        Self::build(uow, PrefetchConfig::default())
    }

    /// Create a scheduler with `config`, which is validated first.
    pub fn with_config(uow: U, config: PrefetchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(uow, config))
    }

    fn build(uow: U, config: PrefetchConfig) -> Self {
        Self {
            model: Arc::clone(uow.model()),
            columns: ColumnIndexCache::new(config.column_cache_capacity),
            plans: PlanCache::new(config.plan_cache_capacity),
            cycle: Cycle::default(),
            anchors: Arc::new(Mutex::new(AnchorForest::new())),
            task_execution_count: 0,
            config,
            uow,
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<ModelRegistry> {
        &self.model
    }

    pub fn session(&self) -> &U {
        &self.uow
    }

    pub fn session_mut(&mut self) -> &mut U {
        &mut self.uow
    }

    /// Give the unit of work back. Pending requests are dropped.
    pub fn into_session(self) -> U {
        self.uow
    }

    /// Number of anchors still held by callers, joined ones included.
    pub fn live_anchors(&self) -> usize {
        self.anchors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// A new root anchor over the current cached state of `key`.
    pub fn anchor_state(&self, key: &Key) -> Option<StateAnchor> {
        let state = self.uow.lookup(key)?;
        Some(Anchor::new(&self.anchors, vec![state]))
    }

    /// Number of physical batches executed by this scheduler so far.
    pub fn task_execution_count(&self) -> u64 {
        self.task_execution_count
    }

    /// Graph nodes waiting for the next cycle.
    pub fn pending_nodes(&self) -> usize {
        self.cycle.node_count()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.cycle.is_empty()
    }

    /// Statistics of the `(type, fields) -> columns` cache.
    pub fn column_cache_stats(&self) -> CacheStats {
        self.columns.stats()
    }

    pub fn plan_cache_len(&self) -> usize {
        self.plans.len()
    }

    /// Register a prefetch of `descriptors` for `key`, requested as
    /// `declared`.
    ///
    /// Returns an anchor on the entity's cached state when there is one,
    /// joined with the anchor of any cycle this call had to run. The state
    /// stays anchored until the returned handle is dropped.
    #[tracing::instrument(level = "debug", skip(self, key, descriptors), fields(key = %key))]
    pub fn request_fetch(
        &mut self,
        key: &Key,
        declared: TypeId,
        descriptors: &[FieldDescriptor],
    ) -> Result<Option<StateAnchor>> {
        let cached = self.register(key, declared, descriptors)?;
        let anchor = cached.map(|state| Anchor::new(&self.anchors, vec![state]));
        if !self.over_limit() {
            return Ok(anchor);
        }
        debug!(
            nodes = self.cycle.node_count(),
            limit = self.config.max_pending_nodes,
            "Pending graph is full; executing"
        );
        let executed = self.execute_rounds(false)?;
        Ok(join_anchors(anchor, executed))
    }

    /// Suspendable form of [`request_fetch`](Self::request_fetch).
    #[tracing::instrument(level = "debug", skip(self, cx, key, descriptors), fields(key = %key))]
    pub async fn request_fetch_async(
        &mut self,
        cx: &Cx,
        key: &Key,
        declared: TypeId,
        descriptors: &[FieldDescriptor],
    ) -> Outcome<Option<StateAnchor>, Error> {
        let cached = match self.register(key, declared, descriptors) {
            Ok(cached) => cached,
            Err(e) => return Outcome::Err(e),
        };
        let anchor = cached.map(|state| Anchor::new(&self.anchors, vec![state]));
        if !self.over_limit() {
            return Outcome::Ok(anchor);
        }
        match self.execute_rounds_async(cx, false).await {
            Outcome::Ok(executed) => Outcome::Ok(join_anchors(anchor, executed)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn register(
        &mut self,
        key: &Key,
        declared: TypeId,
        descriptors: &[FieldDescriptor],
    ) -> Result<Option<Arc<EntityState>>> {
        let mut builder = GraphBuilder {
            model: &self.model,
            uow: &self.uow,
            columns: &mut self.columns,
            cycle: &mut self.cycle,
        };
        builder.request(key, declared, descriptors, None)
    }

    fn over_limit(&self) -> bool {
        self.cycle.node_count() > self.config.max_pending_nodes
    }

    fn coordinator(&mut self) -> RoundCoordinator<'_, U> {
        RoundCoordinator {
            uow: &mut self.uow,
            model: &self.model,
            plans: &mut self.plans,
            columns: &mut self.columns,
            config: &self.config,
        }
    }

    /// Execute everything requested since the last cycle.
    ///
    /// Returns an anchor over every state written during the cycle, or
    /// `None` when nothing was written. Dropping it releases those states. The pending requests are consumed
    /// even when execution fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn execute_rounds(&mut self, skip_side_effects: bool) -> Result<Option<StateAnchor>> {
        let mut cycle = std::mem::take(&mut self.cycle);
        let mut coordinator = self.coordinator();
        if let Err(e) = drive(&mut coordinator, &mut cycle, skip_side_effects) {
            coordinator.uow.discard_pending();
            debug!(error = %e, nodes = cycle.node_count(), "Prefetch cycle failed");
            return Err(e);
        }
        Ok(self.finish(cycle))
    }

    /// Suspendable form of [`execute_rounds`](Self::execute_rounds).
    ///
    /// Cancellation is observed by the unit of work while it executes a
    /// batch; the cycle is dropped and the cancellation passed through.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn execute_rounds_async(
        &mut self,
        cx: &Cx,
        skip_side_effects: bool,
    ) -> Outcome<Option<StateAnchor>, Error> {
        let mut cycle = std::mem::take(&mut self.cycle);
        let mut coordinator = self.coordinator();
        loop {
            match coordinator.prepare(&mut cycle) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    coordinator.uow.discard_pending();
                    return Outcome::Err(e);
                }
            }
            let executed = match coordinator.uow.execute_queued_async(cx, skip_side_effects).await {
                Outcome::Ok(executed) => executed,
                Outcome::Err(e) => {
                    coordinator.uow.discard_pending();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    coordinator.uow.discard_pending();
                    debug!("Prefetch cycle cancelled");
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    coordinator.uow.discard_pending();
                    return Outcome::Panicked(p);
                }
            };
            if let Err(e) = coordinator.complete(&mut cycle, executed) {
                coordinator.uow.discard_pending();
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(self.finish(cycle))
    }

    fn finish(&mut self, cycle: Cycle) -> Option<StateAnchor> {
        self.task_execution_count += cycle.batches;
        if cycle.node_count() > 0 {
            info!(
                nodes = cycle.node_count(),
                batches = cycle.batches,
                merged = cycle.merged.len(),
                "Prefetch cycle finished"
            );
        }
        if cycle.merged.is_empty() {
            return None;
        }
        Some(Anchor::new(&self.anchors, cycle.merged))
    }
}

fn drive<U: UnitOfWork>(
    coordinator: &mut RoundCoordinator<'_, U>,
    cycle: &mut Cycle,
    skip_side_effects: bool,
) -> Result<()> {
    while coordinator.prepare(cycle)? {
        let executed = coordinator.uow.execute_queued(skip_side_effects)?;
        coordinator.complete(cycle, executed)?;
    }
    Ok(())
}
