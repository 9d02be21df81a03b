//! Lazy prefetching over sequences of entities.
//!
//! A [`Prefetcher`] compiles navigation paths such as `"orders.lines.product"`
//! into a tree of field descriptors. Wrapping a sequence of keys with
//! [`Prefetcher::iter`] then prefetches the whole tree for the elements in
//! batches: elements are buffered while their requests accumulate, and each
//! flush walks the tree one level per cycle using the keys discovered by the
//! previous level.
//!
//! ```ignore
//! let prefetcher = Prefetcher::new(customer)
//!     .with_path(PrefetchPath::parse(&model, customer, "orders[20].product")?)?;
//! for element in prefetcher.iter(&mut scheduler, customer_keys) {
//!     let element = element?;
//!     // element.item's orders and their products are cached now
//! }
//! ```

use crate::anchor::join_anchors;
use crate::descriptor::{FieldDescriptor, default_descriptors, merge_descriptors};
use crate::scheduler::{PrefetchScheduler, StateAnchor};
use graphfetch_core::{
    Cx, EntityState, Error, FieldId, Key, ModelRegistry, Outcome, Result, TypeId,
};
use graphfetch_query::{NavigationPath, PathStep};
use graphfetch_session::UnitOfWork;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Anything that identifies an entity.
pub trait HasKey {
    fn key(&self) -> &Key;
}

impl HasKey for Key {
    fn key(&self) -> &Key {
        self
    }
}

impl HasKey for EntityState {
    fn key(&self) -> &Key {
        EntityState::key(self)
    }
}

impl HasKey for Arc<EntityState> {
    fn key(&self) -> &Key {
        EntityState::key(self)
    }
}

impl<T: HasKey + ?Sized> HasKey for &T {
    fn key(&self) -> &Key {
        (**self).key()
    }
}

/// A navigation path to prefetch.
#[derive(Debug, Clone)]
pub struct PrefetchPath {
    path: NavigationPath,
}

impl PrefetchPath {
    /// Parse a dotted path of field names, e.g. `"orders[10].product"`.
    pub fn parse(model: &ModelRegistry, root: TypeId, path: &str) -> Result<Self> {
        NavigationPath::parse(model, root, path).map(Self::from)
    }

    /// Build a path from a chain of fields.
    pub fn from_fields(model: &ModelRegistry, root: TypeId, fields: &[FieldId]) -> Result<Self> {
        NavigationPath::from_fields(model, root, fields).map(Self::from)
    }

    pub fn root(&self) -> TypeId {
        self.path.root()
    }

    pub fn navigation(&self) -> &NavigationPath {
        &self.path
    }
}

impl From<NavigationPath> for PrefetchPath {
    fn from(path: NavigationPath) -> Self {
        Self { path }
    }
}

#[derive(Debug, Clone)]
struct PathNode {
    step: PathStep,
    children: Vec<usize>,
}

/// A compiled set of prefetch paths sharing one root type.
///
/// Paths with a common prefix share tree nodes; a field reached twice at the
/// same position keeps the most permissive item limit.
#[derive(Debug, Clone)]
pub struct Prefetcher {
    root: TypeId,
    nodes: Vec<PathNode>,
    top: Vec<usize>,
    include_root_fields: bool,
    buffer_size: Option<usize>,
}

impl Prefetcher {
    /// A prefetcher that loads the default fields of each `root` element.
    pub fn new(root: TypeId) -> Self {
        Self {
            root,
            nodes: Vec::new(),
            top: Vec::new(),
            include_root_fields: true,
            buffer_size: None,
        }
    }

    /// Compile `paths`, which must all start at `root`.
    pub fn compile(root: TypeId, paths: &[PrefetchPath]) -> Result<Self> {
        paths
            .iter()
            .try_fold(Self::new(root), |prefetcher, path| prefetcher.with_path(path.clone()))
    }

    /// Add a path to the tree.
    pub fn with_path(mut self, path: PrefetchPath) -> Result<Self> {
        if path.root() != self.root {
            return Err(Error::incompatible_type(format!(
                "path '{}' starts at {:?}, expected {:?}",
                path.path,
                path.root(),
                self.root
            )));
        }
        let mut parent: Option<usize> = None;
        for step in path.path.steps() {
            let siblings = match parent {
                Some(idx) => &self.nodes[idx].children,
                None => &self.top,
            };
            let existing = siblings
                .iter()
                .copied()
                .find(|idx| self.nodes[*idx].step.field == step.field);
            let idx = match existing {
                Some(idx) => {
                    let node = &mut self.nodes[idx].step;
                    node.item_limit = match (node.item_limit, step.item_limit) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        _ => None,
                    };
                    idx
                }
                None => {
                    self.nodes.push(PathNode {
                        step: step.clone(),
                        children: Vec::new(),
                    });
                    let idx = self.nodes.len() - 1;
                    match parent {
                        Some(p) => self.nodes[p].children.push(idx),
                        None => self.top.push(idx),
                    }
                    idx
                }
            };
            parent = Some(idx);
        }
        Ok(self)
    }

    /// Do not load the root elements' own default fields; only the paths.
    #[must_use]
    pub fn without_root_fields(mut self) -> Self {
        self.include_root_fields = false;
        self
    }

    /// Flush after this many buffered elements (default: the scheduler's
    /// `max_pending_nodes`).
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size.max(1));
        self
    }

    pub fn root(&self) -> TypeId {
        self.root
    }

    /// Number of distinct path steps in the tree.
    pub fn step_count(&self) -> usize {
        self.nodes.len()
    }

    /// Wrap `source`, prefetching the compiled paths for its elements.
    pub fn iter<'s, I, U>(
        &self,
        scheduler: &'s mut PrefetchScheduler<U>,
        source: I,
    ) -> PrefetchingIter<'s, I::IntoIter, U>
    where
        I: IntoIterator,
        I::Item: HasKey,
        U: UnitOfWork,
    {
        let pipeline = Pipeline::new(self, scheduler);
        PrefetchingIter {
            last_count: scheduler.task_execution_count(),
            scheduler,
            source: source.into_iter(),
            pipeline,
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Suspendable counterpart of [`iter`](Self::iter): prefetch for every
    /// element of `source` and return them all, in order.
    pub async fn collect_async<I, U>(
        &self,
        scheduler: &mut PrefetchScheduler<U>,
        cx: &Cx,
        source: I,
    ) -> Outcome<Vec<Prefetched<I::Item>>, Error>
    where
        I: IntoIterator,
        I::Item: HasKey,
        U: UnitOfWork,
    {
        let mut pipeline = Pipeline::new(self, scheduler);
        let mut out = Vec::new();
        let mut last_count = scheduler.task_execution_count();
        for item in source {
            if !pipeline.root_descriptors.is_empty() {
                let requested = scheduler
                    .request_fetch_async(cx, item.key(), pipeline.root, &pipeline.root_descriptors)
                    .await;
                match requested {
                    Outcome::Ok(anchor) => pipeline.keep(anchor),
                    Outcome::Err(e) => return pipeline.abort(Outcome::Err(e)),
                    Outcome::Cancelled(r) => return pipeline.abort(Outcome::Cancelled(r)),
                    Outcome::Panicked(p) => return pipeline.abort(Outcome::Panicked(p)),
                }
            }
            pipeline.pending.push_back(item);
            if scheduler.task_execution_count() != last_count || pipeline.is_full() {
                match pipeline.flush_async(scheduler, cx).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return pipeline.abort(Outcome::Err(e)),
                    Outcome::Cancelled(r) => return pipeline.abort(Outcome::Cancelled(r)),
                    Outcome::Panicked(p) => return pipeline.abort(Outcome::Panicked(p)),
                }
                last_count = scheduler.task_execution_count();
                out.extend(pipeline.drain(scheduler));
            }
        }
        match pipeline.flush_async(scheduler, cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return pipeline.abort(Outcome::Err(e)),
            Outcome::Cancelled(r) => return pipeline.abort(Outcome::Cancelled(r)),
            Outcome::Panicked(p) => return pipeline.abort(Outcome::Panicked(p)),
        }
        out.extend(pipeline.drain(scheduler));
        pipeline.release();
        Outcome::Ok(out)
    }
}

/// Prefetch `paths` for every element of `source` in the suspendable mode.
pub async fn prefetch_all_async<I, U>(
    scheduler: &mut PrefetchScheduler<U>,
    cx: &Cx,
    source: I,
    root: TypeId,
    paths: &[PrefetchPath],
) -> Outcome<Vec<Prefetched<I::Item>>, Error>
where
    I: IntoIterator,
    I::Item: HasKey,
    U: UnitOfWork,
{
    match Prefetcher::compile(root, paths) {
        Ok(prefetcher) => prefetcher.collect_async(scheduler, cx, source).await,
        Err(e) => Outcome::Err(e),
    }
}

/// An element whose prefetch has completed.
#[derive(Debug)]
pub struct Prefetched<T> {
    pub item: T,
    /// Anchor over the element's cached state. Dropping the element
    /// releases it.
    pub anchor: Option<StateAnchor>,
}

type Discovered = Arc<Mutex<Vec<(usize, Key)>>>;

/// State shared by the direct and suspendable producers.
struct Pipeline<T> {
    root: TypeId,
    root_descriptors: Vec<FieldDescriptor>,
    /// Per path node: the type reached and the descriptors one level deeper.
    nested: Vec<(TypeId, Vec<FieldDescriptor>)>,
    discovered: Discovered,
    pending: VecDeque<T>,
    keep_alive: Option<StateAnchor>,
    buffer_size: usize,
}

impl<T> Pipeline<T> {
    fn new<U: UnitOfWork>(prefetcher: &Prefetcher, scheduler: &PrefetchScheduler<U>) -> Self {
        let discovered: Discovered = Arc::new(Mutex::new(Vec::new()));
        let descriptor = |idx: usize| {
            let node = &prefetcher.nodes[idx];
            let mut d = FieldDescriptor::new(node.step.field);
            d.fetch_referenced_fields = !node.step.is_collection;
            d.item_limit = node.step.item_limit;
            if !node.children.is_empty() {
                let sink = Arc::clone(&discovered);
                d = d.with_key_extractor(move |key| {
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((idx, key.clone()));
                });
            }
            d
        };

        let defaults = if prefetcher.include_root_fields {
            default_descriptors(scheduler.model(), prefetcher.root)
        } else {
            Vec::new()
        };
        let root_descriptors =
            merge_descriptors(defaults.into_iter().chain(prefetcher.top.iter().map(|i| descriptor(*i))));
        let nested = prefetcher
            .nodes
            .iter()
            .map(|n| (n.step.target, n.children.iter().map(|i| descriptor(*i)).collect()))
            .collect();

        Self {
            root: prefetcher.root,
            root_descriptors,
            nested,
            discovered,
            pending: VecDeque::new(),
            keep_alive: None,
            buffer_size: prefetcher
                .buffer_size
                .unwrap_or(scheduler.config().max_pending_nodes),
        }
    }

    fn is_full(&self) -> bool {
        self.pending.len() >= self.buffer_size
    }

    /// Hold `anchor` until the pipeline is released.
    fn keep(&mut self, anchor: Option<StateAnchor>) {
        self.keep_alive = join_anchors(self.keep_alive.take(), anchor);
    }

    fn take_discovered(&self) -> Vec<(usize, Key)> {
        std::mem::take(&mut *self.discovered.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Request the next level for every key discovered so far. Returns
    /// whether anything was requested.
    fn request_discovered<U: UnitOfWork>(&mut self, scheduler: &mut PrefetchScheduler<U>) -> Result<bool> {
        let discovered = self.take_discovered();
        let mut requested = false;
        for (idx, key) in discovered {
            let Some((target, descriptors)) = self.nested.get(idx) else {
                continue;
            };
            if descriptors.is_empty() {
                continue;
            }
            let anchor = scheduler.request_fetch(&key, *target, descriptors)?;
            self.keep(anchor);
            requested = true;
        }
        Ok(requested)
    }

    fn flush<U: UnitOfWork>(&mut self, scheduler: &mut PrefetchScheduler<U>) -> Result<()> {
        loop {
            let anchor = scheduler.execute_rounds(false)?;
            self.keep(anchor);
            if !self.request_discovered(scheduler)? && !scheduler.has_pending_work() {
                return Ok(());
            }
        }
    }

    async fn flush_async<U: UnitOfWork>(
        &mut self,
        scheduler: &mut PrefetchScheduler<U>,
        cx: &Cx,
    ) -> Outcome<(), Error> {
        loop {
            match scheduler.execute_rounds_async(cx, false).await {
                Outcome::Ok(anchor) => self.keep(anchor),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            // Requesting only registers work; execution above is the one
            // suspension point.
            match self.request_discovered(scheduler) {
                Ok(false) if !scheduler.has_pending_work() => return Outcome::Ok(()),
                Ok(_) => {}
                Err(e) => return Outcome::Err(e),
            }
        }
    }

    fn release(&mut self) {
        self.keep_alive = None;
    }

    fn abort<R>(&mut self, outcome: Outcome<R, Error>) -> Outcome<R, Error> {
        self.pending.clear();
        self.release();
        outcome
    }
}

impl<T: HasKey> Pipeline<T> {
    /// Hand out the buffered elements, each with its own anchor.
    fn drain<U: UnitOfWork>(&mut self, scheduler: &PrefetchScheduler<U>) -> Vec<Prefetched<T>> {
        debug!(elements = self.pending.len(), "Prefetched elements ready");
        self.pending
            .drain(..)
            .map(|item| {
                let anchor = scheduler.anchor_state(item.key());
                Prefetched { item, anchor }
            })
            .collect()
    }
}

/// Iterator returned by [`Prefetcher::iter`].
///
/// Yields each source element once its prefetch has completed, in source
/// order. After an error the iterator is exhausted.
pub struct PrefetchingIter<'s, I: Iterator, U: UnitOfWork> {
    scheduler: &'s mut PrefetchScheduler<U>,
    source: I,
    pipeline: Pipeline<I::Item>,
    ready: VecDeque<Prefetched<I::Item>>,
    last_count: u64,
    finished: bool,
}

impl<I, U> PrefetchingIter<'_, I, U>
where
    I: Iterator,
    I::Item: HasKey,
    U: UnitOfWork,
{
    fn push(&mut self, item: I::Item) -> Result<()> {
        if !self.pipeline.root_descriptors.is_empty() {
            let anchor = self.scheduler.request_fetch(
                item.key(),
                self.pipeline.root,
                &self.pipeline.root_descriptors,
            )?;
            self.pipeline.keep(anchor);
        }
        self.pipeline.pending.push_back(item);
        if self.scheduler.task_execution_count() != self.last_count || self.pipeline.is_full() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.pipeline.flush(self.scheduler)?;
        self.last_count = self.scheduler.task_execution_count();
        let drained = self.pipeline.drain(self.scheduler);
        self.ready.extend(drained);
        Ok(())
    }
}

impl<I, U> Iterator for PrefetchingIter<'_, I, U>
where
    I: Iterator,
    I::Item: HasKey,
    U: UnitOfWork,
{
    type Item = Result<Prefetched<I::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ready) = self.ready.pop_front() {
                return Some(Ok(ready));
            }
            if self.finished {
                return None;
            }
            let step = match self.source.next() {
                Some(item) => self.push(item),
                None => {
                    self.finished = true;
                    self.flush()
                }
            };
            if let Err(e) = step {
                self.finished = true;
                self.pipeline.pending.clear();
                self.pipeline.release();
                return Some(Err(e));
            }
        }
    }
}
