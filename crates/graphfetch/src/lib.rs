//! graphfetch - batched two-round graph prefetching.
//!
//! Object-relational runtimes tend to load related entities one row at a
//! time. graphfetch lets callers describe which parts of an entity graph they
//! are about to touch and then loads all of it in a handful of batched queries:
//!
//! - [`PrefetchScheduler`] accumulates fetch requests into a graph of nodes,
//!   plans column and collection queries per type, and executes them in at
//!   most two rounds per cycle
//! - [`FieldDescriptor`]s say which fields to load, how deep to follow a
//!   reference, and how many collection members to bring in
//! - [`Anchor`] handles keep loaded state alive until the caller drops them
//! - [`Prefetcher`] wraps a sequence of keys and prefetches navigation paths
//!   for its elements lazily, in batches
//!
//! Execution runs either directly or in the suspendable mode on an
//! asupersync [`Cx`], which returns an [`Outcome`] so cancellation passes
//! through untouched.
//!
//! # Quick Start
//!
//! ```ignore
//! use graphfetch::prelude::*;
//!
//! let mut scheduler = PrefetchScheduler::new(session);
//! let prefetcher = Prefetcher::new(customer)
//!     .with_path(PrefetchPath::parse(scheduler.model(), customer, "orders.product")?)?;
//!
//! for element in prefetcher.iter(&mut scheduler, customer_keys) {
//!     let element = element?;
//!     // the customer, its orders and their products are cached
//! }
//! ```

pub mod anchor;
pub mod collection_task;
mod column_index;
pub mod column_task;
pub mod config;
mod coordinator;
mod cycle;
pub mod descriptor;
mod graph;
mod node;
pub mod producer;
mod request;
pub mod scheduler;

pub use anchor::{Anchor, AnchorForest, AnchorId, SharedForest, join_anchors};
pub use collection_task::{CollectionFetchTask, CollectionTaskKey};
pub use column_task::{ColumnFetchTask, ColumnTaskKey};
pub use config::PrefetchConfig;
pub use cycle::CyclePhase;
pub use descriptor::{FieldDescriptor, KeyExtractor, default_descriptors, merge_descriptors};
pub use producer::{
    HasKey, PrefetchPath, Prefetched, Prefetcher, PrefetchingIter, prefetch_all_async,
};
pub use scheduler::{PrefetchScheduler, StateAnchor, StateAnchors};

// Re-export the vocabulary callers need alongside the scheduler
pub use graphfetch_core::{
    Cx, EntityState, Error, FieldId, Key, ModelBuilder, ModelRegistry, Outcome, Result, TypeId,
    Value,
};
pub use graphfetch_session::{MemorySession, MemoryStore, UnitOfWork};

/// Everything needed for typical use.
pub mod prelude {
    pub use crate::{
        Cx, Error, FieldDescriptor, Key, ModelBuilder, ModelRegistry, Outcome, PrefetchConfig,
        PrefetchPath, PrefetchScheduler, Prefetcher, Result, StateAnchor, TypeId, UnitOfWork,
        Value,
    };
}
