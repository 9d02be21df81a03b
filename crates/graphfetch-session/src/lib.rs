//! Unit of work and in-memory session for graphfetch.
//!
//! `graphfetch-session` is the **unit-of-work layer** the prefetch engine talks
//! to. It owns the shared entity-state cache and the delayed-query queue.
//!
//! # Role In The Architecture
//!
//! - [`UnitOfWork`]: the narrow contract the engine consumes. Lookups and
//!   state updates, query registration, and batch execution in a direct and a
//!   suspendable form.
//! - [`StateCache`]: one copy-on-write [`EntityState`] per key.
//! - [`MemoryStore`] / [`MemorySession`]: a complete in-memory implementation
//!   of the contract, used by tests and examples in place of a database.
//!
//! # Example
//!
//! ```
//! use graphfetch_core::{ModelBuilder, Value};
//! use graphfetch_session::{MemorySession, MemoryStore, UnitOfWork};
//! use std::sync::Arc;
//!
//! let mut m = ModelBuilder::new();
//! let user = m.declare("User");
//! m.entity(user).key("id").column("name").finish().unwrap();
//! let model = Arc::new(m.build().unwrap());
//!
//! let mut store = MemoryStore::new(Arc::clone(&model));
//! let key = store.insert(user, &[("id", Value::BigInt(1)), ("name", "ada".into())]).unwrap();
//!
//! let session = MemorySession::new(store);
//! assert!(session.lookup(&key).is_none());
//! ```
//!
//! [`EntityState`]: graphfetch_core::EntityState

pub mod memory;
pub mod state_cache;
pub mod store;
pub mod unit_of_work;

pub use memory::{ExecutedQuery, MemorySession, SessionStats};
pub use state_cache::StateCache;
pub use store::MemoryStore;
pub use unit_of_work::{QueryHandle, UnitOfWork};
