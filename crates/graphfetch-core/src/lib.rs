//! Core types for graphfetch.
//!
//! This crate provides the vocabulary shared by the prefetch engine and its
//! collaborators:
//!
//! - [`Key`] identities and the dynamically typed [`Value`]s they are built from
//! - [`Tuple`] row-value buffers and the cached [`EntityState`]
//! - the persistent [`ModelRegistry`] describing types, fields and associations
//! - the [`Error`] taxonomy
//! - `Outcome` / `Cx` re-exports from asupersync for the suspendable execution mode

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod key;
pub mod model;
pub mod row;
pub mod state;
pub mod value;

pub use error::{
    ConfigError, ConsistencyError, Error, QueryError, QueryErrorKind, Result, TypeError,
    UsageError, UsageErrorKind,
};
pub use key::Key;
pub use model::{
    AssociationInfo, AssociationKind, FieldId, FieldInfo, FieldKind, ModelBuilder, ModelRegistry,
    TypeBuilder, TypeId, TypeInfo, TypeKind,
};
pub use row::{ColumnInfo, Row};
pub use state::{CollectionState, EntityState, PersistenceState, Tuple};
pub use value::Value;
