//! Declarative fetch specifications for graphfetch.
//!
//! The prefetch engine never builds query text. It describes what it needs as
//! a [`FetchSpec`]: either the columns of a type's primary index filtered by a
//! set of keys, or the members of a collection for one owner. Specifications
//! are interned in a bounded [`PlanCache`] and handed to the unit of work as a
//! [`QueuedQuery`] together with their parameters.
//!
//! This crate also provides:
//!
//! - [`decode`]: turning result rows back into keys and row-value buffers
//! - [`path`]: dotted navigation paths such as `"orders.lines[10].product"`

pub mod cache;
pub mod decode;
pub mod path;
pub mod spec;

pub use cache::{LruCache, PlanCache, cache_key};
pub use decode::{AssociationRow, decode_association_row, decode_entity};
pub use path::{NavigationPath, PathStep};
pub use spec::{
    CollectionFetchSpec, ColumnFetchSpec, FetchSpec, QueryParams, QueuedQuery, default_columns,
};
