//! Entity identities.

use crate::error::{Error, Result};
use crate::model::{ModelRegistry, TypeId};
use crate::value::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Immutable identity of one persistent entity.
///
/// A key carries the type it was created with and whether that type is known
/// to be the entity's exact (leaf) type. Equality and hashing only consider
/// the hierarchy root and the key values, so the same entity is one key
/// whether or not its exact type has been discovered yet.
#[derive(Debug, Clone)]
pub struct Key {
    type_id: TypeId,
    hierarchy: TypeId,
    values: Arc<[Value]>,
    exact: bool,
}

impl Key {
    /// Create a key for `type_id`. The key is exact when the type is a leaf.
    pub fn new(model: &ModelRegistry, type_id: TypeId, values: Vec<Value>) -> Result<Self> {
        let exact = model.is_leaf(type_id);
        Self::build(model, type_id, values, exact)
    }

    /// Create a key whose exact type is known to be `type_id`.
    pub fn exact(model: &ModelRegistry, type_id: TypeId, values: Vec<Value>) -> Result<Self> {
        Self::build(model, type_id, values, true)
    }

    fn build(
        model: &ModelRegistry,
        type_id: TypeId,
        values: Vec<Value>,
        exact: bool,
    ) -> Result<Self> {
        let info = model.require_type(type_id)?;
        if info.is_interface() {
            return Err(Error::incompatible_type(format!(
                "cannot build a key for interface '{}'",
                info.name
            )));
        }
        if values.len() != info.key_column_count {
            return Err(Error::incompatible_type(format!(
                "'{}' keys have {} values, got {}",
                info.name,
                info.key_column_count,
                values.len()
            )));
        }
        Ok(Self {
            type_id,
            hierarchy: info.hierarchy_root,
            values: values.into(),
            exact,
        })
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn hierarchy(&self) -> TypeId {
        self.hierarchy
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Whether [`type_id`](Self::type_id) is the entity's exact type.
    pub fn is_exact_type(&self) -> bool {
        self.exact
    }

    /// The same identity with its exact type set to `type_id`.
    #[must_use]
    pub fn with_exact_type(&self, type_id: TypeId) -> Self {
        Self {
            type_id,
            hierarchy: self.hierarchy,
            values: Arc::clone(&self.values),
            exact: true,
        }
    }

    /// Whether any key component is NULL.
    pub fn has_null_component(&self) -> bool {
        self.values.iter().any(Value::is_null)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.hierarchy == other.hierarchy && self.values == other.values
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hierarchy.hash(state);
        self.values.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}(", self.type_id.0, if self.exact { "" } else { "?" })?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", v)?;
        }
        write!(f, ")")
    }
}
