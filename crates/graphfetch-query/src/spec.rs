//! Fetch specifications.
//!
//! A specification is pure structure: two specifications with the same shape
//! are equal and hash the same, which is what lets the [`PlanCache`] share
//! them across requests.
//!
//! [`PlanCache`]: crate::cache::PlanCache

use graphfetch_core::{
    AssociationKind, Error, FieldId, FieldInfo, Key, ModelRegistry, Result, TypeId, TypeInfo,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Column indexes loaded for `type_id` when it is fetched with its default
/// fields: the key columns, the type discriminator, and the columns of every
/// non-collection field that is not lazy (or every one, with `include_lazy`).
///
/// The result is sorted.
pub fn default_columns(model: &ModelRegistry, type_id: TypeId, include_lazy: bool) -> Result<Vec<usize>> {
    let info = model.require_type(type_id)?;
    let mut columns: BTreeSet<usize> = info.system_columns().collect();
    for field in info.fields.iter().filter(|f| !f.is_collection()) {
        if include_lazy || !field.lazy {
            columns.extend(field.columns.iter().copied());
        }
    }
    Ok(columns.into_iter().collect())
}

fn checked_columns(info: &TypeInfo, columns: impl IntoIterator<Item = usize>) -> Result<Arc<[usize]>> {
    let mut set: BTreeSet<usize> = info.system_columns().collect();
    for c in columns {
        if c >= info.column_count() {
            return Err(Error::missing_column(format!(
                "column {c} is outside the layout of '{}' ({} columns)",
                info.name,
                info.column_count()
            )));
        }
        set.insert(c);
    }
    Ok(set.into_iter().collect::<Vec<_>>().into())
}

/// Select `columns` from the primary index of `type_id`, filtered by key
/// membership.
///
/// The column set always contains the key columns and the type
/// discriminator, so that every result row can be decoded into an exact key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnFetchSpec {
    pub type_id: TypeId,
    /// Sorted column indexes in the layout of `type_id`.
    pub columns: Arc<[usize]>,
}

impl ColumnFetchSpec {
    pub fn new(
        model: &ModelRegistry,
        type_id: TypeId,
        columns: impl IntoIterator<Item = usize>,
    ) -> Result<Self> {
        let info = model.require_type(type_id)?;
        Ok(Self {
            type_id,
            columns: checked_columns(info, columns)?,
        })
    }
}

/// Select the members of one collection field of one owner.
///
/// Result rows hold `auxiliary_columns` values (many-to-many only) followed
/// by `target_columns` values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionFetchSpec {
    pub owner_type: TypeId,
    pub field: FieldId,
    pub target_type: TypeId,
    pub target_columns: Arc<[usize]>,
    pub association: AssociationKind,
    /// Columns of the auxiliary type; empty for one-to-many associations.
    pub auxiliary_columns: Arc<[usize]>,
    pub item_limit: Option<usize>,
}

impl CollectionFetchSpec {
    /// Build the specification for `field` as resolved on `owner_type`.
    pub fn new(
        model: &ModelRegistry,
        owner_type: TypeId,
        field: &FieldInfo,
        item_limit: Option<usize>,
        include_lazy: bool,
    ) -> Result<Self> {
        let owner = model.require_type(owner_type)?;
        let assoc = field.association().ok_or_else(|| {
            Error::incompatible_type(format!(
                "field '{}.{}' is not a collection",
                owner.name, field.name
            ))
        })?;
        let target = model.require_type(assoc.target)?;
        let target_columns = checked_columns(
            target,
            default_columns(model, assoc.target, include_lazy)?,
        )?;
        let auxiliary_columns: Arc<[usize]> = match &assoc.kind {
            AssociationKind::OneToMany { .. } => Arc::from(Vec::new()),
            AssociationKind::ManyToMany { auxiliary, .. } => {
                default_columns(model, *auxiliary, true)?.into()
            }
        };
        Ok(Self {
            owner_type,
            field: field.id,
            target_type: assoc.target,
            target_columns,
            association: assoc.kind.clone(),
            auxiliary_columns,
            item_limit,
        })
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self.association, AssociationKind::ManyToMany { .. })
    }
}

/// Any specification the engine can queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchSpec {
    Columns(ColumnFetchSpec),
    Collection(CollectionFetchSpec),
}

impl FetchSpec {
    pub fn as_columns(&self) -> Option<&ColumnFetchSpec> {
        match self {
            FetchSpec::Columns(spec) => Some(spec),
            FetchSpec::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionFetchSpec> {
        match self {
            FetchSpec::Collection(spec) => Some(spec),
            FetchSpec::Columns(_) => None,
        }
    }
}

/// Parameters bound to a queued specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParams {
    /// Keys a column fetch is filtered by.
    Keys(Vec<Key>),
    /// Owner of a collection fetch.
    Owner(Key),
}

/// A specification together with its parameters, ready for the query queue.
#[derive(Debug, Clone)]
pub struct QueuedQuery {
    pub plan: Arc<FetchSpec>,
    pub params: QueryParams,
}

impl QueuedQuery {
    pub fn columns(plan: Arc<FetchSpec>, keys: Vec<Key>) -> Self {
        Self {
            plan,
            params: QueryParams::Keys(keys),
        }
    }

    pub fn collection(plan: Arc<FetchSpec>, owner: Key) -> Self {
        Self {
            plan,
            params: QueryParams::Owner(owner),
        }
    }

    /// Number of keys a column fetch is filtered by; 1 for a collection fetch.
    pub fn key_count(&self) -> usize {
        match &self.params {
            QueryParams::Keys(keys) => keys.len(),
            QueryParams::Owner(_) => 1,
        }
    }
}
