//! Persistent model metadata.
//!
//! The [`ModelRegistry`] describes every persistent type the engine can fetch:
//! its column layout, its fields and the associations behind its collection
//! fields. Registries are immutable once built and are shared via `Arc`.
//!
//! # Column layout
//!
//! Every entity type stores its columns as `[key columns.., type discriminator,
//! other columns..]`. A derived type's layout extends its base type's layout,
//! so a column index resolved against a base type is valid for every
//! descendant. Interfaces have no layout of their own; their fields are mapped
//! onto implementor fields by name.
//!
//! # Example
//!
//! ```
//! use graphfetch_core::ModelBuilder;
//!
//! let mut m = ModelBuilder::new();
//! let customer = m.declare("Customer");
//! let order = m.declare("Order");
//! m.entity(order).key("id").reference("customer", customer).column("total").finish().unwrap();
//! let paired = m.field_id(order, "customer").unwrap();
//! m.entity(customer)
//!     .key("id")
//!     .column("name")
//!     .one_to_many("orders", order, paired)
//!     .finish()
//!     .unwrap();
//! let model = m.build().unwrap();
//!
//! assert!(model.is_leaf(order));
//! assert_eq!(model.type_info(order).unwrap().column_count(), 4);
//! ```

use crate::error::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a persistent type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TypeId(pub u32);

/// Identifier of a persistent field. Inherited fields keep their declaring id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FieldId(pub u32);

/// Whether a type is a concrete entity or an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Entity,
    Interface,
}

/// The shape of an association behind a collection field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// Members reference their owner through `paired_reference` on the target type.
    OneToMany { paired_reference: FieldId },
    /// Members are linked through rows of an auxiliary type holding a `master`
    /// reference (to the owner) and a `slave` reference (to the member).
    ManyToMany {
        auxiliary: TypeId,
        master: FieldId,
        slave: FieldId,
    },
}

/// Association metadata for a collection field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationInfo {
    pub target: TypeId,
    pub kind: AssociationKind,
}

/// What a field stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain column(s).
    Column,
    /// To-one reference; the field's columns hold the foreign key.
    Reference { target: TypeId },
    /// To-many collection; the field has no columns on the owner.
    Collection(AssociationInfo),
}

/// Metadata for one persistent field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub id: FieldId,
    pub name: String,
    pub declaring_type: TypeId,
    /// Column indexes in the owning type's layout.
    pub columns: Vec<usize>,
    /// Lazy fields are skipped unless a descriptor asks for them.
    pub lazy: bool,
    pub kind: FieldKind,
}

impl FieldInfo {
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference { .. })
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, FieldKind::Collection(_))
    }

    /// Target type of a reference field.
    pub fn reference_target(&self) -> Option<TypeId> {
        match self.kind {
            FieldKind::Reference { target } => Some(target),
            _ => None,
        }
    }

    /// Association of a collection field.
    pub fn association(&self) -> Option<&AssociationInfo> {
        match &self.kind {
            FieldKind::Collection(assoc) => Some(assoc),
            _ => None,
        }
    }
}

/// Metadata for one persistent type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: String,
    pub kind: TypeKind,
    pub is_abstract: bool,
    pub base: Option<TypeId>,
    /// Interfaces implemented directly by this type.
    pub interfaces: Vec<TypeId>,
    pub hierarchy_root: TypeId,
    pub key_column_count: usize,
    /// Column names in layout order.
    pub columns: Vec<String>,
    /// Own and inherited fields.
    pub fields: Vec<FieldInfo>,
}

impl TypeInfo {
    /// A leaf type is a concrete, non-abstract entity type.
    pub fn is_leaf(&self) -> bool {
        self.kind == TypeKind::Entity && !self.is_abstract
    }

    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }

    /// Index of the type discriminator column.
    pub fn type_column(&self) -> usize {
        self.key_column_count
    }

    /// Indexes of the key columns plus the type discriminator.
    pub fn system_columns(&self) -> std::ops::RangeInclusive<usize> {
        0..=self.key_column_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Immutable registry of persistent types.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    types: Vec<TypeInfo>,
    field_owners: HashMap<FieldId, TypeId>,
}

impl ModelRegistry {
    pub fn type_info(&self, id: TypeId) -> Option<&TypeInfo> {
        self.types.get(id.0 as usize)
    }

    /// Like [`type_info`](Self::type_info) but fails with a usage error.
    pub fn require_type(&self, id: TypeId) -> Result<&TypeInfo> {
        self.type_info(id)
            .ok_or_else(|| Error::incompatible_type(format!("unknown type {:?}", id)))
    }

    pub fn type_by_name(&self, name: &str) -> Option<&TypeInfo> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeInfo> {
        self.types.iter()
    }

    /// Field metadata as declared on its declaring type.
    pub fn field(&self, id: FieldId) -> Option<&FieldInfo> {
        let owner = self.field_owners.get(&id)?;
        self.type_info(*owner)?.field(id)
    }

    pub fn type_name(&self, id: TypeId) -> &str {
        self.type_info(id).map_or("<unknown>", |t| t.name.as_str())
    }

    pub fn is_leaf(&self, id: TypeId) -> bool {
        self.type_info(id).is_some_and(TypeInfo::is_leaf)
    }

    pub fn hierarchy_root(&self, id: TypeId) -> Option<TypeId> {
        self.type_info(id).map(|t| t.hierarchy_root)
    }

    /// `id` followed by its base types, nearest first.
    pub fn ancestors(&self, id: TypeId) -> impl Iterator<Item = TypeId> + '_ {
        std::iter::successors(Some(id), move |t| self.type_info(*t).and_then(|t| t.base))
    }

    /// Whether an instance of `from` can be used where `to` is expected.
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        self.ancestors(from).any(|t| {
            t == to
                || self
                    .type_info(t)
                    .is_some_and(|info| info.interfaces.contains(&to))
        })
    }

    /// Whether a key of type `key_type` may be requested as `declared`.
    ///
    /// Types are compatible when they share a hierarchy, or when one is an
    /// interface implemented by the other.
    pub fn are_compatible(&self, key_type: TypeId, declared: TypeId) -> bool {
        let (Some(a), Some(b)) = (self.type_info(key_type), self.type_info(declared)) else {
            return false;
        };
        if a.kind == TypeKind::Entity && b.kind == TypeKind::Entity {
            return a.hierarchy_root == b.hierarchy_root;
        }
        self.is_assignable(key_type, declared) || self.is_assignable(declared, key_type)
    }

    /// Resolve `field` against `type_id`.
    ///
    /// Fields declared on the type or its bases resolve directly. Interface
    /// fields resolve to the implementor's field with the same name.
    pub fn resolve_field(&self, type_id: TypeId, field: FieldId) -> Option<&FieldInfo> {
        let info = self.type_info(type_id)?;
        if let Some(own) = info.field(field) {
            return Some(own);
        }
        let declared = self.field(field)?;
        if self.is_assignable(type_id, declared.declaring_type)
            && self
                .type_info(declared.declaring_type)
                .is_some_and(TypeInfo::is_interface)
        {
            return info.field_by_name(&declared.name);
        }
        None
    }

    /// Fields fetched when a type is loaded with its "default" fields:
    /// every non-lazy column and reference field.
    pub fn default_fields(&self, type_id: TypeId) -> impl Iterator<Item = &FieldInfo> {
        self.type_info(type_id)
            .into_iter()
            .flat_map(|t| t.fields.iter())
            .filter(|f| !f.lazy && !f.is_collection())
    }
}

/// Builder for a [`ModelRegistry`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    names: Vec<String>,
    defined: Vec<Option<TypeInfo>>,
    next_field: u32,
}

#[derive(Debug)]
enum PendingKind {
    Column,
    Reference { target: TypeId, width: usize },
    Collection(AssociationInfo),
}

#[derive(Debug)]
struct PendingField {
    name: String,
    lazy: bool,
    kind: PendingKind,
}

/// Builder for a single type, obtained from [`ModelBuilder::entity`] or
/// [`ModelBuilder::interface`].
#[derive(Debug)]
pub struct TypeBuilder<'a> {
    model: &'a mut ModelBuilder,
    id: TypeId,
    kind: TypeKind,
    is_abstract: bool,
    base: Option<TypeId>,
    interfaces: Vec<TypeId>,
    keys: Vec<String>,
    fields: Vec<PendingField>,
}

fn model_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}

impl ModelBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a type id so that other types can reference it before it is defined.
    pub fn declare(&mut self, name: impl Into<String>) -> TypeId {
        let id = TypeId(u32::try_from(self.names.len()).unwrap_or(u32::MAX));
        self.names.push(name.into());
        self.defined.push(None);
        id
    }

    /// Start defining a declared entity type.
    pub fn entity(&mut self, id: TypeId) -> TypeBuilder<'_> {
        self.type_builder(id, TypeKind::Entity)
    }

    /// Start defining a declared interface type.
    pub fn interface(&mut self, id: TypeId) -> TypeBuilder<'_> {
        self.type_builder(id, TypeKind::Interface)
    }

    fn type_builder(&mut self, id: TypeId, kind: TypeKind) -> TypeBuilder<'_> {
        TypeBuilder {
            model: self,
            id,
            kind,
            is_abstract: false,
            base: None,
            interfaces: Vec::new(),
            keys: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Look up the id of a field on an already defined type.
    pub fn field_id(&self, type_id: TypeId, name: &str) -> Result<FieldId> {
        self.defined
            .get(type_id.0 as usize)
            .and_then(Option::as_ref)
            .and_then(|t| t.field_by_name(name))
            .map(|f| f.id)
            .ok_or_else(|| model_error(format!("no field '{name}' on type {:?}", type_id)))
    }

    fn next_field_id(&mut self) -> FieldId {
        let id = FieldId(self.next_field);
        self.next_field += 1;
        id
    }

    /// Validate cross-type references and produce the registry.
    pub fn build(self) -> Result<ModelRegistry> {
        let mut types = Vec::with_capacity(self.defined.len());
        for (idx, t) in self.defined.into_iter().enumerate() {
            match t {
                Some(t) => types.push(t),
                None => {
                    return Err(model_error(format!(
                        "type '{}' was declared but never defined",
                        self.names[idx]
                    )));
                }
            }
        }

        let mut registry = ModelRegistry {
            types,
            field_owners: HashMap::new(),
        };
        for t in &registry.types {
            for f in &t.fields {
                if f.declaring_type == t.id {
                    registry.field_owners.insert(f.id, t.id);
                }
            }
        }

        for t in &registry.types {
            for f in &t.fields {
                match &f.kind {
                    FieldKind::Column => {}
                    FieldKind::Reference { target } => {
                        let target = registry.require_type(*target)?;
                        if target.key_column_count != f.columns.len() {
                            return Err(model_error(format!(
                                "reference '{}.{}' has {} columns but '{}' has {} key columns",
                                t.name,
                                f.name,
                                f.columns.len(),
                                target.name,
                                target.key_column_count
                            )));
                        }
                    }
                    FieldKind::Collection(assoc) => {
                        registry.require_type(assoc.target)?;
                        let refs: Vec<FieldId> = match &assoc.kind {
                            AssociationKind::OneToMany { paired_reference } => {
                                vec![*paired_reference]
                            }
                            AssociationKind::ManyToMany { master, slave, .. } => {
                                vec![*master, *slave]
                            }
                        };
                        for r in refs {
                            if !registry.field(r).is_some_and(FieldInfo::is_reference) {
                                return Err(model_error(format!(
                                    "collection '{}.{}' names a non-reference field {:?}",
                                    t.name, f.name, r
                                )));
                            }
                        }
                    }
                }
            }
            for iface in &t.interfaces {
                let iface = registry.require_type(*iface)?;
                for f in &iface.fields {
                    if t.is_leaf() && t.field_by_name(&f.name).is_none() {
                        return Err(model_error(format!(
                            "'{}' does not implement '{}.{}'",
                            t.name, iface.name, f.name
                        )));
                    }
                }
            }
        }

        tracing::debug!(types = registry.types.len(), "Model registry built");
        Ok(registry)
    }
}

impl TypeBuilder<'_> {
    /// Derive from an already defined base type, inheriting its layout.
    #[must_use]
    pub fn base(mut self, base: TypeId) -> Self {
        self.base = Some(base);
        self
    }

    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    #[must_use]
    pub fn implements(mut self, iface: TypeId) -> Self {
        self.interfaces.push(iface);
        self
    }

    /// Add a key column. Only hierarchy roots declare keys.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.keys.push(name.into());
        self
    }

    #[must_use]
    pub fn column(self, name: impl Into<String>) -> Self {
        self.push(name, false, PendingKind::Column)
    }

    #[must_use]
    pub fn lazy_column(self, name: impl Into<String>) -> Self {
        self.push(name, true, PendingKind::Column)
    }

    /// Single-column reference to `target`.
    #[must_use]
    pub fn reference(self, name: impl Into<String>, target: TypeId) -> Self {
        self.reference_with(name, target, 1)
    }

    /// Reference to `target` whose foreign key spans `width` columns.
    #[must_use]
    pub fn reference_with(self, name: impl Into<String>, target: TypeId, width: usize) -> Self {
        self.push(name, false, PendingKind::Reference { target, width })
    }

    #[must_use]
    pub fn one_to_many(
        self,
        name: impl Into<String>,
        target: TypeId,
        paired_reference: FieldId,
    ) -> Self {
        let assoc = AssociationInfo {
            target,
            kind: AssociationKind::OneToMany { paired_reference },
        };
        self.push(name, false, PendingKind::Collection(assoc))
    }

    #[must_use]
    pub fn many_to_many(
        self,
        name: impl Into<String>,
        target: TypeId,
        auxiliary: TypeId,
        master: FieldId,
        slave: FieldId,
    ) -> Self {
        let assoc = AssociationInfo {
            target,
            kind: AssociationKind::ManyToMany {
                auxiliary,
                master,
                slave,
            },
        };
        self.push(name, false, PendingKind::Collection(assoc))
    }

    fn push(mut self, name: impl Into<String>, lazy: bool, kind: PendingKind) -> Self {
        self.fields.push(PendingField {
            name: name.into(),
            lazy,
            kind,
        });
        self
    }

    /// Finish the type definition and store it in the model builder.
    pub fn finish(self) -> Result<TypeId> {
        let TypeBuilder {
            model,
            id,
            kind,
            is_abstract,
            base,
            interfaces,
            keys,
            fields: pending,
        } = self;

        let name = model
            .names
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| model_error(format!("type {:?} was never declared", id)))?;
        if model.defined[id.0 as usize].is_some() {
            return Err(model_error(format!("type '{name}' defined twice")));
        }

        let (mut columns, mut fields, key_column_count, hierarchy_root) = match base {
            Some(base_id) => {
                if !keys.is_empty() {
                    return Err(model_error(format!(
                        "derived type '{name}' cannot declare key columns"
                    )));
                }
                let base_info = model
                    .defined
                    .get(base_id.0 as usize)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| {
                        model_error(format!("base of '{name}' must be defined first"))
                    })?;
                (
                    base_info.columns.clone(),
                    base_info.fields.clone(),
                    base_info.key_column_count,
                    base_info.hierarchy_root,
                )
            }
            None if kind == TypeKind::Interface => (Vec::new(), Vec::new(), 0, id),
            None => {
                if keys.is_empty() {
                    return Err(model_error(format!("root type '{name}' has no key")));
                }
                let mut columns = keys.clone();
                columns.push("__type".to_string());
                let mut fields = Vec::new();
                for (idx, key) in keys.iter().enumerate() {
                    let field_id = model.next_field_id();
                    fields.push(FieldInfo {
                        id: field_id,
                        name: key.clone(),
                        declaring_type: id,
                        columns: vec![idx],
                        lazy: false,
                        kind: FieldKind::Column,
                    });
                }
                (columns, fields, keys.len(), id)
            }
        };

        for p in pending {
            if fields.iter().any(|f: &FieldInfo| f.name == p.name) {
                return Err(model_error(format!("duplicate field '{name}.{}'", p.name)));
            }
            let width = match &p.kind {
                PendingKind::Column => 1,
                PendingKind::Reference { width, .. } => *width,
                PendingKind::Collection(_) => 0,
            };
            let field_columns: Vec<usize> = if kind == TypeKind::Interface {
                Vec::new()
            } else {
                (0..width)
                    .map(|i| {
                        columns.push(if width == 1 {
                            p.name.clone()
                        } else {
                            format!("{}_{i}", p.name)
                        });
                        columns.len() - 1
                    })
                    .collect()
            };
            let field_kind = match p.kind {
                PendingKind::Column => FieldKind::Column,
                PendingKind::Reference { target, .. } => FieldKind::Reference { target },
                PendingKind::Collection(assoc) => FieldKind::Collection(assoc),
            };
            let field_id = model.next_field_id();
            fields.push(FieldInfo {
                id: field_id,
                name: p.name,
                declaring_type: id,
                columns: field_columns,
                lazy: p.lazy,
                kind: field_kind,
            });
        }

        model.defined[id.0 as usize] = Some(TypeInfo {
            id,
            name,
            kind,
            is_abstract,
            base,
            interfaces,
            hierarchy_root,
            key_column_count,
            columns,
            fields,
        });
        Ok(id)
    }
}
