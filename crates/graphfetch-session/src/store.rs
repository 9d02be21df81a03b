//! In-memory entity storage.
//!
//! Rows are stored in the full column layout of their exact type, with the
//! type discriminator holding the type name. Insertion order is kept so that
//! collection results are deterministic.

use graphfetch_core::{
    AssociationKind, ColumnInfo, Error, FieldId, Key, ModelRegistry, Result, Row, TypeId, TypeInfo, Value,
};
use graphfetch_query::{CollectionFetchSpec, ColumnFetchSpec};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredRow {
    key: Key,
    values: Vec<Value>,
}

/// Entity rows kept in memory, addressed by key.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    model: Arc<ModelRegistry>,
    rows: Vec<Option<StoredRow>>,
    index: HashMap<Key, usize>,
}

fn columns_info(info: &TypeInfo, columns: &[usize]) -> Arc<ColumnInfo> {
    let names = columns
        .iter()
        .map(|c| info.columns.get(*c).cloned().unwrap_or_else(|| format!("c{c}")))
        .collect();
    Arc::new(ColumnInfo::new(names))
}

fn project(values: &[Value], columns: &[usize]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| values.get(*c).cloned().unwrap_or(Value::Null))
        .collect()
}

impl MemoryStore {
    pub fn new(model: Arc<ModelRegistry>) -> Self {
        Self {
            model,
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn model(&self) -> &Arc<ModelRegistry> {
        &self.model
    }

    /// Insert (or replace) an entity of leaf type `type_id` from named
    /// column values. Columns not named are NULL.
    pub fn insert(&mut self, type_id: TypeId, values: &[(&str, Value)]) -> Result<Key> {
        let info = self.model.require_type(type_id)?;
        let mut row = vec![Value::Null; info.column_count()];
        for (name, value) in values {
            let column = info.columns.iter().position(|c| c == name).ok_or_else(|| {
                Error::unknown_field(format!("'{}' has no column '{name}'", info.name))
            })?;
            row[column] = value.clone();
        }
        self.insert_row(type_id, row)
    }

    /// Insert (or replace) an entity from a full positional row. The type
    /// discriminator is filled in.
    pub fn insert_row(&mut self, type_id: TypeId, mut values: Vec<Value>) -> Result<Key> {
        let info = self.model.require_type(type_id)?;
        if !info.is_leaf() {
            return Err(Error::incompatible_type(format!(
                "cannot store an instance of non-leaf type '{}'",
                info.name
            )));
        }
        if values.len() != info.column_count() {
            return Err(Error::missing_column(format!(
                "'{}' rows have {} columns, got {}",
                info.name,
                info.column_count(),
                values.len()
            )));
        }
        values[info.type_column()] = Value::Text(info.name.clone());
        let key_values = values[..info.key_column_count].to_vec();
        if key_values.iter().any(Value::is_null) {
            return Err(Error::missing_column(format!(
                "'{}' row has a NULL key column",
                info.name
            )));
        }
        let key = Key::exact(&self.model, type_id, key_values)?;
        let stored = StoredRow {
            key: key.clone(),
            values,
        };
        match self.index.get(&key) {
            Some(&slot) => self.rows[slot] = Some(stored),
            None => {
                self.index.insert(key.clone(), self.rows.len());
                self.rows.push(Some(stored));
            }
        }
        Ok(key)
    }

    /// Delete the entity with `key`.
    pub fn delete(&mut self, key: &Key) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.rows[slot] = None;
                true
            }
            None => false,
        }
    }

    /// Stored values of `key` in its exact type's layout.
    pub fn get(&self, key: &Key) -> Option<&[Value]> {
        let slot = *self.index.get(key)?;
        self.rows[slot].as_ref().map(|r| r.values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn live_rows(&self) -> impl Iterator<Item = &StoredRow> {
        self.rows.iter().flatten()
    }

    fn is_instance(&self, row: &StoredRow, type_id: TypeId) -> bool {
        self.model.is_assignable(row.key.type_id(), type_id)
    }

    /// Rows of `spec.type_id` whose key is in `keys`, in `keys` order.
    pub fn select_columns(&self, spec: &ColumnFetchSpec, keys: &[Key]) -> Result<Vec<Row>> {
        let info = self.model.require_type(spec.type_id)?;
        let columns = columns_info(info, &spec.columns);
        Ok(keys
            .iter()
            .filter_map(|k| self.index.get(k).and_then(|slot| self.rows[*slot].as_ref()))
            .filter(|row| self.is_instance(row, spec.type_id))
            .map(|row| Row::with_columns(Arc::clone(&columns), project(&row.values, &spec.columns)))
            .collect())
    }

    /// Members of `spec.field` for `owner`, honoring the item limit.
    pub fn select_collection(&self, spec: &CollectionFetchSpec, owner: &Key) -> Result<Vec<Row>> {
        let target = self.model.require_type(spec.target_type)?;
        let limit = spec.item_limit.unwrap_or(usize::MAX);
        match &spec.association {
            AssociationKind::OneToMany { paired_reference } => {
                let fk = self.reference_columns(*paired_reference)?;
                let columns = columns_info(target, &spec.target_columns);
                Ok(self
                    .live_rows()
                    .filter(|row| self.is_instance(row, spec.target_type))
                    .filter(|row| project(&row.values, &fk) == owner.values())
                    .take(limit)
                    .map(|row| {
                        Row::with_columns(
                            Arc::clone(&columns),
                            project(&row.values, &spec.target_columns),
                        )
                    })
                    .collect())
            }
            AssociationKind::ManyToMany {
                auxiliary,
                master,
                slave,
            } => {
                let master_fk = self.reference_columns(*master)?;
                let slave_fk = self.reference_columns(*slave)?;
                let aux_info = self.model.require_type(*auxiliary)?;
                let mut names = columns_info(aux_info, &spec.auxiliary_columns).names().to_vec();
                names.extend(columns_info(target, &spec.target_columns).names().iter().cloned());
                let columns = Arc::new(ColumnInfo::new(names));

                let mut rows = Vec::new();
                for link in self
                    .live_rows()
                    .filter(|row| self.is_instance(row, *auxiliary))
                    .filter(|row| project(&row.values, &master_fk) == owner.values())
                {
                    if rows.len() >= limit {
                        break;
                    }
                    let member_values = project(&link.values, &slave_fk);
                    if member_values.iter().any(Value::is_null) {
                        continue;
                    }
                    let member_key = Key::new(&self.model, spec.target_type, member_values)?;
                    let Some(member) = self
                        .index
                        .get(&member_key)
                        .and_then(|slot| self.rows[*slot].as_ref())
                        .filter(|row| self.is_instance(row, spec.target_type))
                    else {
                        continue;
                    };
                    let mut values = project(&link.values, &spec.auxiliary_columns);
                    values.extend(project(&member.values, &spec.target_columns));
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                Ok(rows)
            }
        }
    }

    fn reference_columns(&self, field: FieldId) -> Result<Vec<usize>> {
        self.model
            .field(field)
            .filter(|f| f.is_reference())
            .map(|f| f.columns.clone())
            .ok_or_else(|| Error::unknown_field(format!("{:?} is not a reference field", field)))
    }
}
