//! Row decoding.
//!
//! Result rows are positional: value `i` belongs to the `i`-th requested
//! column index. The type discriminator holds the name of the row's exact
//! type, which makes every decoded key exact.

use crate::spec::CollectionFetchSpec;
use graphfetch_core::{
    AssociationKind, Error, Key, ModelRegistry, Result, Row, Tuple, TypeError, TypeId, Value,
};

fn type_error(expected: &'static str, actual: impl Into<String>, column: Option<usize>) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.into(),
        column,
    })
}

/// Decode `values` (one per entry of `columns`) into a key and row buffer.
fn decode_values(
    model: &ModelRegistry,
    type_id: TypeId,
    columns: &[usize],
    values: &[Value],
) -> Result<(Key, Tuple)> {
    if values.len() != columns.len() {
        return Err(type_error(
            "one value per requested column",
            format!("{} values for {} columns", values.len(), columns.len()),
            None,
        ));
    }
    let info = model.require_type(type_id)?;
    let type_column = info.type_column();

    let position = |column: usize| columns.iter().position(|c| *c == column);
    let exact = match position(type_column).map(|p| &values[p]) {
        Some(Value::Text(name)) => model
            .type_by_name(name)
            .filter(|t| t.is_leaf() && model.is_assignable(t.id, type_id))
            .ok_or_else(|| {
                type_error(
                    "a leaf type assignable to the requested type",
                    name.clone(),
                    Some(type_column),
                )
            })?,
        Some(other) => return Err(type_error("TEXT", other.type_name(), Some(type_column))),
        None => return Err(type_error("type discriminator column", "absent", None)),
    };

    let mut key_values = Vec::with_capacity(info.key_column_count);
    for column in 0..info.key_column_count {
        let value = position(column)
            .map(|p| values[p].clone())
            .ok_or_else(|| type_error("key column", "absent", Some(column)))?;
        if value.is_null() {
            return Err(type_error("non-null key value", "NULL", Some(column)));
        }
        key_values.push(value);
    }

    let mut tuple = Tuple::new(exact.column_count());
    for (column, value) in columns.iter().zip(values) {
        if *column >= exact.column_count() {
            return Err(type_error(
                "column inside the row's layout",
                format!("column {column}"),
                Some(*column),
            ));
        }
        tuple.set(*column, value.clone());
    }
    let key = Key::exact(model, exact.id, key_values)?;
    Ok((key, tuple))
}

/// Decode a column-fetch row requested as `columns` of `type_id`.
pub fn decode_entity(
    model: &ModelRegistry,
    type_id: TypeId,
    columns: &[usize],
    row: &Row,
) -> Result<(Key, Tuple)> {
    decode_values(model, type_id, columns, row.values())
}

/// A decoded collection row.
#[derive(Debug, Clone)]
pub struct AssociationRow {
    /// The auxiliary row of a many-to-many association.
    pub auxiliary: Option<(Key, Tuple)>,
    /// The collection member.
    pub target: (Key, Tuple),
}

/// Decode a row produced by a [`CollectionFetchSpec`], splitting off the
/// auxiliary row first when the association has one.
pub fn decode_association_row(
    model: &ModelRegistry,
    spec: &CollectionFetchSpec,
    row: &Row,
) -> Result<AssociationRow> {
    let split = spec.auxiliary_columns.len();
    let expected = split + spec.target_columns.len();
    if row.len() != expected {
        return Err(type_error(
            "auxiliary and target values",
            format!("{} values, expected {expected}", row.len()),
            None,
        ));
    }
    let (aux_values, target_values) = row.values().split_at(split);

    let auxiliary = match &spec.association {
        AssociationKind::ManyToMany { auxiliary, .. } => Some(decode_values(
            model,
            *auxiliary,
            &spec.auxiliary_columns,
            aux_values,
        )?),
        AssociationKind::OneToMany { .. } => None,
    };
    let target = decode_values(model, spec.target_type, &spec.target_columns, target_values)?;
    Ok(AssociationRow { auxiliary, target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphfetch_core::ModelBuilder;

    fn model() -> (ModelRegistry, TypeId, TypeId, TypeId) {
        let mut m = ModelBuilder::new();
        let animal = m.declare("Animal");
        let dog = m.declare("Dog");
        let cat = m.declare("Cat");
        m.entity(animal).abstract_type().key("id").column("name").finish().unwrap();
        m.entity(dog).base(animal).column("breed").finish().unwrap();
        m.entity(cat).base(animal).finish().unwrap();
        (m.build().unwrap(), animal, dog, cat)
    }

    fn row(values: Vec<Value>) -> Row {
        let names = (0..values.len()).map(|i| format!("c{i}")).collect();
        Row::new(names, values)
    }

    #[test]
    fn discriminator_makes_keys_exact() {
        let (model, animal, dog, _) = model();
        let (key, tuple) = decode_entity(
            &model,
            animal,
            &[0, 1, 2],
            &row(vec![Value::BigInt(4), "Dog".into(), "Rex".into()]),
        )
        .unwrap();

        assert_eq!(key.type_id(), dog);
        assert!(key.is_exact_type());
        assert_eq!(tuple.len(), 4);
        assert_eq!(tuple.get(2), Some(&Value::Text("Rex".into())));
        assert!(!tuple.is_loaded(3));
    }

    #[test]
    fn malformed_rows_are_type_errors() {
        let (model, animal, dog, _) = model();
        let short = decode_entity(&model, animal, &[0, 1, 2], &row(vec![Value::BigInt(4)]));
        assert!(matches!(short, Err(Error::Type(_))));

        let null_key = decode_entity(&model, animal, &[0, 1], &row(vec![Value::Null, "Dog".into()]));
        assert!(matches!(null_key, Err(Error::Type(_))));

        let bad_type = decode_entity(&model, animal, &[0, 1], &row(vec![Value::BigInt(1), Value::Int(2)]));
        assert!(matches!(bad_type, Err(Error::Type(_))));

        // A Cat row cannot answer a Dog fetch.
        let wrong = decode_entity(&model, dog, &[0, 1], &row(vec![Value::BigInt(1), "Cat".into()]));
        assert!(matches!(wrong, Err(Error::Type(_))));
    }
}
