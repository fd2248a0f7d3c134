//! Reconstruction of nested resources from flat rows.
//!
//! The rows of a search contain one row per combination of array elements of each resource. Rows
//! of the same resource are adjacent, and within a resource they are ordered by element index, so
//! a resource (or an array element) is rebuilt from the group of rows sharing its id, in the order
//! the ids are first seen.

use super::{lift, Record};
use crate::{
    error::{Error, Result},
    resource::{
        query::Projection,
        schema::ID_FIELD,
        value::{Id, Value},
    },
    sql::db,
};
use std::collections::BTreeMap;

/// Rebuild the resources contained in `rows` according to `projection`.
pub fn format(projection: &Projection, rows: &[Record]) -> Result<Vec<Value>> {
    let Projection::Object { fields, .. } = projection else {
        return Err(malformed("root projection is not an object"));
    };
    let Some(Projection::Value { alias: id, .. }) = fields.get(ID_FIELD) else {
        return Err(malformed("root projection does not include the resource id"));
    };
    let rows = rows.iter().collect::<Vec<_>>();
    group(&rows, id)?
        .into_iter()
        .map(|rows| build(projection, &rows))
        .collect()
}

/// Split `rows` into groups sharing the value of `alias`, in order of first appearance.
///
/// Rows where `alias` is `NULL` (an outer join which matched nothing) belong to no group.
fn group<'a>(rows: &[&'a Record], alias: &str) -> Result<Vec<Vec<&'a Record>>> {
    let mut groups: Vec<(db::Value, Vec<&'a Record>)> = vec![];
    for &row in rows {
        let key = get(row, alias)?;
        if key.is_null() {
            continue;
        }
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    Ok(groups.into_iter().map(|(_, group)| group).collect())
}

fn build(projection: &Projection, rows: &[&Record]) -> Result<Value> {
    let Some(first) = rows.first() else {
        return Ok(Value::Null);
    };
    Ok(match projection {
        Projection::Value { alias, ty } => lift(*ty, get(first, alias)?)?,
        Projection::Null => Value::Null,
        Projection::Object { presence, fields } => {
            if let Some(presence) = presence {
                if !is_present(&get(first, presence)?) {
                    return Ok(Value::Null);
                }
            }
            Value::Object(fields_of(fields, rows)?)
        }
        Projection::Array { presence, id, item } => {
            if !is_present(&get(first, presence)?) {
                return Ok(Value::Null);
            }
            Value::Array(
                group(rows, id)?
                    .into_iter()
                    .map(|rows| build(item, &rows))
                    .collect::<Result<_>>()?,
            )
        }
        Projection::Relation { id, fields } => {
            let id = match get(first, id)? {
                db::Value::Null => return Ok(Value::Null),
                db::Value::Text(id) => Id::from(id),
                value => return Err(malformed(format!("relation id {value} is not text"))),
            };
            let mut fields = fields_of(fields, rows)?;
            fields.insert(ID_FIELD.to_string(), Value::Id(id));
            Value::Object(fields)
        }
    })
}

fn fields_of(
    fields: &BTreeMap<String, Projection>,
    rows: &[&Record],
) -> Result<BTreeMap<String, Value>> {
    fields
        .iter()
        .map(|(name, field)| Ok((name.clone(), build(field, rows)?)))
        .collect()
}

fn is_present(value: &db::Value) -> bool {
    matches!(value, db::Value::Bool(true))
}

fn get(row: &Record, alias: &str) -> Result<db::Value> {
    row.get(alias)
        .cloned()
        .ok_or_else(|| malformed(format!("missing column {alias}")))
}

fn malformed(reason: impl std::fmt::Display) -> Error {
    Error::Backend {
        error: format!("malformed result: {reason}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::schema::ScalarType;

    fn value(alias: &str, ty: ScalarType) -> Projection {
        Projection::Value {
            alias: alias.into(),
            ty,
        }
    }

    fn row<const N: usize>(columns: [(&str, db::Value); N]) -> Record {
        columns
            .into_iter()
            .map(|(alias, value)| (alias.to_string(), value))
            .collect()
    }

    #[test]
    fn test_arrays_and_objects() {
        // users { _id, address { city }, tags [string] }
        let projection = Projection::Object {
            presence: None,
            fields: BTreeMap::from([
                ("_id".to_string(), value("f0", ScalarType::Id)),
                (
                    "address".to_string(),
                    Projection::Object {
                        presence: Some("f1".into()),
                        fields: BTreeMap::from([(
                            "city".to_string(),
                            value("f2", ScalarType::String),
                        )]),
                    },
                ),
                (
                    "tags".to_string(),
                    Projection::Array {
                        presence: "f3".into(),
                        id: "f4".into(),
                        item: Box::new(value("f5", ScalarType::String)),
                    },
                ),
            ]),
        };
        let rows = vec![
            row([
                ("f0", "u1".into()),
                ("f1", true.into()),
                ("f2", "Paris".into()),
                ("f3", true.into()),
                ("f4", "e1".into()),
                ("f5", "a".into()),
            ]),
            row([
                ("f0", "u1".into()),
                ("f1", true.into()),
                ("f2", "Paris".into()),
                ("f3", true.into()),
                ("f4", "e2".into()),
                ("f5", "b".into()),
            ]),
            // No address, and an empty array: the outer join leaves the element columns NULL.
            row([
                ("f0", "u2".into()),
                ("f1", db::Value::Null),
                ("f2", db::Value::Null),
                ("f3", true.into()),
                ("f4", db::Value::Null),
                ("f5", db::Value::Null),
            ]),
            // A null array.
            row([
                ("f0", "u3".into()),
                ("f1", true.into()),
                ("f2", db::Value::Null),
                ("f3", db::Value::Null),
                ("f4", db::Value::Null),
                ("f5", db::Value::Null),
            ]),
        ];

        let results = format(&projection, &rows).unwrap();
        assert_eq!(
            results,
            vec![
                Value::object([
                    ("_id", Value::Id("u1".into())),
                    ("address", Value::object([("city", "Paris".into())])),
                    ("tags", Value::array(["a", "b"])),
                ]),
                Value::object([
                    ("_id", Value::Id("u2".into())),
                    ("address", Value::Null),
                    ("tags", Value::Array(vec![])),
                ]),
                Value::object([
                    ("_id", Value::Id("u3".into())),
                    ("address", Value::object([("city", Value::Null)])),
                    ("tags", Value::Null),
                ]),
            ]
        );
    }

    #[test]
    fn test_relation() {
        let projection = Projection::Object {
            presence: None,
            fields: BTreeMap::from([
                ("_id".to_string(), value("f0", ScalarType::Id)),
                (
                    "manager".to_string(),
                    Projection::Relation {
                        id: "f1".into(),
                        fields: BTreeMap::from([(
                            "name".to_string(),
                            value("f2", ScalarType::String),
                        )]),
                    },
                ),
            ]),
        };
        let rows = vec![
            row([("f0", "u1".into()), ("f1", "u2".into()), ("f2", "Ada".into())]),
            row([
                ("f0", "u2".into()),
                ("f1", db::Value::Null),
                ("f2", db::Value::Null),
            ]),
        ];
        assert_eq!(
            format(&projection, &rows).unwrap(),
            vec![
                Value::object([
                    ("_id", Value::Id("u1".into())),
                    (
                        "manager",
                        Value::object([("_id", Value::Id("u2".into())), ("name", "Ada".into())]),
                    ),
                ]),
                Value::object([("_id", Value::Id("u2".into())), ("manager", Value::Null)]),
            ]
        );
    }

    #[test]
    fn test_malformed() {
        let projection = Projection::Object {
            presence: None,
            fields: BTreeMap::from([("_id".to_string(), value("f0", ScalarType::Id))]),
        };
        let err = format(&projection, &[row([("f1", "u1".into())])]).unwrap_err();
        assert_eq!(err.code(), "BACKEND");
    }
}
