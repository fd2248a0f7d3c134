//! Compilation of high-level resource operations into low-level SQL operations.

use super::db::{self, Statement, Violation};
use crate::{
    error::{Error, Result},
    resource::{metadata::Metadata, schema::ScalarType, value::Value},
};
use std::collections::{BTreeMap, BTreeSet};

pub mod delete;
pub mod insert;
pub mod integrity;
pub mod reconstruct;
pub mod register;
pub mod select;
pub mod structure;
pub mod update;

/// A flat row, by column name (or alias).
pub type Record = BTreeMap<String, db::Value>;

/// Normalize an error reported by the database into the resource error taxonomy.
///
/// Constraint violations are mapped back to the logical paths of the offending columns through
/// `metadata`.
pub(crate) fn db_error<E: db::Error>(metadata: &Metadata, err: E) -> Error {
    if err.is_connection() {
        return Error::ConnectionFailed {
            reason: err.to_string(),
        };
    }
    match err.violation() {
        Some(Violation::Unique {
            table,
            column,
            value,
        }) => {
            let path = metadata
                .owner(&table)
                .and_then(|meta| meta.logical_path(&table, &column))
                .unwrap_or(&column)
                .to_string();
            Error::DuplicateResource { path, value }
        }
        Some(Violation::ForeignKey { table, column }) => {
            let owner = metadata.owner(&table);
            Error::ResourceReferenced {
                resource: owner.map_or_else(|| table.clone(), |meta| meta.resource.clone()),
                path: owner
                    .and_then(|meta| meta.logical_path(&table, &column))
                    .unwrap_or(&column)
                    .to_string(),
            }
        }
        None => Error::Backend {
            error: err.to_string(),
        },
    }
}

/// The column type storing scalars of type `ty`.
pub(crate) fn db_type(ty: ScalarType) -> db::Type {
    match ty {
        ScalarType::Boolean => db::Type::Bool,
        ScalarType::Integer => db::Type::Int8,
        ScalarType::Float => db::Type::Float8,
        ScalarType::String | ScalarType::Id => db::Type::Text,
        ScalarType::Date => db::Type::Timestamptz,
        ScalarType::Binary => db::Type::Bytea,
    }
}

/// Convert a scalar (already coerced to its field's type) to a database value.
pub(crate) fn lower(value: Value) -> Result<db::Value> {
    Ok(match value {
        Value::Null => db::Value::Null,
        Value::Bool(b) => db::Value::Bool(b),
        Value::Integer(i) => db::Value::Int8(i),
        Value::Float(x) => db::Value::Float8(x),
        Value::String(s) => db::Value::Text(s),
        Value::Date(date) => db::Value::Timestamp(date),
        Value::Binary(bytes) => db::Value::Bytes(bytes),
        Value::Id(id) => db::Value::Text(id.into_string()),
        value @ (Value::Array(_) | Value::Object(_)) => {
            return Err(Error::Backend {
                error: format!("cannot store {} in a column", value.kind()),
            })
        }
    })
}

/// Convert a database value back to a scalar of type `ty`.
pub(crate) fn lift(ty: ScalarType, value: db::Value) -> Result<Value> {
    Ok(match (ty, value) {
        (_, db::Value::Null) => Value::Null,
        (ScalarType::Boolean, db::Value::Bool(b)) => Value::Bool(b),
        (ScalarType::Integer, db::Value::Int8(i)) => Value::Integer(i),
        (ScalarType::Float, db::Value::Float8(x)) => Value::Float(x),
        (ScalarType::Float, db::Value::Int8(i)) => Value::Float(i as f64),
        (ScalarType::String, db::Value::Text(s)) => Value::String(s),
        (ScalarType::Id, db::Value::Text(s)) => Value::Id(s.into()),
        (ScalarType::Date, db::Value::Timestamp(date)) => Value::Date(date),
        (ScalarType::Binary, db::Value::Bytes(bytes)) => Value::Binary(bytes),
        (ty, value) => {
            return Err(Error::Backend {
                error: format!("column of type {ty} holds unexpected value {value}"),
            })
        }
    })
}

/// An `INSERT` of `records` into `table`.
///
/// Columns missing from some of the records are inserted as `NULL` for those records.
pub(crate) fn insert(table: &str, records: &[Record]) -> Statement {
    let columns = records
        .iter()
        .flat_map(|record| record.keys())
        .cloned()
        .collect::<BTreeSet<_>>();
    let rows = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|col| record.get(col).cloned().unwrap_or(db::Value::Null))
                .collect()
        })
        .collect();
    Statement::Insert {
        table: table.to_string(),
        columns: columns.into_iter().collect(),
        rows,
    }
}
