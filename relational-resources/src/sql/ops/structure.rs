//! Structuring of write payloads into flat records.
//!
//! A payload is a nested [`Value`] shaped like the resource. Structuring validates it against the
//! schema and flattens it following the layout in the resource [metadata]: scalars and presence
//! markers of nested objects land in columns of the main row, and every array element becomes a
//! record of a satellite structure linked to its parent row and to the resource.
//!
//! [metadata]: crate::resource::metadata

use super::{lower, Record};
use crate::{
    error::{Error, Result},
    resource::{
        metadata::{
            join_path, Location, Metadata, ResourceMetadata, INDEX, IS_DELETED, PARENT_ID,
            RESOURCE_ID, VALUE,
        },
        request::Filters,
        schema::{Array, Node, Object, Scalar, Schema, ID_FIELD},
        value::{Id, Value},
    },
    sql::db,
};
use std::collections::{BTreeMap, BTreeSet};

/// How a payload is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The payload describes a whole new resource.
    Create,
    /// The payload describes the fields of an existing resource to replace.
    Update,
}

/// The ids referenced through one relation field of a payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ForeignIds {
    pub path: String,
    /// The referenced resource.
    pub resource: String,
    /// Filters the referenced resources must match.
    pub filters: Filters,
    pub ids: Vec<Id>,
}

/// A payload flattened into records.
#[derive(Clone, Debug, PartialEq)]
pub struct StructuredPayload {
    /// Columns of the main row. On update, only the columns being replaced.
    pub main: Record,
    /// New satellite records, by structure.
    pub records: BTreeMap<String, Vec<Record>>,
    /// Satellite structures whose records for this resource must be deleted before the new
    /// records are inserted.
    pub cleared: BTreeSet<String>,
    /// Every relation in the payload, by path.
    pub foreign_ids: BTreeMap<String, ForeignIds>,
}

/// Validate `payload` and flatten it into the records of resource `id`.
///
/// # Errors
///
/// * `UNKNOWN_FIELD` if the payload contains a field absent from the schema
/// * `MISSING_FIELD` if a required field is omitted (when the enclosing object is written in full)
///   or a required scalar is null. A null object or array is stored as null, required or not.
/// * `INVALID_VALUE` if a value has the wrong type or violates a constraint of its field
pub fn structure(
    schema: &Schema,
    metadata: &Metadata,
    resource: &str,
    id: &Id,
    payload: Value,
    mode: Mode,
) -> Result<StructuredPayload> {
    let res = schema.resource(resource)?;
    let meta = metadata.resource(resource)?;
    let Value::Object(fields) = payload else {
        return Err(Error::invalid_value(
            "",
            format!("expected an object, got {}", payload.kind()),
        ));
    };

    let mut structurer = Structurer {
        meta,
        mode,
        resource_id: id,
        records: Default::default(),
        cleared: Default::default(),
        foreign_ids: Default::default(),
    };
    let mut main = Record::new();
    if mode == Mode::Create {
        main.insert(ID_FIELD.into(), db::Value::Text(id.to_string()));
        if meta.soft_delete {
            main.insert(IS_DELETED.into(), db::Value::Bool(false));
        }
    }
    let mut fields = fields;
    // Resources read back carry their id, so tolerate it in payloads.
    fields.remove(ID_FIELD);
    structurer.fields(
        &Location::root(&res.name),
        "",
        &res.fields,
        fields,
        mode == Mode::Create,
        &mut main,
        id,
    )?;

    tracing::debug!(
        resource,
        ?mode,
        columns = main.len(),
        satellites = structurer.records.len(),
        cleared = structurer.cleared.len(),
        "structured payload"
    );
    Ok(StructuredPayload {
        main,
        records: structurer.records,
        cleared: structurer.cleared,
        foreign_ids: structurer.foreign_ids,
    })
}

struct Structurer<'a> {
    meta: &'a ResourceMetadata,
    mode: Mode,
    resource_id: &'a Id,
    records: BTreeMap<String, Vec<Record>>,
    cleared: BTreeSet<String>,
    foreign_ids: BTreeMap<String, ForeignIds>,
}

impl<'a> Structurer<'a> {
    /// Write the fields of `object` from `payload` into `row`.
    ///
    /// If `full` is set, omitted fields are written as null; otherwise they are left alone.
    #[allow(clippy::too_many_arguments)]
    fn fields(
        &mut self,
        at: &Location,
        path: &str,
        object: &Object,
        payload: BTreeMap<String, Value>,
        full: bool,
        row: &mut Record,
        row_id: &Id,
    ) -> Result<()> {
        if let Some(unknown) = payload.keys().find(|key| !object.fields.contains_key(*key)) {
            return Err(Error::unknown_field(join_path(path, unknown)));
        }
        let mut payload = payload;
        for (name, node) in &object.fields {
            let field_path = join_path(path, name);
            match payload.remove(name) {
                Some(value) => self.node(at, name, &field_path, node, value, full, row, row_id)?,
                None if full => {
                    if node.is_required() {
                        return Err(Error::MissingField { path: field_path });
                    }
                    self.node(at, name, &field_path, node, Value::Null, full, row, row_id)?
                }
                None => {}
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn node(
        &mut self,
        at: &Location,
        name: &str,
        path: &str,
        node: &Node,
        value: Value,
        full: bool,
        row: &mut Record,
        row_id: &Id,
    ) -> Result<()> {
        match node {
            Node::Null => {
                if !value.is_null() {
                    return Err(Error::invalid_value(
                        path,
                        format!("expected null, got {}", value.kind()),
                    ));
                }
            }
            Node::Scalar(scalar) => {
                let value = self.scalar(path, scalar, value)?;
                row.insert(at.column(name), value);
            }
            Node::Object(object) => match value {
                Value::Null => {
                    row.insert(at.column(name), db::Value::Null);
                    self.clear_object(&at.object(name), object, row);
                }
                Value::Object(fields) => {
                    row.insert(at.column(name), db::Value::Bool(true));
                    self.fields(
                        &at.object(name),
                        path,
                        object,
                        fields,
                        full || object.required,
                        row,
                        row_id,
                    )?;
                }
                value => {
                    return Err(Error::invalid_value(
                        path,
                        format!("expected an object, got {}", value.kind()),
                    ))
                }
            },
            Node::Array(array) => match value {
                Value::Null => {
                    row.insert(at.column(name), db::Value::Null);
                    self.clear(&at.array(name).structure);
                }
                Value::Array(items) => {
                    row.insert(at.column(name), db::Value::Bool(true));
                    self.elements(&at.array(name), path, array, items, row_id)?;
                }
                value => {
                    return Err(Error::invalid_value(
                        path,
                        format!("expected an array, got {}", value.kind()),
                    ))
                }
            },
        }
        Ok(())
    }

    /// Turn each of `items` into a record of the satellite at `elements`.
    ///
    /// Elements are always written in full.
    fn elements(
        &mut self,
        elements: &Location,
        path: &str,
        array: &Array,
        items: Vec<Value>,
        parent_id: &Id,
    ) -> Result<()> {
        if let Some(min) = array.min_items.filter(|min| items.len() < *min) {
            return Err(Error::invalid_value(
                path,
                format!("must have at least {min} items"),
            ));
        }
        if let Some(max) = array.max_items.filter(|max| items.len() > *max) {
            return Err(Error::invalid_value(
                path,
                format!("must have at most {max} items"),
            ));
        }
        self.clear(&elements.structure);

        for (index, item) in items.into_iter().enumerate() {
            let id = Id::generate();
            let mut record = Record::from([
                (ID_FIELD.to_string(), db::Value::Text(id.to_string())),
                (PARENT_ID.to_string(), db::Value::Text(parent_id.to_string())),
                (
                    RESOURCE_ID.to_string(),
                    db::Value::Text(self.resource_id.to_string()),
                ),
                (INDEX.to_string(), db::Value::Int8(index as i64)),
            ]);
            match (&*array.items, item) {
                (Node::Object(_), Value::Null) => {
                    record.insert(VALUE.into(), db::Value::Null);
                }
                (Node::Object(object), Value::Object(fields)) => {
                    record.insert(VALUE.into(), db::Value::Bool(true));
                    self.fields(elements, path, object, fields, true, &mut record, &id)?;
                }
                (Node::Object(_), item) => {
                    return Err(Error::invalid_value(
                        path,
                        format!("expected an object, got {}", item.kind()),
                    ))
                }
                (node, item) => {
                    self.node(elements, VALUE, path, node, item, true, &mut record, &id)?
                }
            }
            self.records
                .entry(elements.structure.clone())
                .or_default()
                .push(record);
        }
        Ok(())
    }

    fn scalar(&mut self, path: &str, scalar: &Scalar, value: Value) -> Result<db::Value> {
        let value = scalar.ty.coerce(path, value)?;
        if value.is_null() {
            if scalar.required {
                return Err(Error::MissingField { path: path.into() });
            }
            return Ok(db::Value::Null);
        }
        validate(path, scalar, &value)?;
        if let (Some(relation), Value::Id(id)) = (&scalar.relation, &value) {
            self.foreign_ids
                .entry(path.to_string())
                .or_insert_with(|| ForeignIds {
                    path: path.to_string(),
                    resource: relation.resource.clone(),
                    filters: relation.filters.clone(),
                    ids: vec![],
                })
                .ids
                .push(id.clone());
        }
        lower(value)
    }

    /// Null every column beneath an object which is being set to null.
    fn clear_object(&mut self, at: &Location, object: &Object, row: &mut Record) {
        for (name, node) in &object.fields {
            match node {
                Node::Null => {}
                Node::Scalar(_) => {
                    row.insert(at.column(name), db::Value::Null);
                }
                Node::Object(inner) => {
                    row.insert(at.column(name), db::Value::Null);
                    self.clear_object(&at.object(name), inner, row);
                }
                Node::Array(_) => {
                    row.insert(at.column(name), db::Value::Null);
                    self.clear(&at.array(name).structure);
                }
            }
        }
    }

    /// Mark `structure` and every structure beneath it to be cleared before writing.
    ///
    /// This only matters on update; a resource being created has no satellite records yet.
    fn clear(&mut self, structure: &str) {
        if self.mode == Mode::Create {
            return;
        }
        for s in &self.meta.structures {
            let beneath = s
                .parent
                .as_ref()
                .map_or(false, |parent| self.cleared.contains(parent));
            if s.name == structure || beneath {
                self.cleared.insert(s.name.clone());
            }
        }
    }
}

/// Check the constraints of `scalar` on a (non-null, coerced) value.
fn validate(path: &str, scalar: &Scalar, value: &Value) -> Result<()> {
    let magnitude = match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Float(x) => Some(*x),
        Value::String(s) => Some(s.chars().count() as f64),
        _ => None,
    };
    let what = if matches!(value, Value::String(_)) {
        "length"
    } else {
        "value"
    };
    if let Some(magnitude) = magnitude {
        if let Some(min) = scalar.min.filter(|min| magnitude < *min) {
            return Err(Error::invalid_value(
                path,
                format!("{what} must be at least {min}"),
            ));
        }
        if let Some(max) = scalar.max.filter(|max| magnitude > *max) {
            return Err(Error::invalid_value(
                path,
                format!("{what} must be at most {max}"),
            ));
        }
    }
    if let (Some(pattern), Value::String(s)) = (&scalar.pattern, value) {
        if !pattern.is_match(s) {
            return Err(Error::invalid_value(
                path,
                format!("must match {}", pattern.as_str()),
            ));
        }
    }
    if let Some(allowed) = &scalar.enumeration {
        let found = allowed
            .iter()
            .any(|option| scalar.ty.coerce(path, option.clone()).ok().as_ref() == Some(value));
        if !found {
            return Err(Error::invalid_value(path, "not one of the allowed values"));
        }
    }
    Ok(())
}
