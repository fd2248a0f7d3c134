//! The schema model.
//!
//! A [`Schema`] describes every [`Resource`] in an application. Each resource is an [`Object`]
//! whose fields are [`Node`]s: typed [`Scalar`] leaves, nested [`Object`]s, [`Array`]s of any node,
//! or the constant [`Node::Null`]. An [`Id`](ScalarType::Id) scalar may carry a [`Relation`] to
//! another resource, making it a typed foreign key.
//!
//! The schema is pure data. It is validated once when constructed and never mutated afterwards;
//! everything derived from it (storage layout, compiled queries) is computed from this description.

use super::{
    metadata::join_path,
    request::{Filter, Filters},
    value::Value,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use derive_more::Display;
use regex::Regex;
use std::collections::BTreeMap;

/// The name of the identifier field every resource implicitly has.
pub const ID_FIELD: &str = "_id";

/// The type of a scalar leaf.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScalarType {
    #[display(fmt = "boolean")]
    Boolean,
    #[display(fmt = "integer")]
    Integer,
    #[display(fmt = "float")]
    Float,
    #[display(fmt = "string")]
    String,
    #[display(fmt = "date")]
    Date,
    #[display(fmt = "binary")]
    Binary,
    #[display(fmt = "id")]
    Id,
}

impl ScalarType {
    /// Convert `value` to the canonical representation of this type.
    ///
    /// Besides values of the type itself this accepts strings for ids, RFC 3339 strings for dates,
    /// hex strings for binaries and integers for floats. Relations may be given as objects carrying
    /// an `_id`, the shape in which they are returned when fields are requested through them.
    /// `null` is returned unchanged.
    ///
    /// # Errors
    ///
    /// `INVALID_VALUE` if `value` cannot be represented as this type.
    pub fn coerce(self, path: &str, value: Value) -> Result<Value> {
        let mismatch = |value: &Value| {
            Error::invalid_value(path, format!("expected {self}, got {}", value.kind()))
        };
        Ok(match (self, value) {
            (_, Value::Null) => Value::Null,
            (Self::Boolean, v @ Value::Bool(_)) => v,
            (Self::Integer, v @ Value::Integer(_)) => v,
            (Self::Integer, Value::Float(x)) if x.fract() == 0.0 => {
                // `i64::MAX as f64` rounds up to 2^63, which is itself out of range.
                if x < i64::MIN as f64 || x >= i64::MAX as f64 {
                    return Err(Error::invalid_value(
                        path,
                        format!("{x} is out of range for an integer"),
                    ));
                }
                Value::Integer(x as i64)
            }
            (Self::Float, v @ Value::Float(_)) => v,
            (Self::Float, Value::Integer(x)) => Value::Float(x as f64),
            (Self::String, v @ Value::String(_)) => v,
            (Self::Date, v @ Value::Date(_)) => v,
            (Self::Date, Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|date| Value::Date(date.with_timezone(&Utc)))
                .map_err(|err| Error::invalid_value(path, err))?,
            (Self::Binary, v @ Value::Binary(_)) => v,
            (Self::Binary, Value::String(s)) => {
                Value::Binary(hex::decode(&s).map_err(|err| Error::invalid_value(path, err))?)
            }
            (Self::Id, v @ Value::Id(_)) => v,
            (Self::Id, Value::String(s)) => Value::Id(s.into()),
            (Self::Id, Value::Object(mut fields)) => match fields.remove(ID_FIELD) {
                Some(id) => return self.coerce(path, id),
                None => return Err(Error::MissingField {
                    path: join_path(path, ID_FIELD),
                }),
            },
            (_, value) => return Err(mismatch(&value)),
        })
    }
}

/// A regular expression constraint on a string leaf.
#[derive(Clone, Debug)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn is_match(&self, s: &str) -> bool {
        self.0.is_match(s)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// The target of an [`Id`](ScalarType::Id) leaf which references another resource.
#[derive(Clone, Debug, PartialEq)]
pub struct Relation {
    /// The name of the referenced resource.
    pub resource: String,
    /// Filters which the referenced resource must satisfy for a reference to be accepted.
    pub filters: Filters,
}

/// A scalar leaf and its validation metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Scalar {
    pub ty: ScalarType,
    /// The field must be present (and not null) when the enclosing object is written in full.
    pub required: bool,
    /// Lower bound: the value for numbers, the character count for strings.
    pub min: Option<f64>,
    /// Upper bound: the value for numbers, the character count for strings.
    pub max: Option<f64>,
    pub pattern: Option<Pattern>,
    pub enumeration: Option<Vec<Value>>,
    pub unique: bool,
    pub indexed: bool,
    pub relation: Option<Relation>,
    /// Paths of filters given to a scalar which is not a relation, rejected by [`Schema::new`].
    misplaced_filters: Vec<String>,
}

impl Scalar {
    pub fn new(ty: ScalarType) -> Self {
        Self {
            ty,
            required: false,
            min: None,
            max: None,
            pattern: None,
            enumeration: None,
            unique: false,
            indexed: false,
            relation: None,
            misplaced_filters: vec![],
        }
    }

    pub fn boolean() -> Self {
        Self::new(ScalarType::Boolean)
    }

    pub fn integer() -> Self {
        Self::new(ScalarType::Integer)
    }

    pub fn float() -> Self {
        Self::new(ScalarType::Float)
    }

    pub fn string() -> Self {
        Self::new(ScalarType::String)
    }

    pub fn date() -> Self {
        Self::new(ScalarType::Date)
    }

    pub fn binary() -> Self {
        Self::new(ScalarType::Binary)
    }

    pub fn id() -> Self {
        Self::new(ScalarType::Id)
    }

    /// An identifier referencing a resource of type `resource`.
    pub fn relation(resource: impl Into<String>) -> Self {
        Self {
            relation: Some(Relation {
                resource: resource.into(),
                filters: Filters::new(),
            }),
            ..Self::id()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(Pattern(pattern));
        self
    }

    pub fn one_of<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.enumeration = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Require referenced resources to match `filter` on `path`.
    ///
    /// Only [relations](Self::relation) can be filtered: [`Schema::new`] rejects a schema with
    /// filters on any other scalar.
    pub fn filter(mut self, path: impl Into<String>, filter: Filter) -> Self {
        match &mut self.relation {
            Some(relation) => {
                relation.filters.insert(path.into(), filter);
            }
            None => self.misplaced_filters.push(path.into()),
        }
        self
    }

    /// Whether filters, sorts and searches may target this leaf.
    ///
    /// Relations are always backed by an index on their foreign key.
    pub fn is_searchable(&self) -> bool {
        self.indexed || self.unique || self.relation.is_some()
    }

    /// The implicit `_id` leaf of every resource.
    pub(crate) fn identifier() -> Self {
        Self::id().required().unique()
    }
}

/// A nested object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Object {
    pub required: bool,
    pub fields: BTreeMap<String, Node>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, node: impl Into<Node>) -> Self {
        self.fields.insert(name.into(), node.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Every leaf path under this object, without crossing relations.
    ///
    /// Arrays of scalars are leaves; arrays of objects contribute the leaf paths of their elements.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut paths = vec![];
        for (name, node) in &self.fields {
            node.collect_leaf_paths(name.clone(), &mut paths);
        }
        paths
    }
}

/// An array of elements of a single node type.
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    pub required: bool,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub items: Box<Node>,
}

impl Array {
    pub fn of(items: impl Into<Node>) -> Self {
        Self {
            required: false,
            min_items: None,
            max_items: None,
            items: Box::new(items.into()),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min_items(mut self, min: usize) -> Self {
        self.min_items = Some(min);
        self
    }

    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }
}

/// A node in the schema tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// A field whose only possible value is `null`.
    Null,
    Scalar(Scalar),
    Object(Object),
    Array(Array),
}

impl Node {
    pub fn is_required(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Scalar(scalar) => scalar.required,
            Self::Object(object) => object.required,
            Self::Array(array) => array.required,
        }
    }

    fn collect_leaf_paths(&self, path: String, paths: &mut Vec<String>) {
        match self {
            Self::Object(object) => {
                for (name, node) in &object.fields {
                    node.collect_leaf_paths(format!("{path}.{name}"), paths);
                }
            }
            Self::Array(array) => match &*array.items {
                Self::Object(object) => {
                    for (name, node) in &object.fields {
                        node.collect_leaf_paths(format!("{path}.{name}"), paths);
                    }
                }
                items => items.collect_leaf_paths(path, paths),
            },
            Self::Null | Self::Scalar(_) => paths.push(path),
        }
    }
}

impl From<Scalar> for Node {
    fn from(scalar: Scalar) -> Self {
        Self::Scalar(scalar)
    }
}

impl From<Object> for Node {
    fn from(object: Object) -> Self {
        Self::Object(object)
    }
}

impl From<Array> for Node {
    fn from(array: Array) -> Self {
        Self::Array(array)
    }
}

/// A resource: one addressable entity type.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub name: String,
    pub fields: Object,
    /// Deleting a resource marks it as deleted instead of removing it.
    pub soft_delete: bool,
    /// Relations may reference soft-deleted resources of this type.
    pub allow_deleted_references: bool,
}

impl Resource {
    pub fn new(name: impl Into<String>, fields: Object) -> Self {
        Self {
            name: name.into(),
            fields,
            soft_delete: false,
            allow_deleted_references: false,
        }
    }

    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub fn allow_deleted_references(mut self) -> Self {
        self.allow_deleted_references = true;
        self
    }
}

/// The complete, validated description of all resources.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    resources: BTreeMap<String, Resource>,
}

impl Schema {
    /// Validate and collect a set of resources into a schema.
    ///
    /// # Errors
    ///
    /// Fails with `INVALID_SCHEMA` if two resources share a name, if a field name is empty, is
    /// `*`, contains `.` or starts with `_`, if a relation references a resource which is not
    /// part of the schema, or if a scalar other than a relation carries filters.
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Result<Self> {
        let mut schema = Self::default();
        for resource in resources {
            if schema.resources.contains_key(&resource.name) {
                return Err(Error::invalid_schema(format!(
                    "duplicate resource {}",
                    resource.name
                )));
            }
            schema.resources.insert(resource.name.clone(), resource);
        }
        for resource in schema.resources.values() {
            schema.validate_object(&resource.name, &resource.fields)?;
        }
        Ok(schema)
    }

    /// Look up a resource by name.
    pub fn resource(&self, name: &str) -> Result<&Resource> {
        self.resources
            .get(name)
            .ok_or_else(|| Error::unknown_resource(name))
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    fn validate_object(&self, path: &str, object: &Object) -> Result<()> {
        for (name, node) in &object.fields {
            if name.is_empty() || name == "*" || name.contains('.') || name.starts_with('_') {
                return Err(Error::invalid_schema(format!(
                    "invalid field name {name:?} in {path}"
                )));
            }
            self.validate_node(&format!("{path}.{name}"), node)?;
        }
        Ok(())
    }

    fn validate_node(&self, path: &str, node: &Node) -> Result<()> {
        match node {
            Node::Null => Ok(()),
            Node::Scalar(scalar) => {
                if let Some(filter) = scalar.misplaced_filters.first() {
                    return Err(Error::invalid_schema(format!(
                        "{path} is not a relation and cannot be filtered on {filter}"
                    )));
                }
                if let Some(relation) = &scalar.relation {
                    if !self.resources.contains_key(&relation.resource) {
                        return Err(Error::invalid_schema(format!(
                            "{path} references unknown resource {}",
                            relation.resource
                        )));
                    }
                }
                Ok(())
            }
            Node::Object(object) => self.validate_object(path, object),
            Node::Array(array) => self.validate_node(path, &array.items),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn users() -> Resource {
        Resource::new(
            "users",
            Object::new()
                .field("name", Scalar::string().required().indexed())
                .field("manager", Scalar::relation("users"))
                .field(
                    "address",
                    Object::new()
                        .field("city", Scalar::string())
                        .field("zip", Scalar::string()),
                )
                .field("tags", Array::of(Scalar::string()))
                .field(
                    "jobs",
                    Array::of(Object::new().field("title", Scalar::string())),
                ),
        )
    }

    #[test]
    fn test_leaf_paths() {
        assert_eq!(
            users().fields.leaf_paths(),
            [
                "address.city",
                "address.zip",
                "jobs.title",
                "manager",
                "name",
                "tags"
            ]
        );
    }

    #[test]
    fn test_schema_lookup() {
        let schema = Schema::new([users()]).unwrap();
        assert_eq!(schema.resource("users").unwrap().name, "users");
        assert_eq!(
            schema.resource("groups").unwrap_err(),
            Error::unknown_resource("groups")
        );
    }

    #[test]
    fn test_unknown_relation() {
        let err = Schema::new([Resource::new(
            "posts",
            Object::new().field("author", Scalar::relation("users")),
        )])
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");
    }

    #[test]
    fn test_invalid_field_names() {
        for name in ["", "*", "a.b", "_secret"] {
            let err = Schema::new([Resource::new(
                "things",
                Object::new().field(name, Scalar::string()),
            )])
            .unwrap_err();
            assert_eq!(err.code(), "INVALID_SCHEMA", "{name:?}");
        }
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            ScalarType::Id.coerce("manager", "abc".into()).unwrap(),
            Value::Id("abc".into())
        );
        assert_eq!(
            ScalarType::Id
                .coerce("manager", Value::object([("_id", "abc".into())]))
                .unwrap(),
            Value::Id("abc".into())
        );
        assert_eq!(
            ScalarType::Binary.coerce("blob", "dead".into()).unwrap(),
            Value::Binary(vec![0xde, 0xad])
        );
        assert_eq!(
            ScalarType::Float.coerce("score", 2.into()).unwrap(),
            Value::Float(2.0)
        );
        assert!(matches!(
            ScalarType::Date
                .coerce("born", "2001-02-03T04:05:06Z".into())
                .unwrap(),
            Value::Date(_)
        ));
        assert_eq!(
            ScalarType::Integer.coerce("age", "old".into()).unwrap_err(),
            Error::invalid_value("age", "expected integer, got string")
        );
        assert_eq!(
            ScalarType::Boolean.coerce("flag", Value::Null).unwrap(),
            Value::Null
        );

        assert_eq!(
            ScalarType::Integer.coerce("age", Value::Float(42.0)).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            ScalarType::Integer
                .coerce("age", Value::Float(-9_223_372_036_854_775_808.0))
                .unwrap(),
            Value::Integer(i64::MIN)
        );
        for x in [9.3e18, 1e19, -1e19, f64::INFINITY] {
            assert_eq!(
                ScalarType::Integer
                    .coerce("age", Value::Float(x))
                    .unwrap_err()
                    .code(),
                "INVALID_VALUE",
                "{x}"
            );
        }
    }

    #[test]
    fn test_misplaced_filter() {
        let err = Schema::new([Resource::new(
            "users",
            Object::new().field("name", Scalar::string().filter("role", Filter::eq("admin"))),
        )])
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEMA");

        let schema = Schema::new([Resource::new(
            "users",
            Object::new()
                .field("role", Scalar::string().indexed())
                .field(
                    "manager",
                    Scalar::relation("users").filter("role", Filter::eq("admin")),
                ),
        )])
        .unwrap();
        let fields = &schema.resource("users").unwrap().fields.fields;
        let Some(Node::Scalar(manager)) = fields.get("manager") else {
            unreachable!()
        };
        assert_eq!(
            manager.relation.as_ref().unwrap().filters["role"],
            Filter::eq("admin")
        );
    }

    #[test]
    fn test_duplicate_resource() {
        let err = Schema::new([users(), users()]).unwrap_err();
        assert_eq!(err, Error::invalid_schema("duplicate resource users"));
    }
}
