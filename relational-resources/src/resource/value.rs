//! Dynamically typed values for payloads and resource instances.

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The identity of a resource.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, From, Serialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// A nested value mirroring the shape of a [`Node`](super::schema::Node).
///
/// Write payloads are given as values keyed by schema field names, and resource instances are
/// returned as values of the same shape. Relations appear either as a bare [`Id`] or, when fields
/// were requested through the relation, as an object containing at least `_id`.
#[derive(Clone, Debug, Default, PartialEq, From, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    #[from(ignore)]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(DateTime<Utc>),
    #[serde(serialize_with = "serialize_hex")]
    Binary(Vec<u8>),
    Id(Id),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Build an object from a list of fields.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build an array from a list of elements.
    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Look up a nested value by dotted path.
    ///
    /// Only objects are traversed; a path through an array or a scalar yields [`None`].
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self, |value, segment| value.as_object()?.get(segment))
    }

    /// A short description of the kind of this value, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Binary(_) => "binary",
            Self::Id(_) => "id",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.into())
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Self {
        Self::Integer(x.into())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or_default()
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or_default(),
            },
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Json::Object(fields) => Self::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}
