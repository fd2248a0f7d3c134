//! Client requests against a resource collection.

use super::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The default number of results in a page.
pub const DEFAULT_LIMIT: usize = 20;

/// The default number of relations a requested path may cross.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// The direction of a sort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// The conventional numeric encoding of a sort direction: `1` or `-1`.
    pub fn from_sign(sign: i32) -> Self {
        if sign < 0 {
            Self::Desc
        } else {
            Self::Asc
        }
    }
}

/// A structured filter on a single field.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// The field equals the given value.
    Eq(Value),
    /// The field lies in an inclusive range. Either bound may be omitted.
    Range { min: Option<Value>, max: Option<Value> },
    /// The field equals one of the given values.
    OneOf(Vec<Value>),
}

impl Filter {
    pub fn eq(value: impl Into<Value>) -> Self {
        Self::Eq(value.into())
    }

    pub fn between(min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Self::Range {
            min: Some(min.into()),
            max: Some(max.into()),
        }
    }

    pub fn at_least(min: impl Into<Value>) -> Self {
        Self::Range {
            min: Some(min.into()),
            max: None,
        }
    }

    pub fn at_most(max: impl Into<Value>) -> Self {
        Self::Range {
            min: None,
            max: Some(max.into()),
        }
    }

    pub fn one_of<I>(values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self::OneOf(values.into_iter().map(Into::into).collect())
    }
}

/// Filters keyed by dotted field path. All filters must hold.
pub type Filters = BTreeMap<String, Filter>;

/// A full-text search: every token of `text` must occur in at least one of the fields `on`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Search {
    pub on: BTreeSet<String>,
    pub text: String,
}

/// A request for a page of resources.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Dotted paths of the fields to return. `_id` is always returned.
    pub fields: BTreeSet<String>,
    pub query: Option<Search>,
    pub filters: Filters,
    /// Sort keys in priority order. Ties are broken by `_id`.
    pub sort_by: Vec<(String, SortOrder)>,
    pub limit: usize,
    pub offset: usize,
    /// The maximum number of relations any requested path may cross.
    pub max_depth: usize,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            fields: Default::default(),
            query: None,
            filters: Default::default(),
            sort_by: vec![],
            limit: DEFAULT_LIMIT,
            offset: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, path: impl Into<String>) -> Self {
        self.fields.insert(path.into());
        self
    }

    pub fn fields<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.fields.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn search<I>(mut self, on: I, text: impl Into<String>) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.query = Some(Search {
            on: on.into_iter().map(Into::into).collect(),
            text: text.into(),
        });
        self
    }

    pub fn filter(mut self, path: impl Into<String>, filter: Filter) -> Self {
        self.filters.insert(path.into(), filter);
        self
    }

    pub fn sort(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by.push((path.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}
