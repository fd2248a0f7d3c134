//! Resolution of client requests into backend-neutral queries.
//!
//! [`resolve`] walks every path mentioned by a [`Request`] (requested fields, filters, full-text
//! targets and sort keys) through the schema and produces two things:
//!
//! * a [`FormattedQuery`]: a tree of _lookups_ rooted at the main structure of the resource. Each
//!   array entered and each relation crossed opens a lookup, which is shared by every path with the
//!   same prefix. Lookups carry the projected columns under deterministic aliases, and the root
//!   carries the match (filters and search) and sort of the request, referencing columns by
//!   [`FieldRef`].
//! * a [`Projection`]: the shape of each result, mapping every requested path to the aliases from
//!   which a backend reconstructs it.

use super::{
    metadata::{join_path, Location, Metadata, PARENT_ID, VALUE},
    request::{Filter, Request, SortOrder},
    schema::{Node, Object, Resource, Scalar, ScalarType, Schema, ID_FIELD},
    value::Value,
};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::btree_map::{BTreeMap, Entry};

/// The implicit identifier field of every resource.
static IDENTIFIER: Lazy<Node> = Lazy::new(|| Node::Scalar(Scalar::identifier()));

/// How a lookup is attached to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    Root,
    /// The lookup holds the target of a relation stored in the parent.
    Relation,
    /// The lookup holds the elements of an array stored in the parent.
    Array,
}

/// A column in a lookup of a [`FormattedQuery`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldRef {
    /// The keys of the lookups leading from the root to the lookup holding the column.
    pub lookup: Vec<String>,
    pub column: String,
}

impl FieldRef {
    fn new(lookup: &[String], column: &str) -> Self {
        Self {
            lookup: lookup.to_vec(),
            column: column.to_string(),
        }
    }
}

/// A structured filter, with its values coerced to the type of the filtered field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldRef,
    pub filter: Filter,
}

/// A full-text search for `pattern` in any of `targets`.
#[derive(Clone, Debug, PartialEq)]
pub struct TextSearch {
    pub pattern: TextPattern,
    pub targets: Vec<FieldRef>,
}

/// The conditions a resource must meet to be included in the results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Match {
    pub search: Option<TextSearch>,
    /// Filters which must all hold.
    pub filters: Vec<FieldFilter>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    pub field: FieldRef,
    pub order: SortOrder,
}

/// A compiled request: the root structure of a resource and the lookups joined to it.
#[derive(Clone, Debug, PartialEq)]
pub struct FormattedQuery {
    pub structure: String,
    pub kind: QueryKind,
    /// The column of the parent lookup joined on `foreign_field`. Empty at the root.
    pub local_field: String,
    /// The column of this lookup joined on the parent's `local_field`. Empty at the root.
    pub foreign_field: String,
    /// Projected columns of this lookup, by alias.
    pub fields: BTreeMap<String, String>,
    pub lookups: BTreeMap<String, FormattedQuery>,
    /// Only set at the root.
    pub matching: Option<Match>,
    /// Only set at the root.
    pub sort: Option<Vec<SortKey>>,
    /// Soft-deleted resources are excluded. Only set at the root.
    pub exclude_deleted: bool,
}

impl FormattedQuery {
    fn root(structure: &str, exclude_deleted: bool) -> Self {
        Self {
            structure: structure.to_string(),
            kind: QueryKind::Root,
            local_field: String::new(),
            foreign_field: String::new(),
            fields: Default::default(),
            lookups: Default::default(),
            matching: None,
            sort: None,
            exclude_deleted,
        }
    }

    fn lookup(kind: QueryKind, structure: &str, local: &str, foreign: &str) -> Self {
        Self {
            kind,
            local_field: local.to_string(),
            foreign_field: foreign.to_string(),
            ..Self::root(structure, false)
        }
    }

    /// The lookup reached by following `path` from this one.
    pub fn lookup_at(&self, path: &[String]) -> Option<&Self> {
        path.iter()
            .try_fold(self, |query, key| query.lookups.get(key))
    }

    fn lookup_mut(&mut self, path: &[String]) -> Option<&mut Self> {
        path.iter()
            .try_fold(self, |query, key| query.lookups.get_mut(key))
    }

    /// Whether this lookup or any lookup beneath it contributes projected columns.
    pub fn is_projected(&self) -> bool {
        !self.fields.is_empty() || self.lookups.values().any(Self::is_projected)
    }
}

/// The shape of a result, and where each part of it comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    /// A scalar read from an aliased column.
    Value { alias: String, ty: ScalarType },
    /// A field which is always `null`.
    Null,
    /// An object. Nested objects are `null` when their presence column is not set.
    Object {
        presence: Option<String>,
        fields: BTreeMap<String, Projection>,
    },
    /// An array, with elements identified by the `id` alias.
    Array {
        presence: String,
        id: String,
        item: Box<Projection>,
    },
    /// A relation expanded into the referenced resource, identified by the `id` alias.
    Relation {
        id: String,
        fields: BTreeMap<String, Projection>,
    },
}

impl Projection {
    /// Flatten this projection into a map from logical paths to the aliases of their values.
    ///
    /// Relations map to the alias of the referenced id. Array elements share the path of the
    /// array.
    pub fn aliases(&self) -> BTreeMap<String, String> {
        let mut aliases = BTreeMap::new();
        self.collect_aliases("", &mut aliases);
        aliases
    }

    fn collect_aliases(&self, path: &str, aliases: &mut BTreeMap<String, String>) {
        match self {
            Self::Value { alias, .. } => {
                aliases.insert(path.to_string(), alias.clone());
            }
            Self::Null => {}
            Self::Object { fields, .. } => {
                for (name, field) in fields {
                    field.collect_aliases(&join_path(path, name), aliases);
                }
            }
            Self::Array { item, .. } => item.collect_aliases(path, aliases),
            Self::Relation { id, fields } => {
                aliases.insert(path.to_string(), id.clone());
                for (name, field) in fields {
                    field.collect_aliases(&join_path(path, name), aliases);
                }
            }
        }
    }

    /// Combine the paths projected by `other` into this projection.
    ///
    /// A relation requested both as a bare id and through its fields is expanded.
    fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::Object { fields, .. }, Self::Object { fields: other, .. })
            | (Self::Relation { fields, .. }, Self::Relation { fields: other, .. }) => {
                for (name, field) in other {
                    match fields.entry(name) {
                        Entry::Vacant(e) => {
                            e.insert(field);
                        }
                        Entry::Occupied(mut e) => e.get_mut().merge(field),
                    }
                }
            }
            (Self::Array { item, .. }, Self::Array { item: other, .. }) => item.merge(*other),
            (this @ Self::Value { .. }, other @ Self::Relation { .. }) => *this = other,
            _ => {}
        }
    }
}

/// A full-text search pattern: a list of tokens which must all occur, case-insensitively.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextPattern {
    tokens: Vec<String>,
}

impl TextPattern {
    /// Split `text` into tokens on whitespace and punctuation.
    pub fn parse(text: &str) -> Self {
        Self {
            tokens: text
                .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
                .filter(|token| !token.is_empty())
                .map(str::to_lowercase)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// A single regular expression requiring every token, for case-insensitive matching.
    pub fn to_regex(&self) -> String {
        let lookaheads = self
            .tokens
            .iter()
            .map(|token| format!("(?=.*{})", regex::escape(token)))
            .collect::<String>();
        format!("^{lookaheads}")
    }

    /// Whether `text` contains every token, ignoring case.
    pub fn is_match(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.tokens.iter().all(|token| text.contains(token.as_str()))
    }
}

/// Compile `request` against `resource` into a formatted query and the projection of its results.
///
/// # Errors
///
/// * `UNKNOWN_RESOURCE` if `resource` is not in the schema
/// * `UNKNOWN_FIELD` if a path does not exist, or continues past a leaf
/// * `INVALID_FIELD` if a path ends on an object or an array of objects
/// * `MAXIMUM_DEPTH_EXCEEDED` if a path crosses more than `request.max_depth` relations
/// * `UNSORTABLE_FIELD` if a sort key is inside an array
/// * `UNINDEXED_FIELD` if a filter, search target or sort key is neither indexed nor unique
/// * `INVALID_VALUE` if a filter value does not fit the type of its field
pub fn resolve(
    schema: &Schema,
    metadata: &Metadata,
    resource: &str,
    request: &Request,
) -> Result<(FormattedQuery, Projection)> {
    let resource = schema.resource(resource)?;
    let meta = metadata.resource(&resource.name)?;
    let mut resolver = Resolver {
        schema,
        resource,
        max_depth: request.max_depth,
        query: FormattedQuery::root(&meta.structure, meta.soft_delete),
        projection: Projection::Object {
            presence: None,
            fields: Default::default(),
        },
        aliases: Default::default(),
    };

    resolver.project(ID_FIELD)?;
    for path in &request.fields {
        for path in resolver.expand(path)? {
            resolver.project(&path)?;
        }
    }

    let mut matching = Match::default();
    for (path, filter) in &request.filters {
        matching.filters.push(resolver.filter(path, filter)?);
    }
    if let Some(search) = &request.query {
        let targets = search
            .on
            .iter()
            .map(|path| Ok(resolver.searchable(path, Purpose::Search)?.0))
            .collect::<Result<Vec<_>>>()?;
        let pattern = TextPattern::parse(&search.text);
        if !pattern.is_empty() && !targets.is_empty() {
            matching.search = Some(TextSearch { pattern, targets });
        }
    }
    if !matching.filters.is_empty() || matching.search.is_some() {
        resolver.query.matching = Some(matching);
    }

    let sort = request
        .sort_by
        .iter()
        .map(|(path, order)| {
            Ok(SortKey {
                field: resolver.searchable(path, Purpose::Sort)?.0,
                order: *order,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if !sort.is_empty() {
        resolver.query.sort = Some(sort);
    }

    tracing::debug!(
        resource = %resource.name,
        lookups = resolver.query.lookups.len(),
        aliases = resolver.aliases.len(),
        "resolved request"
    );
    Ok((resolver.query, resolver.projection))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Purpose {
    Filter,
    Search,
    Sort,
}

/// One step taken while resolving a path.
///
/// `key` is the name of the step in the enclosing object, or `None` for an array element.
enum Hop {
    Object { key: Option<String>, presence: FieldRef },
    Array {
        key: Option<String>,
        presence: FieldRef,
        id: FieldRef,
    },
    Relation { key: Option<String>, id: FieldRef },
}

enum Leaf<'a> {
    Value { field: FieldRef, scalar: &'a Scalar },
    Null,
}

struct Resolved<'a> {
    hops: Vec<Hop>,
    key: Option<String>,
    leaf: Leaf<'a>,
    in_array: bool,
}

struct Resolver<'a> {
    schema: &'a Schema,
    resource: &'a Resource,
    max_depth: usize,
    query: FormattedQuery,
    projection: Projection,
    aliases: BTreeMap<FieldRef, String>,
}

impl<'a> Resolver<'a> {
    /// Resolve `path` down to a leaf, opening lookups along the way.
    fn walk(&mut self, path: &str) -> Result<Resolved<'a>> {
        let mut at = Location::root(&self.resource.name);
        let mut lookup: Vec<String> = vec![];
        let mut hops = vec![];
        let mut depth = 0;
        let mut in_array = false;
        let mut segments = path.split('.').peekable();
        let mut object = &self.resource.fields;
        let mut resource_scope = true;

        loop {
            let Some(segment) = segments.next() else {
                return Err(Error::InvalidField { path: path.into() });
            };
            let mut node: &'a Node = if segment == ID_FIELD && resource_scope {
                &*IDENTIFIER
            } else {
                object
                    .fields
                    .get(segment)
                    .ok_or_else(|| Error::unknown_field(path))?
            };
            let mut key = Some(segment.to_string());
            let mut field = segment.to_string();

            // Descend through `node` until we reach a leaf or land in another object.
            loop {
                match node {
                    Node::Null => {
                        if segments.next().is_some() {
                            return Err(Error::unknown_field(path));
                        }
                        return Ok(Resolved {
                            hops,
                            key,
                            leaf: Leaf::Null,
                            in_array,
                        });
                    }
                    Node::Scalar(scalar) => {
                        let column = at.column(&field);
                        match &scalar.relation {
                            Some(relation) if segments.peek().is_some() => {
                                depth += 1;
                                if depth > self.max_depth {
                                    return Err(Error::MaximumDepthExceeded {
                                        path: path.into(),
                                        max_depth: self.max_depth,
                                    });
                                }
                                let target = self.schema.resource(&relation.resource)?;
                                let target_at = Location::root(&target.name);
                                self.open(
                                    &lookup,
                                    &column,
                                    FormattedQuery::lookup(
                                        QueryKind::Relation,
                                        &target_at.structure,
                                        &column,
                                        ID_FIELD,
                                    ),
                                );
                                hops.push(Hop::Relation {
                                    key,
                                    id: FieldRef::new(&lookup, &column),
                                });
                                lookup.push(column);
                                at = target_at;
                                object = &target.fields;
                                resource_scope = true;
                                break;
                            }
                            _ => {
                                if segments.next().is_some() {
                                    return Err(Error::unknown_field(path));
                                }
                                return Ok(Resolved {
                                    hops,
                                    key,
                                    leaf: Leaf::Value {
                                        field: FieldRef::new(&lookup, &column),
                                        scalar,
                                    },
                                    in_array,
                                });
                            }
                        }
                    }
                    Node::Object(inner) => {
                        hops.push(Hop::Object {
                            key,
                            presence: FieldRef::new(&lookup, &at.column(&field)),
                        });
                        at = at.object(&field);
                        object = inner;
                        resource_scope = false;
                        break;
                    }
                    Node::Array(array) => {
                        let column = at.column(&field);
                        let elements = at.array(&field);
                        self.open(
                            &lookup,
                            &column,
                            FormattedQuery::lookup(
                                QueryKind::Array,
                                &elements.structure,
                                ID_FIELD,
                                PARENT_ID,
                            ),
                        );
                        let presence = FieldRef::new(&lookup, &column);
                        lookup.push(column);
                        hops.push(Hop::Array {
                            key,
                            presence,
                            id: FieldRef::new(&lookup, ID_FIELD),
                        });
                        in_array = true;
                        at = elements;
                        match &*array.items {
                            Node::Object(inner) => {
                                hops.push(Hop::Object {
                                    key: None,
                                    presence: FieldRef::new(&lookup, VALUE),
                                });
                                object = inner;
                                resource_scope = false;
                                break;
                            }
                            items => {
                                key = None;
                                field = VALUE.to_string();
                                node = items;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Attach `query` beneath the lookup at `parent` under `key`, unless it is already there.
    fn open(&mut self, parent: &[String], key: &str, query: FormattedQuery) {
        if let Some(parent) = self.query.lookup_mut(parent) {
            parent.lookups.entry(key.to_string()).or_insert(query);
        }
    }

    /// The alias of a projected column, assigning a new one on first use.
    fn alias(&mut self, field: &FieldRef) -> String {
        if let Some(alias) = self.aliases.get(field) {
            return alias.clone();
        }
        let alias = format!("f{}", self.aliases.len());
        if let Some(lookup) = self.query.lookup_mut(&field.lookup) {
            lookup.fields.insert(alias.clone(), field.column.clone());
        }
        self.aliases.insert(field.clone(), alias.clone());
        alias
    }

    /// Add `path` to the projection.
    fn project(&mut self, path: &str) -> Result<()> {
        let resolved = self.walk(path)?;
        let mut key = resolved.key;
        let mut projection = match resolved.leaf {
            Leaf::Value { field, scalar } => Projection::Value {
                alias: self.alias(&field),
                ty: scalar.ty,
            },
            Leaf::Null => Projection::Null,
        };
        for hop in resolved.hops.into_iter().rev() {
            (projection, key) = match hop {
                Hop::Object { key: name, presence } => (
                    Projection::Object {
                        presence: Some(self.alias(&presence)),
                        fields: child(key, projection),
                    },
                    name,
                ),
                Hop::Array {
                    key: name,
                    presence,
                    id,
                } => (
                    Projection::Array {
                        presence: self.alias(&presence),
                        id: self.alias(&id),
                        item: Box::new(projection),
                    },
                    name,
                ),
                Hop::Relation { key: name, id } => (
                    Projection::Relation {
                        id: self.alias(&id),
                        fields: child(key, projection),
                    },
                    name,
                ),
            };
        }
        self.projection.merge(Projection::Object {
            presence: None,
            fields: child(key, projection),
        });
        Ok(())
    }

    /// Resolve a path which is used to filter, search or sort.
    fn searchable(&mut self, path: &str, purpose: Purpose) -> Result<(FieldRef, &'a Scalar)> {
        let resolved = self.walk(path)?;
        if purpose == Purpose::Sort && resolved.in_array {
            return Err(Error::UnsortableField { path: path.into() });
        }
        match resolved.leaf {
            Leaf::Value { field, scalar } if scalar.is_searchable() => Ok((field, scalar)),
            _ => Err(Error::UnindexedField { path: path.into() }),
        }
    }

    fn filter(&mut self, path: &str, filter: &Filter) -> Result<FieldFilter> {
        let (field, scalar) = self.searchable(path, Purpose::Filter)?;
        let coerce = |value: &Value| scalar.ty.coerce(path, value.clone());
        let filter = match filter {
            Filter::Eq(value) => Filter::Eq(coerce(value)?),
            Filter::Range { min, max } => Filter::Range {
                min: min.as_ref().map(coerce).transpose()?,
                max: max.as_ref().map(coerce).transpose()?,
            },
            Filter::OneOf(values) => {
                Filter::OneOf(values.iter().map(coerce).collect::<Result<_>>()?)
            }
        };
        Ok(FieldFilter { field, filter })
    }

    /// Expand a trailing `*` into every leaf beneath the object it follows.
    fn expand(&self, path: &str) -> Result<Vec<String>> {
        let Some(prefix) = path.strip_suffix('*') else {
            return Ok(vec![path.to_string()]);
        };
        if prefix.is_empty() {
            return Ok(self.resource.fields.leaf_paths());
        }
        let object = prefix
            .strip_suffix('.')
            .and_then(|prefix| self.find_object(prefix))
            .ok_or_else(|| Error::unknown_field(path))?;
        Ok(object
            .leaf_paths()
            .into_iter()
            .map(|leaf| format!("{prefix}{leaf}"))
            .collect())
    }

    /// The object at `path`, looking through arrays and relations.
    fn find_object(&self, path: &str) -> Option<&'a Object> {
        let mut object = &self.resource.fields;
        for segment in path.split('.') {
            let mut node = object.fields.get(segment)?;
            object = loop {
                match node {
                    Node::Object(inner) => break inner,
                    Node::Array(array) => node = &array.items,
                    Node::Scalar(Scalar {
                        relation: Some(relation),
                        ..
                    }) => break &self.schema.resource(&relation.resource).ok()?.fields,
                    _ => return None,
                }
            };
        }
        Some(object)
    }
}

fn child(key: Option<String>, projection: Projection) -> BTreeMap<String, Projection> {
    match key {
        Some(key) => BTreeMap::from([(key, projection)]),
        None => BTreeMap::new(),
    }
}
