//! Compilation of formatted queries into `SELECT` statements, and execution of searches.
//!
//! A search runs in two stages, nested as a subquery and the query around it:
//!
//! * The _page_ stage finds matching resources. It joins only the lookups needed by the match and
//!   the sort, groups by resource (so that matches inside arrays do not duplicate a resource) and
//!   numbers the resources in sort order with a window function, counting the total alongside.
//! * The _projection_ stage keeps the ranks inside the requested window and joins every projected
//!   lookup, producing one flat row per combination of array elements. Rows come out ordered by
//!   rank and then by element index, which is what the
//!   [reconstructor](super::reconstruct) relies on to rebuild arrays in order.

use super::{db_error, lower, reconstruct, Record};
use crate::{
    error::{Error, Result},
    resource::{
        backend::Page,
        metadata::{Metadata, INDEX, IS_DELETED},
        query::{resolve, FieldRef, FormattedQuery, QueryKind},
        request::{Filter, Request, SortOrder},
        schema::{Schema, ID_FIELD},
        value::{Id, Value},
    },
    sql::db::{
        self, Boolean, CmpOp, Column, Connection, Direction, Expr, FromItem, JoinKind, OrderBy,
        Row, Select, WhereClause,
    },
};
use std::collections::BTreeSet;
use std::iter;

/// The alias of the root structure.
const ROOT: &str = "t0";
/// The alias of the page subquery.
const PAGE: &str = "__page";
const ID: &str = "__id";
const RANK: &str = "__rank";
const TOTAL: &str = "__total";

/// A lookup of a formatted query, flattened into a join.
struct Join<'a> {
    path: Vec<String>,
    alias: String,
    /// The alias of the parent lookup. `None` at the root.
    parent: Option<String>,
    query: &'a FormattedQuery,
}

/// Flatten the lookup tree of `query` in depth-first order, so that every lookup follows its
/// parent.
fn flatten(query: &FormattedQuery) -> Vec<Join<'_>> {
    fn visit<'a>(
        query: &'a FormattedQuery,
        path: Vec<String>,
        parent: Option<String>,
        joins: &mut Vec<Join<'a>>,
    ) {
        let alias = format!("t{}", joins.len());
        joins.push(Join {
            path: path.clone(),
            alias: alias.clone(),
            parent,
            query,
        });
        for (key, lookup) in &query.lookups {
            let mut path = path.clone();
            path.push(key.clone());
            visit(lookup, path, Some(alias.clone()), joins);
        }
    }

    let mut joins = vec![];
    visit(query, vec![], None, &mut joins);
    joins
}

fn column(joins: &[Join], field: &FieldRef) -> Result<Column> {
    let join = joins
        .iter()
        .find(|join| join.path == field.lookup)
        .ok_or_else(|| Error::Backend {
            error: format!("no lookup {:?} for column {}", field.lookup, field.column),
        })?;
    Ok(Column::qualified(&join.alias, &field.column))
}

fn join_lookup(select: Select, join: &Join) -> Select {
    let parent = join.parent.as_deref().unwrap_or(ROOT);
    select.join(
        JoinKind::Left,
        FromItem::table(&join.query.structure, &join.alias),
        Column::qualified(parent, &join.query.local_field),
        Column::qualified(&join.alias, &join.query.foreign_field),
    )
}

fn direction(order: SortOrder) -> Direction {
    match order {
        SortOrder::Asc => Direction::Asc,
        SortOrder::Desc => Direction::Desc,
    }
}

/// The condition on `column` expressed by `filter`.
fn filter_clause(column: Column, filter: &Filter) -> Result<WhereClause> {
    Ok(match filter {
        Filter::Eq(value) if value.is_null() => Boolean::IsNull(column).into(),
        Filter::Eq(value) => Boolean::cmp(column, CmpOp::Eq, lower(value.clone())?).into(),
        Filter::Range { min, max } => {
            let mut bounds: Vec<WhereClause> = vec![];
            if let Some(min) = min.as_ref().filter(|min| !min.is_null()) {
                bounds.push(Boolean::cmp(column.clone(), CmpOp::Ge, lower(min.clone())?).into());
            }
            if let Some(max) = max.as_ref().filter(|max| !max.is_null()) {
                bounds.push(Boolean::cmp(column, CmpOp::Le, lower(max.clone())?).into());
            }
            WhereClause::all(bounds)
        }
        Filter::OneOf(values) => {
            let (nulls, values): (Vec<_>, Vec<_>) = values.iter().partition(|v| v.is_null());
            let params = values
                .into_iter()
                .map(|value| lower(value.clone()))
                .collect::<Result<Vec<_>>>()?;
            let mut any: Vec<WhereClause> = vec![Boolean::one_of(column.clone(), params).into()];
            if !nulls.is_empty() {
                any.push(Boolean::IsNull(column).into());
            }
            WhereClause::any(any)
        }
    })
}

/// The root structure of `joins`, with the conditions of the query's match stage applied and the
/// lookups they (or `extra` columns) depend on joined.
fn match_stage<'a>(
    joins: &[Join<'a>],
    extra: impl IntoIterator<Item = &'a FieldRef>,
) -> Result<Select> {
    let root = &joins[0];
    let mut clauses = vec![];
    let mut needed: BTreeSet<&[String]> = BTreeSet::new();

    if let Some(matching) = &root.query.matching {
        for filter in &matching.filters {
            needed.insert(&filter.field.lookup);
            clauses.push(filter_clause(column(joins, &filter.field)?, &filter.filter)?);
        }
        if let Some(search) = &matching.search {
            let mut any: Vec<WhereClause> = vec![];
            for target in &search.targets {
                needed.insert(&target.lookup);
                any.push(
                    Boolean::Matches {
                        column: column(joins, target)?,
                        pattern: search.pattern.clone(),
                    }
                    .into(),
                );
            }
            clauses.push(WhereClause::any(any));
        }
    }
    for field in extra {
        needed.insert(&field.lookup);
    }
    if root.query.exclude_deleted {
        clauses.push(Boolean::cmp(Column::qualified(ROOT, IS_DELETED), CmpOp::Eq, false).into());
    }

    let mut select = Select::from(FromItem::table(&root.query.structure, ROOT));
    for join in &joins[1..] {
        if needed.iter().any(|path| path.starts_with(&join.path)) {
            select = join_lookup(select, join);
        }
    }
    if !clauses.is_empty() {
        select = select.filter(WhereClause::all(clauses));
    }
    Ok(select)
}

/// The page stage: the id, rank and total of every matching resource.
fn ranked(query: &FormattedQuery, id: Option<&Id>) -> Result<Select> {
    let joins = flatten(query);
    let sort = query
        .sort
        .iter()
        .flatten()
        .map(|key| {
            Ok(OrderBy {
                column: column(&joins, &key.field)?,
                direction: direction(key.order),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut select = match_stage(&joins, query.sort.iter().flatten().map(|key| &key.field))?;
    let root_id = Column::qualified(ROOT, ID_FIELD);
    if let Some(id) = id {
        select = select.filter(Boolean::cmp(root_id.clone(), CmpOp::Eq, id.as_str()));
    }
    select = select.group_by(root_id.clone());
    for key in &sort {
        select = select.group_by(key.column.clone());
    }
    let mut order = sort;
    order.push(OrderBy::asc(root_id.clone()));
    Ok(select
        .column(root_id, ID)
        .column(Expr::RowNumber(order), RANK)
        .column(Expr::CountOver, TOTAL))
}

/// Compile `query` into a single `SELECT` returning the flat rows of the resources ranked
/// `offset + 1` through `offset + limit`.
///
/// If `id` is given only the resource with that id can match.
pub fn generate(
    query: &FormattedQuery,
    id: Option<&Id>,
    offset: usize,
    limit: usize,
) -> Result<Select> {
    let joins = flatten(query);
    let rank = Column::qualified(PAGE, RANK);
    let mut select = Select::from(FromItem::subquery(ranked(query, id)?, PAGE))
        .join(
            JoinKind::Inner,
            FromItem::table(&query.structure, ROOT),
            Column::qualified(PAGE, ID),
            Column::qualified(ROOT, ID_FIELD),
        )
        .filter(Boolean::cmp(rank.clone(), CmpOp::Gt, bound(offset)))
        .filter(Boolean::cmp(
            rank.clone(),
            CmpOp::Le,
            bound(offset.saturating_add(limit)),
        ));

    let projected = joins
        .iter()
        .filter(|join| join.query.is_projected())
        .collect::<Vec<_>>();
    for join in &projected {
        if join.parent.is_some() {
            select = join_lookup(select, join);
        }
    }
    for join in &projected {
        for (alias, col) in &join.query.fields {
            select = select.column(Column::qualified(&join.alias, col), alias);
        }
    }
    select = select
        .column(Column::qualified(PAGE, TOTAL), TOTAL)
        .order_by(OrderBy::asc(rank));
    for join in &projected {
        if join.query.kind == QueryKind::Array {
            select = select.order_by(OrderBy::asc(Column::qualified(&join.alias, INDEX)));
        }
    }
    Ok(select)
}

/// A query for the total number of resources matching `query`.
///
/// This is only needed when a page comes back empty, since otherwise every row carries the total.
pub fn count(query: &FormattedQuery) -> Result<Select> {
    Ok(ranked(query, None)?.limit(1))
}

/// The ids of the resources among `ids` which match `query`, each labelled with `label`.
///
/// Rows have two columns: `label` and `id`. Queries for different labels can be combined with
/// `UNION ALL` to check many sets of ids in one round trip.
pub(crate) fn candidates(query: &FormattedQuery, label: &str, ids: &[Id]) -> Result<Select> {
    let joins = flatten(query);
    let root_id = Column::qualified(ROOT, ID_FIELD);
    Ok(match_stage(&joins, iter::empty())?
        .filter(Boolean::one_of(root_id.clone(), ids.iter().map(Id::as_str)))
        .group_by(root_id.clone())
        .column(Expr::Param(label.into()), "label")
        .column(root_id, "id"))
}

fn bound(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Every alias projected by `query` or its lookups.
fn aliases(query: &FormattedQuery) -> Vec<&str> {
    let mut aliases = query.fields.keys().map(String::as_str).collect::<Vec<_>>();
    for lookup in query.lookups.values() {
        aliases.extend(self::aliases(lookup));
    }
    aliases
}

fn total<R: Row>(metadata: &Metadata, row: &R) -> Result<usize> {
    match row.column(TOTAL).map_err(|err| db_error(metadata, err))? {
        db::Value::Int8(n) => Ok(usize::try_from(n).unwrap_or_default()),
        value => Err(Error::Backend {
            error: format!("unexpected total {value}"),
        }),
    }
}

/// Run `query`, returning the flat rows of the requested window and the total number of matches.
async fn load<C: Connection>(
    conn: &C,
    metadata: &Metadata,
    query: &FormattedQuery,
    id: Option<&Id>,
    offset: usize,
    limit: usize,
) -> Result<(Vec<Record>, usize)> {
    let statement = generate(query, id, offset, limit)?.into();
    let rows = conn
        .query(&statement)
        .await
        .map_err(|err| db_error(metadata, err))?;
    let aliases = aliases(query);
    let records = rows
        .iter()
        .map(|row| {
            aliases
                .iter()
                .map(|alias| {
                    let value = row.column(alias).map_err(|err| db_error(metadata, err))?;
                    Ok((alias.to_string(), value))
                })
                .collect::<Result<Record>>()
        })
        .collect::<Result<Vec<_>>>()?;

    let total = match rows.first() {
        Some(row) => total(metadata, row)?,
        None if offset > 0 => {
            let rows = conn
                .query(&count(query)?.into())
                .await
                .map_err(|err| db_error(metadata, err))?;
            match rows.first() {
                Some(row) => total(metadata, row)?,
                None => 0,
            }
        }
        None => 0,
    };
    Ok((records, total))
}

/// Get a page of `resource` matching `request`.
pub async fn execute<C: Connection>(
    conn: &C,
    schema: &Schema,
    metadata: &Metadata,
    resource: &str,
    request: &Request,
) -> Result<Page> {
    let (query, projection) = resolve(schema, metadata, resource, request)?;
    let (records, total) = load(
        conn,
        metadata,
        &query,
        None,
        request.offset,
        request.limit,
    )
    .await?;
    let results = reconstruct::format(&projection, &records)?;
    tracing::info!(
        resource,
        total,
        results = results.len(),
        rows = records.len(),
        "search"
    );
    Ok(Page { total, results })
}

/// Load the resource of type `resource` with id `id`.
pub async fn view<C: Connection>(
    conn: &C,
    schema: &Schema,
    metadata: &Metadata,
    resource: &str,
    id: &Id,
    fields: &BTreeSet<String>,
    max_depth: usize,
) -> Result<Option<Value>> {
    let request = Request::new()
        .fields(fields.iter().cloned())
        .max_depth(max_depth);
    let (query, projection) = resolve(schema, metadata, resource, &request)?;
    let (records, _) = load(conn, metadata, &query, Some(id), 0, 1).await?;
    Ok(reconstruct::format(&projection, &records)?.pop())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::schema::{Array, Object, Resource, Scalar};
    use crate::sql::db::render::render;

    fn schema() -> Schema {
        Schema::new([Resource::new(
            "users",
            Object::new()
                .field("name", Scalar::string().required().indexed())
                .field("manager", Scalar::relation("users"))
                .field("tags", Array::of(Scalar::string().indexed())),
        )
        .soft_delete()])
        .unwrap()
    }

    fn compile(request: &Request) -> Select {
        let schema = schema();
        let metadata = Metadata::build(&schema).unwrap();
        let (query, _) = resolve(&schema, &metadata, "users", request).unwrap();
        generate(&query, None, request.offset, request.limit).unwrap()
    }

    #[test]
    fn test_generate_minimal() {
        let rendered = render(&compile(&Request::new()).into());
        assert_eq!(
            rendered.sql,
            concat!(
                r#"SELECT "t0"."_id" AS "f0", "__page"."__total" AS "__total" "#,
                r#"FROM (SELECT "t0"."_id" AS "__id", "#,
                r#"ROW_NUMBER() OVER (ORDER BY "t0"."_id" ASC NULLS LAST) AS "__rank", "#,
                r#"COUNT(*) OVER () AS "__total" "#,
                r#"FROM "users" AS "t0" WHERE "t0"."_isDeleted" = $1 GROUP BY "t0"."_id") AS "__page" "#,
                r#"JOIN "users" AS "t0" ON "__page"."__id" = "t0"."_id" "#,
                r#"WHERE ("__page"."__rank" > $2 AND "__page"."__rank" <= $3) "#,
                r#"ORDER BY "__page"."__rank" ASC NULLS LAST"#,
            )
        );
        assert_eq!(
            rendered.params,
            vec![
                db::Value::Bool(false),
                db::Value::Int8(0),
                db::Value::Int8(20)
            ]
        );
    }

    #[test]
    fn test_generate_joins() {
        // Filtering on tags joins the tags lookup into the page stage only; projecting the
        // manager's name joins the manager lookup into the projection stage only.
        let select = compile(
            &Request::new()
                .field("manager.name")
                .filter("tags", Filter::eq("admin"))
                .sort("name", SortOrder::Desc)
                .offset(10)
                .limit(5),
        );
        let FromItem::Subquery { select: page, .. } = &select.from else {
            panic!("expected a page subquery, got {:?}", select.from);
        };
        assert_eq!(page.joins.len(), 1);
        assert_eq!(page.joins[0].item, FromItem::table("users_tags", "t2"));
        assert_eq!(page.group_by.len(), 2);

        // The root join, then the manager.
        assert_eq!(select.joins.len(), 2);
        assert_eq!(select.joins[1].item, FromItem::table("users", "t1"));
        assert_eq!(select.joins[1].lhs, Column::qualified("t0", "manager"));
        assert_eq!(select.joins[1].rhs, Column::qualified("t1", "_id"));

        let rendered = render(&select.into());
        assert!(rendered.sql.contains(
            r#"ROW_NUMBER() OVER (ORDER BY "t0"."name" DESC NULLS FIRST, "t0"."_id" ASC NULLS LAST)"#
        ));
        assert!(rendered.params.contains(&db::Value::Int8(10)));
        assert!(rendered.params.contains(&db::Value::Int8(15)));
    }

    #[test]
    fn test_generate_array_order() {
        let select = compile(&Request::new().field("tags"));
        assert_eq!(
            select.order_by,
            vec![
                OrderBy::asc(Column::qualified(PAGE, RANK)),
                OrderBy::asc(Column::qualified("t1", INDEX)),
            ]
        );
    }

    #[test]
    fn test_filter_clause() {
        let col = Column::qualified("t0", "age");
        assert_eq!(
            filter_clause(col.clone(), &Filter::Eq(Value::Null)).unwrap(),
            WhereClause::from(Boolean::IsNull(col.clone()))
        );
        assert_eq!(
            filter_clause(col.clone(), &Filter::at_least(3)).unwrap(),
            WhereClause::from(Boolean::cmp(col.clone(), CmpOp::Ge, 3i64))
        );
        assert_eq!(
            filter_clause(col.clone(), &Filter::one_of([Value::Null, 1.into()])).unwrap(),
            WhereClause::Any(vec![
                Boolean::one_of(col.clone(), [1i64]).into(),
                Boolean::IsNull(col).into(),
            ])
        );
    }
}
