//! Referential integrity checks which run before writes and deletes.
//!
//! The database enforces foreign keys too, but it cannot tell which logical field a violation came
//! from, nor apply relation filters or soft deletion. These checks run first so that the errors
//! callers see name the offending field.

use super::{db_error, select, structure::ForeignIds};
use crate::{
    error::{Error, Result},
    resource::{
        metadata::{Metadata, IS_DELETED, RESOURCE_ID},
        query::resolve,
        request::Request,
        schema::{Schema, ID_FIELD},
        value::Id,
    },
    sql::db::{
        self, Boolean, CmpOp, Column, Connection, Expr, FromItem, JoinKind, Row, Select, Statement,
    },
};
use std::collections::BTreeSet;

/// Check that every id in `foreign_ids` references an existing resource matching the filters of
/// its relation.
///
/// All relations are checked in a single query.
///
/// # Errors
///
/// `NO_RESOURCE` naming the first relation (by path) with an unmatched id. Soft-deleted resources
/// do not match unless the referenced resource allows deleted references.
pub async fn check_foreign_ids<'a, C: Connection>(
    conn: &C,
    schema: &Schema,
    metadata: &Metadata,
    foreign_ids: impl IntoIterator<Item = &'a ForeignIds>,
) -> Result<()> {
    let foreign_ids = foreign_ids.into_iter().collect::<Vec<_>>();
    if foreign_ids.is_empty() {
        return Ok(());
    }

    let mut branches = vec![];
    for edge in &foreign_ids {
        let request = Request {
            filters: edge.filters.clone(),
            ..Request::new()
        };
        let (mut query, _) = resolve(schema, metadata, &edge.resource, &request)?;
        if schema.resource(&edge.resource)?.allow_deleted_references {
            query.exclude_deleted = false;
        }
        branches.push(select::candidates(&query, &edge.path, &edge.ids)?);
    }
    let rows = conn
        .query(&Statement::Union(branches))
        .await
        .map_err(|err| db_error(metadata, err))?;
    let mut found = BTreeSet::new();
    for row in rows {
        let label = text(metadata, &row, "label")?;
        let id = text(metadata, &row, "id")?;
        found.insert((label, id));
    }

    for edge in foreign_ids {
        if let Some(id) = edge
            .ids
            .iter()
            .find(|id| !found.contains(&(edge.path.clone(), id.to_string())))
        {
            tracing::warn!(
                path = %edge.path,
                %id,
                target = %edge.resource,
                "missing relation target"
            );
            return Err(Error::NoResource {
                path: edge.path.clone(),
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

/// Check that no other resource references the resource `id` of type `resource`.
///
/// References held by soft-deleted resources, and references a resource holds to itself, do not
/// count.
///
/// # Errors
///
/// `RESOURCE_REFERENCED` naming a resource type and field which still references `id`.
pub async fn check_references<C: Connection>(
    conn: &C,
    metadata: &Metadata,
    resource: &str,
    id: &Id,
) -> Result<()> {
    let meta = metadata.resource(resource)?;
    let mut branches = vec![];
    for (owner, sites) in &meta.inverted_relations {
        let owner_meta = metadata.resource(owner)?;
        for site in sites {
            // Satellite sites join the owner's main structure, which holds its id and deletion
            // marker.
            let (mut select, root) = if site.structure == owner_meta.structure {
                (Select::from(FromItem::table(&site.structure, "s")), "s")
            } else {
                (
                    Select::from(FromItem::table(&site.structure, "s")).join(
                        JoinKind::Inner,
                        FromItem::table(&owner_meta.structure, "r"),
                        Column::qualified("s", RESOURCE_ID),
                        Column::qualified("r", ID_FIELD),
                    ),
                    "r",
                )
            };
            select = select.filter(Boolean::cmp(
                Column::qualified("s", &site.column),
                CmpOp::Eq,
                id.as_str(),
            ));
            if owner_meta.soft_delete {
                select = select.filter(Boolean::cmp(
                    Column::qualified(root, IS_DELETED),
                    CmpOp::Eq,
                    false,
                ));
            }
            if owner == resource {
                select = select.filter(Boolean::cmp(
                    Column::qualified(root, ID_FIELD),
                    CmpOp::Ne,
                    id.as_str(),
                ));
            }
            branches.push(
                select
                    .column(Expr::Param(owner.as_str().into()), "resource")
                    .column(Expr::Param(site.path.as_str().into()), "path")
                    .limit(1),
            );
        }
    }
    if branches.is_empty() {
        return Ok(());
    }

    let rows = conn
        .query(&Statement::Union(branches))
        .await
        .map_err(|err| db_error(metadata, err))?;
    match rows.first() {
        Some(row) => {
            let referrer = text(metadata, row, "resource")?;
            let path = text(metadata, row, "path")?;
            tracing::warn!(resource, %id, %referrer, %path, "delete blocked by reference");
            Err(Error::ResourceReferenced {
                resource: referrer,
                path,
            })
        }
        None => Ok(()),
    }
}

pub(super) fn text<R: Row>(metadata: &Metadata, row: &R, alias: &str) -> Result<String> {
    match row.column(alias).map_err(|err| db_error(metadata, err))? {
        db::Value::Text(s) => Ok(s),
        value => Err(Error::Backend {
            error: format!("expected text in column {alias}, got {value}"),
        }),
    }
}
