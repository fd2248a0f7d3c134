//! Compilation of resource updates.

use super::{
    db_error, insert,
    integrity::check_foreign_ids,
    structure::{structure, Mode},
};
use crate::{
    error::Result,
    resource::{
        metadata::{Metadata, IS_DELETED, RESOURCE_ID},
        schema::{Schema, ID_FIELD},
        value::{Id, Value},
    },
    sql::db::{Boolean, CmpOp, Connection, Statement, Transaction, WhereClause},
};

/// Replace the fields of resource `id` which are present in `payload`.
///
/// Arrays present in the payload are replaced as a whole: their old elements are deleted and the
/// new ones inserted. Returns `false` if there is no such resource (or it has been deleted).
pub async fn execute<C: Connection>(
    conn: &C,
    schema: &Schema,
    metadata: &Metadata,
    resource: &str,
    id: &Id,
    payload: Value,
) -> Result<bool> {
    let meta = metadata.resource(resource)?;
    let structured = structure(schema, metadata, resource, id, payload, Mode::Update)?;
    check_foreign_ids(conn, schema, metadata, structured.foreign_ids.values()).await?;

    // The update of the main row doubles as the existence check. With nothing to set, set the id
    // to itself.
    let mut set = structured.main.into_iter().collect::<Vec<_>>();
    if set.is_empty() {
        set.push((ID_FIELD.to_string(), id.as_str().into()));
    }
    let mut filter = vec![Boolean::cmp(ID_FIELD, CmpOp::Eq, id.as_str())];
    if meta.soft_delete {
        filter.push(Boolean::cmp(IS_DELETED, CmpOp::Eq, false));
    }
    let mut transaction = Transaction::default();
    transaction.push_guard(Statement::Update {
        table: meta.structure.clone(),
        set,
        filter: WhereClause::all(filter),
    });

    // Children first, although cascading would take care of them anyway.
    for satellite in meta.satellites().collect::<Vec<_>>().into_iter().rev() {
        if structured.cleared.contains(&satellite.name) {
            transaction.push(Statement::Delete {
                table: satellite.name.clone(),
                filter: Boolean::cmp(RESOURCE_ID, CmpOp::Eq, id.as_str()).into(),
            });
        }
    }
    for satellite in meta.satellites() {
        if let Some(records) = structured.records.get(&satellite.name) {
            transaction.push(insert(&satellite.name, records));
        }
    }

    let updated = conn
        .transaction(transaction)
        .await
        .map_err(|err| db_error(metadata, err))?;
    tracing::info!(resource, %id, updated, "updated resource");
    Ok(updated)
}
