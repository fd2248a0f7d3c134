//! Compilation of resource creation into inserts.

use super::{
    db_error, insert,
    integrity::check_foreign_ids,
    structure::{structure, Mode},
};
use crate::{
    error::Result,
    resource::{
        metadata::Metadata,
        schema::Schema,
        value::{Id, Value},
    },
    sql::db::{Connection, Transaction},
};

/// Create a resource of type `resource` from `payload`.
///
/// The main row and every satellite record are inserted in one transaction, parents before
/// children.
pub async fn execute<C: Connection>(
    conn: &C,
    schema: &Schema,
    metadata: &Metadata,
    resource: &str,
    payload: Value,
) -> Result<Id> {
    let meta = metadata.resource(resource)?;
    let id = Id::generate();
    let structured = structure(schema, metadata, resource, &id, payload, Mode::Create)?;
    check_foreign_ids(conn, schema, metadata, structured.foreign_ids.values()).await?;

    let mut transaction = Transaction::default();
    transaction.push(insert(&meta.structure, &[structured.main]));
    for satellite in meta.satellites() {
        if let Some(records) = structured.records.get(&satellite.name) {
            transaction.push(insert(&satellite.name, records));
        }
    }
    conn.transaction(transaction)
        .await
        .map_err(|err| db_error(metadata, err))?;

    tracing::info!(resource, %id, "created resource");
    Ok(id)
}
