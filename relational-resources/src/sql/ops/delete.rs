//! Compilation of resource deletion.

use super::{
    db_error,
    integrity::{check_references, text},
};
use crate::{
    error::Result,
    resource::{
        metadata::{Metadata, RelationSite, ResourceMetadata, IS_DELETED, RESOURCE_ID},
        schema::ID_FIELD,
        value::Id,
    },
    sql::db::{
        self, Boolean, CmpOp, Column, Connection, FromItem, JoinKind, Select, Statement,
        Transaction, WhereClause,
    },
};

/// Delete resource `id` of type `resource`.
///
/// Resources of soft-deleting types are only marked as deleted. Any other resource is removed
/// along with its satellite records. Returns `false` if there is no such resource (or it has
/// already been deleted).
///
/// # Errors
///
/// `RESOURCE_REFERENCED` if another (non-deleted) resource still references this one.
pub async fn execute<C: Connection>(
    conn: &C,
    metadata: &Metadata,
    resource: &str,
    id: &Id,
) -> Result<bool> {
    let meta = metadata.resource(resource)?;
    check_references(conn, metadata, resource, id).await?;
    let transaction = plan(conn, metadata, meta, id).await?;
    let deleted = conn
        .transaction(transaction)
        .await
        .map_err(|err| db_error(metadata, err))?;
    tracing::info!(resource, %id, deleted, soft = meta.soft_delete, "deleted resource");
    Ok(deleted)
}

/// The statements deleting `id`, the last of which is the guard.
async fn plan<C: Connection>(
    conn: &C,
    metadata: &Metadata,
    meta: &ResourceMetadata,
    id: &Id,
) -> Result<Transaction> {
    let by_id = Boolean::cmp(ID_FIELD, CmpOp::Eq, id.as_str());
    let mut transaction = Transaction::default();
    if meta.soft_delete {
        transaction.push_guard(Statement::Update {
            table: meta.structure.clone(),
            set: vec![(IS_DELETED.to_string(), db::Value::Bool(true))],
            filter: WhereClause::all([by_id, Boolean::cmp(IS_DELETED, CmpOp::Eq, false)]),
        });
        return Ok(transaction);
    }

    // Soft-deleted resources may still hold references to this one, which the database would
    // refuse to leave dangling. References held by live resources are left for the foreign key
    // to reject.
    for (owner, sites) in &meta.inverted_relations {
        let owner = metadata.resource(owner)?;
        if !owner.soft_delete {
            continue;
        }
        for site in sites {
            if let Some(statement) = release(conn, metadata, owner, site, id).await? {
                transaction.push(statement);
            }
        }
    }
    for satellite in meta.satellites().collect::<Vec<_>>().into_iter().rev() {
        transaction.push(Statement::Delete {
            table: satellite.name.clone(),
            filter: Boolean::cmp(RESOURCE_ID, CmpOp::Eq, id.as_str()).into(),
        });
    }
    transaction.push_guard(Statement::Delete {
        table: meta.structure.clone(),
        filter: by_id.into(),
    });
    Ok(transaction)
}

/// Clear the references to `id` which deleted resources of type `owner` hold at `site`.
///
/// Deleted resources are never modified again, so the satellite rows holding such references can
/// be found ahead of the transaction.
async fn release<C: Connection>(
    conn: &C,
    metadata: &Metadata,
    owner: &ResourceMetadata,
    site: &RelationSite,
    id: &Id,
) -> Result<Option<Statement>> {
    let references = Boolean::cmp(site.column.as_str(), CmpOp::Eq, id.as_str());
    if site.structure == owner.structure {
        return Ok(Some(Statement::Update {
            table: site.structure.clone(),
            set: vec![(site.column.clone(), db::Value::Null)],
            filter: WhereClause::all([references, Boolean::cmp(IS_DELETED, CmpOp::Eq, true)]),
        }));
    }

    let select = Select::from(FromItem::table(&site.structure, "s"))
        .join(
            JoinKind::Inner,
            FromItem::table(&owner.structure, "r"),
            Column::qualified("s", RESOURCE_ID),
            Column::qualified("r", ID_FIELD),
        )
        .filter(Boolean::cmp(
            Column::qualified("s", &site.column),
            CmpOp::Eq,
            id.as_str(),
        ))
        .filter(Boolean::cmp(
            Column::qualified("r", IS_DELETED),
            CmpOp::Eq,
            true,
        ))
        .column(Column::qualified("s", ID_FIELD), "id");
    let rows = conn
        .query(&select.into())
        .await
        .map_err(|err| db_error(metadata, err))?;
    if rows.is_empty() {
        return Ok(None);
    }
    let rows = rows
        .iter()
        .map(|row| text(metadata, row, "id"))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(Statement::Update {
        table: site.structure.clone(),
        set: vec![(site.column.clone(), db::Value::Null)],
        filter: Boolean::one_of(ID_FIELD, rows).into(),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        init_logging,
        resource::{
            schema::{Array, Object, Resource, Scalar, Schema},
            value::Value,
        },
        sql::{
            db::mock,
            ops::{insert, register, Record},
        },
        Error,
    };

    fn schema() -> Schema {
        Schema::new([
            Resource::new(
                "companies",
                Object::new().field("name", Scalar::string()),
            ),
            Resource::new(
                "users",
                Object::new()
                    .field("employer", Scalar::relation("companies"))
                    .field(
                        "jobs",
                        Array::of(Object::new().field("company", Scalar::relation("companies"))),
                    ),
            )
            .soft_delete(),
        ])
        .unwrap()
    }

    fn employee(company: &Id) -> Value {
        Value::object([
            ("employer", Value::Id(company.clone())),
            (
                "jobs",
                Value::array([Value::object([("company", Value::Id(company.clone()))])]),
            ),
        ])
    }

    #[async_std::test]
    async fn test_live_references_survive() {
        init_logging();
        let schema = schema();
        let metadata = Metadata::build(&schema).unwrap();
        let conn = mock::Connection::create();
        register::execute(&conn, &metadata).await.unwrap();

        let acme = insert::execute(
            &conn,
            &schema,
            &metadata,
            "companies",
            Value::object([("name", "Acme".into())]),
        )
        .await
        .unwrap();
        let gone = insert::execute(&conn, &schema, &metadata, "users", employee(&acme))
            .await
            .unwrap();
        let live = insert::execute(&conn, &schema, &metadata, "users", employee(&acme))
            .await
            .unwrap();
        assert!(execute(&conn, &metadata, "users", &gone).await.unwrap());

        // A live reference which appears after the reference check: only the references held by
        // the deleted user are released, and the foreign key rejects the delete.
        let companies = metadata.resource("companies").unwrap();
        let mut transaction = plan(&conn, &metadata, companies, &acme).await.unwrap();
        let guard = transaction.statements.pop().unwrap();
        for statement in &transaction.statements {
            conn.execute(statement).await.unwrap();
        }
        let reference = |rows: &[Record], owner_column: &str, owner: &Id, column: &str| {
            rows.iter()
                .find(|row| row[owner_column] == db::Value::from(owner.as_str()))
                .map(|row| row[column].clone())
                .unwrap()
        };
        let users = conn.dump("users").await.unwrap();
        assert_eq!(reference(&users, ID_FIELD, &gone, "employer"), db::Value::Null);
        assert_eq!(
            reference(&users, ID_FIELD, &live, "employer"),
            db::Value::from(acme.as_str())
        );
        let jobs = conn.dump("users_jobs").await.unwrap();
        assert_eq!(reference(&jobs, RESOURCE_ID, &gone, "company"), db::Value::Null);
        assert_eq!(
            reference(&jobs, RESOURCE_ID, &live, "company"),
            db::Value::from(acme.as_str())
        );

        let err = conn.execute(&guard).await.unwrap_err();
        assert_eq!(
            db_error(&metadata, err),
            Error::ResourceReferenced {
                resource: "users".into(),
                path: "employer".into()
            }
        );

        // Once the last live reference is gone, the delete goes through.
        assert!(execute(&conn, &metadata, "users", &live).await.unwrap());
        assert!(execute(&conn, &metadata, "companies", &acme).await.unwrap());
        assert!(conn.dump("companies").await.unwrap().is_empty());
    }
}
