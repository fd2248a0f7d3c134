//! Registration of the storage layout of every resource in the database schema.

use super::{db_error, db_type};
use crate::{
    error::Result,
    resource::{
        metadata::{Metadata, ResourceMetadata},
        schema::ID_FIELD,
    },
    sql::db::{Connection, ConstraintKind, SchemaColumn, Statement},
};
use futures::future::try_join_all;

/// Create every structure, index and constraint described by `metadata`.
///
/// Every statement is idempotent, so this can be run against a database which already has some or
/// all of the layout.
pub async fn execute<C: Connection>(conn: &C, metadata: &Metadata) -> Result<()> {
    let resources = metadata.resources().collect::<Vec<_>>();

    // Foreign keys may reference the tables of any resource (including tables created later in
    // this pass), so they are deferred until every table exists.
    let tables = resources
        .iter()
        .flat_map(|meta| create_tables(meta))
        .collect::<Vec<_>>();
    let indexes = resources
        .iter()
        .flat_map(|meta| create_indexes(meta))
        .collect::<Vec<_>>();
    let constraints = resources
        .iter()
        .flat_map(|meta| add_foreign_keys(meta))
        .collect::<Vec<_>>();

    tracing::info!(
        resources = resources.len(),
        tables = tables.len(),
        indexes = indexes.len(),
        foreign_keys = constraints.len(),
        "registering structures"
    );
    for phase in [tables, indexes, constraints] {
        try_join_all(phase.iter().map(|statement| conn.execute(statement)))
            .await
            .map_err(|err| db_error(metadata, err))?;
    }
    Ok(())
}

fn create_tables(meta: &ResourceMetadata) -> impl Iterator<Item = Statement> + '_ {
    meta.structures.iter().map(|structure| Statement::CreateTable {
        table: structure.name.clone(),
        columns: structure
            .columns
            .iter()
            .map(|col| SchemaColumn::new(&col.name, db_type(col.ty)))
            .collect(),
        constraints: vec![(ConstraintKind::PrimaryKey, vec![ID_FIELD.to_string()])],
    })
}

fn create_indexes(meta: &ResourceMetadata) -> impl Iterator<Item = Statement> + '_ {
    meta.indexes.iter().map(|index| Statement::CreateIndex {
        table: index.structure.clone(),
        column: index.column.clone(),
        unique: index.unique,
    })
}

fn add_foreign_keys(meta: &ResourceMetadata) -> impl Iterator<Item = Statement> + '_ {
    meta.foreign_keys.iter().map(|fk| Statement::AddConstraint {
        table: fk.structure.clone(),
        kind: ConstraintKind::ForeignKey {
            table: fk.target.clone(),
            cascade: fk.cascade,
        },
        columns: vec![fk.column.clone()],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::init_logging;
    use crate::resource::schema::{Array, Object, Resource, Scalar, Schema};
    use crate::sql::db::{mock, Type};

    fn metadata() -> Metadata {
        let schema = Schema::new([
            Resource::new(
                "users",
                Object::new()
                    .field("email", Scalar::string().unique())
                    .field("manager", Scalar::relation("users")),
            ),
            Resource::new(
                "blogPosts",
                Object::new()
                    .field("author", Scalar::relation("users"))
                    .field("tags", Array::of(Scalar::string())),
            )
            .soft_delete(),
        ])
        .unwrap();
        Metadata::build(&schema).unwrap()
    }

    #[async_std::test]
    async fn test_register() {
        init_logging();

        let metadata = metadata();
        let conn = mock::Connection::create();
        execute(&conn, &metadata).await.unwrap();
        let schema = conn.schema().await;
        assert_eq!(
            schema.keys().collect::<Vec<_>>(),
            ["blog_posts", "blog_posts_tags", "users"]
        );

        let posts = &schema["blog_posts"];
        assert_eq!(
            posts.columns,
            vec![
                SchemaColumn::new("_id", Type::Text),
                SchemaColumn::new("_isDeleted", Type::Bool),
                SchemaColumn::new("author", Type::Text),
                SchemaColumn::new("tags", Type::Bool),
            ]
        );
        assert!(posts.constraints.contains(&(
            ConstraintKind::ForeignKey {
                table: "users".into(),
                cascade: false
            },
            vec!["author".into()]
        )));
        assert!(schema["blog_posts_tags"].constraints.contains(&(
            ConstraintKind::ForeignKey {
                table: "blog_posts".into(),
                cascade: true
            },
            vec!["_parentId".into()]
        )));
        assert!(schema["users"]
            .indexes
            .contains(&("email".to_string(), true)));

        // Registering again changes nothing.
        execute(&conn, &metadata).await.unwrap();
        assert_eq!(conn.schema().await, schema);
    }
}
