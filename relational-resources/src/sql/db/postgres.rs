//! Instantiation of the abstract [`db`](super) interface for PostgreSQL.
//!
//! This instantiation is built on [`async-postgres`]. Statements are [rendered](super::render) to
//! text with numbered parameters and run through the extended query protocol.
#![cfg(feature = "postgres")]

use super::{
    parse_key_detail,
    render::{render, Rendered},
    Statement, Transaction, Value, Violation,
};
use async_std::{
    sync::{RwLock, RwLockReadGuard},
    task::spawn,
};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use derive_more::From;
use futures::TryStreamExt;
use snafu::Snafu;
use std::error::Error as _;
use std::fmt::Display;
use tokio_postgres::{
    error::{DbError, SqlState},
    types::{accepts, to_sql_checked, FromSql, IsNull, ToSql, Type},
    Client,
};

pub use async_postgres::{Config, Row};

/// Errors returned by a PostgreSQL database.
#[derive(Debug, Snafu, From)]
pub enum Error {
    #[from]
    Sql {
        source: async_postgres::Error,
    },
    Connect {
        source: std::io::Error,
    },
    UnsupportedType {
        ty: Type,
    },
    Custom {
        message: String,
    },
}

impl Error {
    fn db_error(&self) -> Option<&DbError> {
        match self {
            Self::Sql { source } => source.source()?.downcast_ref::<DbError>(),
            _ => None,
        }
    }
}

impl super::Error for Error {
    fn custom(msg: impl Display) -> Self {
        Self::Custom {
            message: msg.to_string(),
        }
    }

    fn violation(&self) -> Option<Violation> {
        let err = self.db_error()?;
        if *err.code() == SqlState::UNIQUE_VIOLATION {
            let (column, value) = parse_key_detail(err.detail()?)?;
            Some(Violation::Unique {
                table: err.table()?.to_string(),
                column,
                value,
            })
        } else if *err.code() == SqlState::FOREIGN_KEY_VIOLATION {
            // The detail only names the referenced key, so take the referencing table and column
            // from the constraint, which is named `<table>-fk-<column>`.
            let (table, column) = err.constraint()?.split_once("-fk-")?;
            Some(Violation::ForeignKey {
                table: table.to_string(),
                column: column.to_string(),
            })
        } else {
            None
        }
    }

    fn is_connection(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            Self::Sql { source } => source.is_closed(),
            _ => false,
        }
    }
}

/// A connection to a PostgreSQL database.
///
/// The connection is established lazily, on first use. If it is lost, the next statement
/// reconnects. Statements share a single client: queries run concurrently under a read lock, while
/// transactions hold the write lock for their duration.
pub struct Connection {
    config: Config,
    client: RwLock<Option<Client>>,
}

impl Connection {
    /// A connection which will connect with `config` when it is first used.
    pub fn lazy(config: Config) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    /// Establish a new connection with the given [`Config`].
    pub async fn new(config: Config) -> Result<Self, Error> {
        let conn = Self::lazy(config);
        *conn.client.write().await = Some(conn.connect().await?);
        Ok(conn)
    }

    async fn connect(&self) -> Result<Client, Error> {
        tracing::info!(config = ?self.config, "connecting to database");
        let (client, conn) = async_postgres::connect(self.config.clone())
            .await
            .map_err(|source| Error::Connect { source })?;
        spawn(conn);
        Ok(client)
    }

    /// Make sure the client is connected, reconnecting if necessary.
    async fn ensure_connected(&self) -> Result<(), Error> {
        if let Some(client) = &*self.client.read().await {
            if !client.is_closed() {
                return Ok(());
            }
        }
        let mut client = self.client.write().await;
        // Someone else may have reconnected while we were waiting for the lock.
        if client.as_ref().map_or(true, Client::is_closed) {
            *client = Some(self.connect().await?);
        }
        Ok(())
    }

    /// The connected client, connecting first if necessary.
    async fn client(&self) -> Result<RwLockReadGuard<'_, Option<Client>>, Error> {
        self.ensure_connected().await?;
        Ok(self.client.read().await)
    }
}

fn not_connected() -> Error {
    Error::Custom {
        message: "not connected".into(),
    }
}

fn log(statement: &Statement) -> Rendered {
    let rendered = render(statement);
    tracing::info!(params = ?rendered.params, "{}", rendered.sql);
    rendered
}

fn params(params: &[Value]) -> impl ExactSizeIterator<Item = &dyn ToSql> {
    params.iter().map(|param| {
        let param: &dyn ToSql = param;
        param
    })
}

#[async_trait]
impl super::Connection for Connection {
    type Error = Error;
    type Row = Row;

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, Error> {
        let client = self.client().await?;
        let client = client.as_ref().ok_or_else(not_connected)?;
        let Rendered { sql, params: values } = log(statement);
        let rows = client.query_raw(sql.as_str(), params(&values)).await?;
        Ok(rows.try_collect().await?)
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, Error> {
        let client = self.client().await?;
        let client = client.as_ref().ok_or_else(not_connected)?;
        let Rendered { sql, params: values } = log(statement);
        Ok(client.execute_raw(sql.as_str(), params(&values)).await?)
    }

    async fn transaction(&self, transaction: Transaction) -> Result<bool, Error> {
        self.ensure_connected().await?;
        let mut client = self.client.write().await;
        let client = client.as_mut().ok_or_else(not_connected)?;
        let tx = client.transaction().await?;
        for (i, statement) in transaction.statements.iter().enumerate() {
            let Rendered { sql, params: values } = log(statement);
            let affected = tx.execute_raw(sql.as_str(), params(&values)).await?;
            if transaction.guard == Some(i) && affected == 0 {
                tracing::info!("guard statement affected no rows, rolling back");
                tx.rollback().await?;
                return Ok(false);
            }
        }
        tx.commit().await?;
        Ok(true)
    }
}

impl super::Row for Row {
    type Error = Error;

    fn column(&self, alias: &str) -> Result<Value, Self::Error> {
        Ok(self.try_get(alias)?)
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>
    where
        Self: Sized,
    {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(x) => x.to_sql(ty, out),
            Self::Int8(x) => x.to_sql(ty, out),
            Self::Float8(x) => x.to_sql(ty, out),
            Self::Text(x) => x.to_sql(ty, out),
            Self::Bytes(x) => x.to_sql(ty, out),
            Self::Timestamp(x) => x.to_sql(ty, out),
        }
    }

    accepts!(BOOL, INT8, FLOAT8, TEXT, VARCHAR, BYTEA, TIMESTAMPTZ);
    to_sql_checked!();
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        match ty {
            &Type::BOOL => Ok(Self::Bool(bool::from_sql(ty, raw)?)),
            &Type::INT4 => Ok(Self::Int8(i32::from_sql(ty, raw)?.into())),
            &Type::INT8 => Ok(Self::Int8(i64::from_sql(ty, raw)?)),
            &Type::FLOAT8 => Ok(Self::Float8(f64::from_sql(ty, raw)?)),
            &Type::TEXT | &Type::VARCHAR => Ok(Self::Text(String::from_sql(ty, raw)?)),
            &Type::BYTEA => Ok(Self::Bytes(Vec::<u8>::from_sql(ty, raw)?)),
            &Type::TIMESTAMPTZ => Ok(Self::Timestamp(DateTime::<Utc>::from_sql(ty, raw)?)),
            ty => Err(Box::new(Error::UnsupportedType { ty: ty.clone() })),
        }
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(Self::Null)
    }

    accepts!(BOOL, INT4, INT8, FLOAT8, TEXT, VARCHAR, BYTEA, TIMESTAMPTZ);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        init_logging,
        resource::{
            backend::DataSource,
            schema::{Object, Resource, Scalar, Schema},
            Request, Value as ResourceValue,
        },
        sql::data_source::SqlDataSource,
    };
    use rand::RngCore;
    use std::env;
    use std::process::Command;
    use std::str;

    struct Db {
        name: String,
        port: u16,
        password: String,
    }

    impl Db {
        fn create() -> Option<Self> {
            if env::var("POSTGRES_TESTS").is_err() {
                tracing::warn!("skipping postgres test since POSTGRES_TESTS are not enabled");
                return None;
            }

            let name = format!("db{}", rand::thread_rng().next_u64());
            let port = env::var("POSTGRES_TESTS_PORT")
                .map(|port| port.parse().unwrap())
                .unwrap_or(5432);
            let password = env::var("POSTGRES_TESTS_PASSWORD").unwrap_or("password".to_string());

            tracing::info!("Creating test DB {name} on port {port}");
            let output = Command::new("createdb")
                .arg("-h")
                .arg("127.0.0.1")
                .arg("-p")
                .arg(&port.to_string())
                .arg("-U")
                .arg("postgres")
                .arg(&name)
                .env("PGPASSWORD", &password)
                .output()
                .unwrap();
            if !output.status.success() {
                panic!(
                    "createdb failed: {}",
                    str::from_utf8(&output.stderr).unwrap()
                );
            }

            Some(Self {
                name,
                port,
                password,
            })
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config
                .dbname(&self.name)
                .host("127.0.0.1")
                .user("postgres")
                .password(&self.password)
                .port(self.port);
            config
        }
    }

    impl Drop for Db {
        fn drop(&mut self) {
            tracing::info!("Dropping test DB {}", self.name);
            let output = Command::new("dropdb")
                .arg("-h")
                .arg("127.0.0.1")
                .arg("-p")
                .arg(&self.port.to_string())
                .arg("-U")
                .arg("postgres")
                .arg(&self.name)
                .env("PGPASSWORD", &self.password)
                .output()
                .unwrap();
            if !output.status.success() {
                tracing::error!("dropdb failed: {}", str::from_utf8(&output.stderr).unwrap());
            }
        }
    }

    macro_rules! postgres_test {
        () => {
            match Db::create() {
                Some(db) => db,
                None => return,
            }
        };
    }

    fn schema() -> Schema {
        Schema::new([Resource::new(
            "users",
            Object::new()
                .field("email", Scalar::string().required().unique())
                .field("manager", Scalar::relation("users")),
        )])
        .unwrap()
    }

    #[async_std::test]
    async fn test_postgres_data_source() {
        init_logging();
        let db = postgres_test!();
        let source = SqlDataSource::new(Connection::lazy(db.config()), schema()).unwrap();
        source.create_structures().await.unwrap();
        // Registration is idempotent.
        source.create_structures().await.unwrap();

        let ada = source
            .create(
                "users",
                ResourceValue::object([("email", ResourceValue::from("ada@example.com"))]),
            )
            .await
            .unwrap();
        let err = source
            .create(
                "users",
                ResourceValue::object([("email", ResourceValue::from("ada@example.com"))]),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            crate::Error::DuplicateResource {
                path: "email".into(),
                value: "ada@example.com".into(),
            }
        );

        let grace = source
            .create(
                "users",
                ResourceValue::object([
                    ("email", ResourceValue::from("grace@example.com")),
                    ("manager", ResourceValue::Id(ada.clone())),
                ]),
            )
            .await
            .unwrap();

        let page = source
            .search(
                "users",
                &Request::new()
                    .fields(["email", "manager.email"])
                    .filter("manager", crate::resource::Filter::eq(ada.as_str())),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(
            page.results[0].get("manager.email"),
            Some(&ResourceValue::from("ada@example.com"))
        );
        assert_eq!(page.results[0].get("_id"), Some(&ResourceValue::Id(grace)));

        assert_eq!(
            source.delete("users", &ada).await.unwrap_err().code(),
            "RESOURCE_REFERENCED"
        );
    }

    #[async_std::test]
    async fn test_connection_failed() {
        init_logging();
        let mut config = Config::default();
        config
            .host("127.0.0.1")
            .port(1)
            .user("postgres")
            .dbname("nothing");
        let source = SqlDataSource::new(Connection::lazy(config), schema()).unwrap();
        let err = source.create_structures().await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert!(err.is_retryable());
    }
}
