//! Abstract interface to a SQL database.
//!
//! Queries are described by a typed AST ([`Statement`] and friends) rather than by strings. A
//! [`Connection`] executes statements, either by rendering them to SQL (see [`render`]) or, in the
//! case of the [mock] database, by interpreting them directly.

use crate::resource::query::TextPattern;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

pub mod mock;
pub mod postgres;
pub mod render;

/// Errors returned by the database.
pub trait Error: Sized + Send + Sync + std::error::Error {
    /// Wrap a custom message into this error type.
    fn custom(msg: impl Display) -> Self;

    /// An error indicating that a query returned more than the `expected` number of rows.
    fn too_many_rows(expected: usize) -> Self {
        Self::custom(format!(
            "query result has more rows than the expected {expected}"
        ))
    }

    /// An error indicating that a query which was expected to return some rows did not.
    fn empty_rows() -> Self {
        Self::custom("query result is empty")
    }

    /// The integrity constraint this error reports a violation of, if any.
    fn violation(&self) -> Option<Violation> {
        None
    }

    /// Whether this error means the connection to the database is unusable.
    fn is_connection(&self) -> bool {
        false
    }
}

/// A violated integrity constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// A row duplicates `value` in a unique `column` of `table`.
    Unique {
        table: String,
        column: String,
        value: String,
    },
    /// `column` of `table` references a row which does not exist, or a referenced row was deleted
    /// while still referenced.
    ForeignKey { table: String, column: String },
}

/// Parse the detail text of a key violation, `Key (column)=(value) ...`, into column and value.
pub fn parse_key_detail(detail: &str) -> Option<(String, String)> {
    let rest = detail.strip_prefix("Key (")?;
    let (column, rest) = rest.split_once(")=(")?;
    // The value may itself contain parentheses, so find the closing one before the message.
    let end = [") already exists", ") is not present"]
        .iter()
        .find_map(|tail| rest.rfind(tail))
        .or_else(|| rest.rfind(')'))?;
    Some((column.trim_matches('"').to_string(), rest[..end].to_string()))
}

/// A SQL primitive data type.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    #[display(fmt = "text")]
    Text,
    #[display(fmt = "int8")]
    Int8,
    #[display(fmt = "float8")]
    Float8,
    #[display(fmt = "boolean")]
    Bool,
    #[display(fmt = "bytea")]
    Bytea,
    #[display(fmt = "timestamptz")]
    Timestamptz,
}

/// A primitive value supported by a SQL database.
#[derive(Clone, Debug, Display, PartialEq, From)]
pub enum Value {
    #[display(fmt = "NULL")]
    #[from(ignore)]
    Null,
    #[display(fmt = "{}", _0)]
    Bool(bool),
    /// An 8-byte signed integer.
    #[display(fmt = "{}", _0)]
    Int8(i64),
    /// An 8-byte float.
    #[display(fmt = "{}", _0)]
    Float8(f64),
    /// A text string.
    #[display(fmt = "{}", _0)]
    Text(String),
    #[display(fmt = "\\x{}", "hex::encode(_0)")]
    Bytes(Vec<u8>),
    #[display(fmt = "{}", "_0.to_rfc3339()")]
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// The type of this value, or [`None`] for `NULL`.
    pub fn ty(&self) -> Option<Type> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(Type::Bool),
            Self::Int8(_) => Some(Type::Int8),
            Self::Float8(_) => Some(Type::Float8),
            Self::Text(_) => Some(Type::Text),
            Self::Bytes(_) => Some(Type::Bytea),
            Self::Timestamp(_) => Some(Type::Timestamptz),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Compare two values the way SQL does.
    ///
    /// Comparisons involving `NULL`, or values of incomparable types, are unknown ([`None`]).
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(l), Self::Bool(r)) => Some(l.cmp(r)),
            (Self::Int8(l), Self::Int8(r)) => Some(l.cmp(r)),
            (Self::Int8(l), Self::Float8(r)) => (*l as f64).partial_cmp(r),
            (Self::Float8(l), Self::Int8(r)) => l.partial_cmp(&(*r as f64)),
            (Self::Float8(l), Self::Float8(r)) => l.partial_cmp(r),
            (Self::Text(l), Self::Text(r)) => Some(l.cmp(r)),
            (Self::Bytes(l), Self::Bytes(r)) => Some(l.cmp(r)),
            (Self::Timestamp(l), Self::Timestamp(r)) => Some(l.cmp(r)),
            _ => None,
        }
    }

    /// Interpret this value as a truth value: `NULL` is unknown.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.into())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A column in a schema.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{name} {ty}")]
pub struct SchemaColumn {
    name: String,
    ty: Type,
}

impl SchemaColumn {
    /// Create a column given a name and type.
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// The name of this column
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type of this column
    pub fn ty(&self) -> Type {
        self.ty
    }
}

/// An identifier of a column in a SQL query.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column {
    pub table: Option<String>,
    pub name: String,
}

impl Column {
    /// A named column.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
        }
    }

    /// A named column, qualified by a table name (or alias).
    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    /// Escape this column name for interpolation into a SQL query.
    pub fn escape(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", escape_ident(table), escape_ident(&self.name)),
            None => escape_ident(&self.name),
        }
    }
}

impl Display for Column {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "{table}.")?;
        }
        write!(f, "{}", self.name)
    }
}

impl From<&str> for Column {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for Column {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

/// A comparison operator.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CmpOp {
    #[display(fmt = "=")]
    Eq,
    #[display(fmt = "<>")]
    Ne,
    #[display(fmt = "<")]
    Lt,
    #[display(fmt = "<=")]
    Le,
    #[display(fmt = ">")]
    Gt,
    #[display(fmt = ">=")]
    Ge,
}

impl CmpOp {
    /// Whether two values related by `ordering` satisfy this operator.
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering.is_eq(),
            Self::Ne => ordering.is_ne(),
            Self::Lt => ordering.is_lt(),
            Self::Le => ordering.is_le(),
            Self::Gt => ordering.is_gt(),
            Self::Ge => ordering.is_ge(),
        }
    }
}

/// A boolean expression in a `WHERE` clause.
#[derive(Clone, Debug, PartialEq)]
pub enum Boolean {
    Cmp {
        /// The column to filter.
        column: Column,
        /// The operation used to filter values of `column`.
        op: CmpOp,
        /// Parameter to `op`.
        param: Value,
    },
    OneOf {
        /// The column to filter.
        column: Column,
        /// Values to match `column` against.
        params: Vec<Value>,
    },
    IsNull(Column),
    /// The text representation of `column` contains every token of `pattern`, ignoring case.
    Matches { column: Column, pattern: TextPattern },
}

impl Boolean {
    /// A boolean expression which compares the value of a column to a constant.
    pub fn cmp(column: impl Into<Column>, op: CmpOp, param: impl Into<Value>) -> Self {
        Self::Cmp {
            column: column.into(),
            op,
            param: param.into(),
        }
    }

    /// A boolean expression which checks if the value of a column is one of a list of constants.
    pub fn one_of<I>(column: impl Into<Column>, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self::OneOf {
            column: column.into(),
            params: params.into_iter().map(|p| p.into()).collect(),
        }
    }
}

/// A `WHERE` clause.
#[derive(Clone, Debug, PartialEq)]
pub enum WhereClause {
    /// A `WHERE` clause which holds on any row where all of the sub-clauses hold.
    All(Vec<WhereClause>),
    /// A `WHERE` clause which holds on any row where any of the sub-clauses hold.
    Any(Vec<WhereClause>),
    /// A `WHERE` clause which holds on any row where the sub-clause is false.
    Not(Box<WhereClause>),
    /// A `WHERE` clause which holds on any row where a boolean expression is true.
    Predicate(Boolean),
}

impl From<Boolean> for WhereClause {
    fn from(b: Boolean) -> Self {
        Self::Predicate(b)
    }
}

impl WhereClause {
    /// A `WHERE` clause which holds on any row where all of the sub-clauses hold.
    pub fn all<I>(clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<WhereClause>,
    {
        let mut clauses = clauses
            .into_iter()
            .map(|clause| clause.into())
            .collect::<Vec<_>>();
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::All(clauses)
        }
    }

    /// A `WHERE` clause which holds on any row where any of the sub-clauses hold.
    pub fn any<I>(clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<WhereClause>,
    {
        let mut clauses = clauses
            .into_iter()
            .map(|clause| clause.into())
            .collect::<Vec<_>>();
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::Any(clauses)
        }
    }

    /// A `WHERE` clause which holds on any row where `clause` does not.
    pub fn not(clause: impl Into<WhereClause>) -> Self {
        Self::Not(Box::new(clause.into()))
    }
}

/// The direction of an `ORDER BY` key.
///
/// Ascending keys sort `NULL` last and descending keys sort it first, as PostgreSQL does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub column: Column,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(column: impl Into<Column>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<Column>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}

/// An expression in the select list of a query.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Column(Column),
    /// A constant.
    Param(Value),
    /// `ROW_NUMBER() OVER (ORDER BY ...)`
    RowNumber(Vec<OrderBy>),
    /// `COUNT(*) OVER ()`: the number of rows in the result.
    CountOver,
}

impl From<Column> for Expr {
    fn from(column: Column) -> Self {
        Self::Column(column)
    }
}

/// An item in the select list of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectColumn {
    pub expr: Expr,
    pub alias: String,
}

/// A table or subquery which can be referenced in the `FROM` clause of a query.
#[derive(Clone, Debug, PartialEq)]
pub enum FromItem {
    /// A table, renamed for the purposes of this query.
    Table { name: String, alias: String },
    /// The results of another query, treated as a table.
    Subquery { select: Box<Select>, alias: String },
}

impl FromItem {
    pub fn table(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Table {
            name: name.into(),
            alias: alias.into(),
        }
    }

    pub fn subquery(select: Select, alias: impl Into<String>) -> Self {
        Self::Subquery {
            select: Box::new(select),
            alias: alias.into(),
        }
    }

    /// The name by which the rest of the query refers to this item.
    pub fn alias(&self) -> &str {
        match self {
            Self::Table { alias, .. } | Self::Subquery { alias, .. } => alias,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// A `JOIN` clause, joining on `lhs = rhs`.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub item: FromItem,
    pub lhs: Column,
    pub rhs: Column,
}

/// A `SELECT` query.
#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    pub columns: Vec<SelectColumn>,
    pub from: FromItem,
    pub joins: Vec<JoinClause>,
    pub filter: Option<WhereClause>,
    pub group_by: Vec<Column>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Select {
    /// A query selecting nothing (yet) from `from`.
    pub fn from(from: FromItem) -> Self {
        Self {
            columns: vec![],
            from,
            joins: vec![],
            filter: None,
            group_by: vec![],
            order_by: vec![],
            limit: None,
        }
    }

    /// Add an expression to the select list.
    pub fn column(mut self, expr: impl Into<Expr>, alias: impl Into<String>) -> Self {
        self.columns.push(SelectColumn {
            expr: expr.into(),
            alias: alias.into(),
        });
        self
    }

    /// Add a `JOIN` clause to the query.
    pub fn join(
        mut self,
        kind: JoinKind,
        item: FromItem,
        lhs: impl Into<Column>,
        rhs: impl Into<Column>,
    ) -> Self {
        self.joins.push(JoinClause {
            kind,
            item,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        self
    }

    /// Add a `WHERE` clause to the query. Multiple clauses must all hold.
    pub fn filter(mut self, clause: impl Into<WhereClause>) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(WhereClause::All(mut clauses)) => {
                clauses.push(clause.into());
                WhereClause::All(clauses)
            }
            Some(existing) => WhereClause::All(vec![existing, clause.into()]),
            None => clause.into(),
        });
        self
    }

    pub fn group_by(mut self, column: impl Into<Column>) -> Self {
        self.group_by.push(column.into());
        self
    }

    pub fn order_by(mut self, key: OrderBy) -> Self {
        self.order_by.push(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A constraint on a set of columns in a table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    /// A reference to the `_id` of `table`. When `cascade` is set, deleting the referenced row
    /// deletes the referencing row; otherwise such deletions fail.
    ForeignKey { table: String, cascade: bool },
}

/// A statement which can be executed against the database.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Select(Select),
    /// The concatenation (`UNION ALL`) of the results of several queries.
    Union(Vec<Select>),
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Update {
        table: String,
        set: Vec<(String, Value)>,
        filter: WhereClause,
    },
    Delete {
        table: String,
        filter: WhereClause,
    },
    /// `CREATE TABLE IF NOT EXISTS`.
    CreateTable {
        table: String,
        columns: Vec<SchemaColumn>,
        constraints: Vec<(ConstraintKind, Vec<String>)>,
    },
    /// Add a constraint to an existing table, unless it already has it.
    AddConstraint {
        table: String,
        kind: ConstraintKind,
        columns: Vec<String>,
    },
    /// `CREATE INDEX IF NOT EXISTS`.
    CreateIndex {
        table: String,
        column: String,
        unique: bool,
    },
}

impl From<Select> for Statement {
    fn from(select: Select) -> Self {
        Self::Select(select)
    }
}

/// A group of statements which succeed or fail together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    pub statements: Vec<Statement>,
    /// The index of a statement which must affect at least one row.
    ///
    /// If the guard statement affects no rows, the transaction is rolled back and reported as not
    /// applied.
    pub guard: Option<usize>,
}

impl Transaction {
    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    /// Add the guard statement.
    pub fn push_guard(&mut self, statement: Statement) {
        self.guard = Some(self.statements.len());
        self.statements.push(statement);
    }
}

/// A connection to the database.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Errors returned from queries.
    type Error: Error;
    /// Rows returned from queries.
    type Row: Row<Error = Self::Error>;

    /// Run a query and collect the results.
    async fn query(&self, statement: &Statement) -> Result<Vec<Self::Row>, Self::Error>;

    /// Run a statement, returning the number of rows it affected.
    async fn execute(&self, statement: &Statement) -> Result<u64, Self::Error>;

    /// Run a group of statements atomically.
    ///
    /// Returns `false`, having applied nothing, if the guard statement affected no rows.
    async fn transaction(&self, transaction: Transaction) -> Result<bool, Self::Error>;
}

/// An extension trait for [`Connection`] that provides some higher-level functions.
#[async_trait]
pub trait ConnectionExt: Connection {
    /// Run a query which is expected to return a single row.
    ///
    /// # Errors
    ///
    /// This method will fail if the query does not return exactly one row.
    async fn one(&self, statement: &Statement) -> Result<Self::Row, Self::Error>;

    /// Run a query which is expected to return either 0 or 1 rows.
    ///
    /// # Errors
    ///
    /// This method will fail if the query returns more than 1 row.
    async fn opt(&self, statement: &Statement) -> Result<Option<Self::Row>, Self::Error>;
}

#[async_trait]
impl<T: Connection> ConnectionExt for T {
    async fn opt(&self, statement: &Statement) -> Result<Option<Self::Row>, Self::Error> {
        let mut rows = self.query(statement).await?;
        if rows.len() > 1 {
            return Err(Self::Error::too_many_rows(1));
        }
        Ok(rows.pop())
    }

    async fn one(&self, statement: &Statement) -> Result<Self::Row, Self::Error> {
        self.opt(statement).await?.ok_or_else(Self::Error::empty_rows)
    }
}

/// A row in a query result.
pub trait Row: Sized + Send {
    /// Errors returned by row operations.
    type Error: Error;

    /// Get the value of the column selected under `alias` in this row.
    ///
    /// # Errors
    ///
    /// This method will fail if the specified column does not exist.
    fn column(&self, alias: &str) -> Result<Value, Self::Error>;
}

/// Escape an identifier (table name, column name, etc.) for inclusion in a SQL query.
pub fn escape_ident(s: impl AsRef<str>) -> String {
    format!("\"{}\"", s.as_ref().replace('"', "\"\""))
}
