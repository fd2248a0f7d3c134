//! Mock instantiation of the abstract [`db`](super) interface.
//!
//! This instantiation is built on a simple in-memory database which interprets [statements]
//! directly. It follows PostgreSQL semantics where they matter to this crate: three-valued logic in
//! `WHERE` clauses, `NULL` ordering, window functions and primary key, unique and foreign key
//! constraints (including cascading deletes). It is useful for testing in isolation from an actual
//! database.
//!
//! [statements]: super::Statement
#![cfg(any(test, feature = "mocks"))]

use super::{
    render::render, Boolean, Column, ConstraintKind, Direction, Expr, FromItem, JoinClause,
    JoinKind, OrderBy, SchemaColumn, Select, SelectColumn, Statement, Transaction, Value,
    Violation, WhereClause,
};
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use itertools::Itertools;
use snafu::Snafu;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::iter;
use std::mem;

/// Errors returned by the in-memory database.
#[derive(Debug, Snafu)]
#[snafu(display("mock DB error: {message}"))]
pub struct Error {
    message: String,
    violation: Option<Violation>,
    connection: bool,
}

impl Error {
    pub(crate) fn violated(violation: Violation) -> Self {
        Self {
            message: format!("constraint violated: {violation:?}"),
            violation: Some(violation),
            connection: false,
        }
    }

    fn offline() -> Self {
        Self {
            message: "connection refused".into(),
            violation: None,
            connection: true,
        }
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self {
            message,
            violation: None,
            connection: false,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

impl super::Error for Error {
    fn custom(msg: impl Display) -> Self {
        msg.to_string().into()
    }

    fn violation(&self) -> Option<Violation> {
        self.violation.clone()
    }

    fn is_connection(&self) -> bool {
        self.connection
    }
}

/// The definition of an in-memory table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<SchemaColumn>,
    pub constraints: Vec<(ConstraintKind, Vec<String>)>,
    /// Indexes, as (column, unique).
    pub indexes: Vec<(String, bool)>,
}

impl TableSchema {
    fn position(&self, table: &str, column: &str) -> Result<usize, Error> {
        self.columns
            .iter()
            .position(|col| col.name() == column)
            .ok_or_else(|| Error::from(format!("table {table} has no column {column}")))
    }

    /// Sets of columns whose values must be unique among rows.
    fn unique_keys(&self) -> Vec<Vec<String>> {
        self.constraints
            .iter()
            .filter(|(kind, _)| matches!(kind, ConstraintKind::PrimaryKey | ConstraintKind::Unique))
            .map(|(_, cols)| cols.clone())
            .chain(
                self.indexes
                    .iter()
                    .filter(|(_, unique)| *unique)
                    .map(|(col, _)| vec![col.clone()]),
            )
            .collect()
    }

    /// Foreign keys, as (column, target table, cascade).
    fn foreign_keys(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.constraints.iter().filter_map(|(kind, cols)| match (kind, cols.as_slice()) {
            (ConstraintKind::ForeignKey { table, cascade }, [col]) => {
                Some((col.as_str(), table.as_str(), *cascade))
            }
            _ => None,
        })
    }
}

/// An in-memory table.
#[derive(Clone, Debug, Default)]
struct Table {
    schema: TableSchema,
    rows: Vec<Vec<Value>>,
}

/// Rows in flight during the evaluation of a query, with the qualified names of their columns.
struct Scope {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Scope {
    fn position(&self, column: &Column) -> Result<usize, Error> {
        position(&self.columns, column)
    }

    /// The indices of the rows of this scope, sorted by `keys`.
    fn sorted(&self, keys: &[OrderBy]) -> Result<Vec<usize>, Error> {
        let keys = keys
            .iter()
            .map(|key| Ok((self.position(&key.column)?, key.direction)))
            .collect::<Result<Vec<_>, Error>>()?;
        let mut order = (0..self.rows.len()).collect::<Vec<_>>();
        order.sort_by(|&l, &r| {
            keys.iter()
                .map(|&(i, direction)| sort_cmp(&self.rows[l][i], &self.rows[r][i], direction))
                .find(|ord| ord.is_ne())
                .unwrap_or(Ordering::Equal)
        });
        Ok(order)
    }
}

/// The in-memory database.
#[derive(Clone, Debug, Default)]
struct Db {
    tables: BTreeMap<String, Table>,
    offline: bool,
}

impl Db {
    fn table(&self, name: &str) -> Result<&Table, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::from(format!("no such table {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, Error> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::from(format!("no such table {name}")))
    }

    fn query(&self, statement: &Statement) -> Result<Vec<Row>, Error> {
        let selects = match statement {
            Statement::Select(select) => std::slice::from_ref(select),
            Statement::Union(selects) => selects.as_slice(),
            _ => return Err("statement does not return rows".into()),
        };
        let mut rows = vec![];
        for select in selects {
            let (columns, values) = self.select(select)?;
            let columns = Arc::new(columns);
            rows.extend(values.into_iter().map(|values| Row {
                columns: columns.clone(),
                values,
            }));
        }
        Ok(rows)
    }

    fn select(&self, select: &Select) -> Result<(Vec<String>, Vec<Vec<Value>>), Error> {
        let mut scope = self.scan(&select.from)?;

        for JoinClause {
            kind,
            item,
            lhs,
            rhs,
        } in &select.joins
        {
            let right = self.scan(item)?;
            let mut columns = scope.columns;
            columns.extend(right.columns.iter().cloned());
            let l = position(&columns, lhs)?;
            let r = position(&columns, rhs)?;
            let mut rows = vec![];
            for row in scope.rows {
                let mut matched = false;
                for other in &right.rows {
                    let joined = row.iter().chain(other).cloned().collect::<Vec<_>>();
                    if joined[l].compare(&joined[r]) == Some(Ordering::Equal) {
                        matched = true;
                        rows.push(joined);
                    }
                }
                if !matched && *kind == JoinKind::Left {
                    rows.push(
                        row.into_iter()
                            .chain(iter::repeat(Value::Null).take(right.columns.len()))
                            .collect(),
                    );
                }
            }
            scope = Scope { columns, rows };
        }

        if let Some(filter) = &select.filter {
            let mut rows = vec![];
            for row in mem::take(&mut scope.rows) {
                if eval(&scope.columns, &row, filter)? == Some(true) {
                    rows.push(row);
                }
            }
            scope.rows = rows;
        }

        if !select.group_by.is_empty() {
            let keys = select
                .group_by
                .iter()
                .map(|col| scope.position(col))
                .collect::<Result<Vec<_>, _>>()?;
            // Each group is represented by its first row. Like PostgreSQL, `NULL` keys group
            // together.
            let mut groups: Vec<(Vec<Value>, Vec<Value>)> = vec![];
            for row in mem::take(&mut scope.rows) {
                let key = keys.iter().map(|&i| row[i].clone()).collect::<Vec<_>>();
                if !groups.iter().any(|(k, _)| *k == key) {
                    groups.push((key, row));
                }
            }
            scope.rows = groups.into_iter().map(|(_, row)| row).collect();
        }

        let n = scope.rows.len();
        let mut output = vec![Vec::with_capacity(select.columns.len()); n];
        for SelectColumn { expr, .. } in &select.columns {
            match expr {
                Expr::Column(col) => {
                    let i = scope.position(col)?;
                    for (out, row) in output.iter_mut().zip(&scope.rows) {
                        out.push(row[i].clone());
                    }
                }
                Expr::Param(value) => {
                    for out in &mut output {
                        out.push(value.clone());
                    }
                }
                Expr::CountOver => {
                    for out in &mut output {
                        out.push(Value::Int8(n as i64));
                    }
                }
                Expr::RowNumber(keys) => {
                    let mut numbers = vec![0; n];
                    for (rank, i) in scope.sorted(keys)?.into_iter().enumerate() {
                        numbers[i] = rank as i64 + 1;
                    }
                    for (out, number) in output.iter_mut().zip(numbers) {
                        out.push(Value::Int8(number));
                    }
                }
            }
        }

        // `ORDER BY` is evaluated against the input columns, not the selected aliases.
        let order = if select.order_by.is_empty() {
            (0..n).collect()
        } else {
            scope.sorted(&select.order_by)?
        };
        let mut rows = order
            .into_iter()
            .map(|i| mem::take(&mut output[i]))
            .collect::<Vec<_>>();
        if let Some(limit) = select.limit {
            rows.truncate(limit);
        }

        let aliases = select.columns.iter().map(|col| col.alias.clone()).collect();
        Ok((aliases, rows))
    }

    fn scan(&self, item: &FromItem) -> Result<Scope, Error> {
        match item {
            FromItem::Table { name, alias } => {
                let table = self.table(name)?;
                Ok(Scope {
                    columns: table
                        .schema
                        .columns
                        .iter()
                        .map(|col| Column::qualified(alias.clone(), col.name()))
                        .collect(),
                    rows: table.rows.clone(),
                })
            }
            FromItem::Subquery { select, alias } => {
                let (names, rows) = self.select(select)?;
                Ok(Scope {
                    columns: names
                        .into_iter()
                        .map(|name| Column::qualified(alias.clone(), name))
                        .collect(),
                    rows,
                })
            }
        }
    }

    fn execute(&mut self, statement: &Statement) -> Result<u64, Error> {
        match statement {
            Statement::Select(_) | Statement::Union(_) => Ok(self.query(statement)?.len() as u64),
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                let schema = &self.table(table)?.schema;
                let width = schema.columns.len();
                let positions = columns
                    .iter()
                    .map(|col| schema.position(table, col))
                    .collect::<Result<Vec<_>, _>>()?;
                for values in rows {
                    if values.len() != positions.len() {
                        return Err(format!(
                            "incorrect width for table {table} (found {}, expected {})",
                            values.len(),
                            positions.len()
                        )
                        .into());
                    }
                    let mut row = vec![Value::Null; width];
                    for (&i, value) in positions.iter().zip(values) {
                        row[i] = value.clone();
                    }
                    self.check_row(table, &row, None)?;
                    self.table_mut(table)?.rows.push(row);
                }
                Ok(rows.len() as u64)
            }
            Statement::Update { table, set, filter } => {
                let matching = self.matching(table, filter)?;
                let schema = &self.table(table)?.schema;
                let set = set
                    .iter()
                    .map(|(col, value)| Ok((schema.position(table, col)?, value.clone())))
                    .collect::<Result<Vec<_>, Error>>()?;
                for &i in &matching {
                    let mut row = self.table(table)?.rows[i].clone();
                    for (j, value) in &set {
                        row[*j] = value.clone();
                    }
                    self.check_row(table, &row, Some(i))?;
                    self.table_mut(table)?.rows[i] = row;
                }
                Ok(matching.len() as u64)
            }
            Statement::Delete { table, filter } => {
                let matching = self.matching(table, filter)?;
                self.delete_rows(table, matching)
            }
            Statement::CreateTable {
                table,
                columns,
                constraints,
            } => {
                self.tables.entry(table.clone()).or_insert_with(|| Table {
                    schema: TableSchema {
                        columns: columns.clone(),
                        constraints: constraints.clone(),
                        indexes: vec![],
                    },
                    rows: vec![],
                });
                Ok(0)
            }
            Statement::AddConstraint {
                table,
                kind,
                columns,
            } => {
                let schema = &mut self.table_mut(table)?.schema;
                let constraint = (kind.clone(), columns.clone());
                if !schema.constraints.contains(&constraint) {
                    schema.constraints.push(constraint);
                }
                Ok(0)
            }
            Statement::CreateIndex {
                table,
                column,
                unique,
            } => {
                let schema = &mut self.table_mut(table)?.schema;
                schema.position(table, column)?;
                let index = (column.clone(), *unique);
                if !schema.indexes.contains(&index) {
                    schema.indexes.push(index);
                }
                Ok(0)
            }
        }
    }

    /// The indices of the rows of `table` which satisfy `filter`.
    fn matching(&self, table: &str, filter: &WhereClause) -> Result<Vec<usize>, Error> {
        let t = self.table(table)?;
        let columns = t
            .schema
            .columns
            .iter()
            .map(|col| Column::qualified(table, col.name()))
            .collect::<Vec<_>>();
        let mut matching = vec![];
        for (i, row) in t.rows.iter().enumerate() {
            if eval(&columns, row, filter)? == Some(true) {
                matching.push(i);
            }
        }
        Ok(matching)
    }

    /// Check that `row` may be stored in `table`, replacing the row at index `replacing`.
    fn check_row(&self, table: &str, row: &[Value], replacing: Option<usize>) -> Result<(), Error> {
        let t = self.table(table)?;
        for (col, value) in t.schema.columns.iter().zip(row) {
            if let Some(ty) = value.ty() {
                if ty != col.ty() {
                    return Err(format!(
                        "column {table}.{} of type {} cannot hold {ty} value {value}",
                        col.name(),
                        col.ty()
                    )
                    .into());
                }
            }
        }

        for key in t.schema.unique_keys() {
            let positions = key
                .iter()
                .map(|col| t.schema.position(table, col))
                .collect::<Result<Vec<_>, _>>()?;
            let values = positions.iter().map(|&i| &row[i]).collect::<Vec<_>>();
            if values.iter().any(|value| value.is_null()) {
                continue;
            }
            let duplicate = t.rows.iter().enumerate().any(|(i, other)| {
                Some(i) != replacing
                    && positions
                        .iter()
                        .zip(&values)
                        .all(|(&j, value)| other[j].compare(value) == Some(Ordering::Equal))
            });
            if duplicate {
                return Err(Error::violated(Violation::Unique {
                    table: table.to_string(),
                    column: key.join(", "),
                    value: values.iter().join(", "),
                }));
            }
        }

        for (column, target, _) in t.schema.foreign_keys() {
            let value = &row[t.schema.position(table, column)?];
            if value.is_null() {
                continue;
            }
            let target_table = self.table(target)?;
            let id = target_table.schema.position(target, "_id")?;
            if !target_table
                .rows
                .iter()
                .any(|other| other[id].compare(value) == Some(Ordering::Equal))
            {
                return Err(Error::violated(Violation::ForeignKey {
                    table: table.to_string(),
                    column: column.to_string(),
                }));
            }
        }
        Ok(())
    }

    /// Delete rows from `table`, cascading to (or being restricted by) rows which reference them.
    fn delete_rows(&mut self, table: &str, mut indices: Vec<usize>) -> Result<u64, Error> {
        let t = self.table(table)?;
        let ids: Vec<Value> = match t.schema.columns.iter().position(|col| col.name() == "_id") {
            Some(id) => indices.iter().map(|&i| t.rows[i][id].clone()).collect(),
            None => vec![],
        };
        indices.sort_unstable();
        let t = self.table_mut(table)?;
        for &i in indices.iter().rev() {
            t.rows.remove(i);
        }

        let referencing = self
            .tables
            .iter()
            .flat_map(|(name, t)| {
                t.schema
                    .foreign_keys()
                    .filter(|(_, target, _)| *target == table)
                    .map(|(column, _, cascade)| (name.clone(), column.to_string(), cascade))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        for id in ids {
            for (other, column, cascade) in &referencing {
                let t = self.table(other)?;
                let pos = t.schema.position(other, column)?;
                let hits = t
                    .rows
                    .iter()
                    .enumerate()
                    .filter(|(_, row)| row[pos].compare(&id) == Some(Ordering::Equal))
                    .map(|(i, _)| i)
                    .collect::<Vec<_>>();
                if hits.is_empty() {
                    continue;
                }
                if *cascade {
                    self.delete_rows(other, hits)?;
                } else {
                    return Err(Error::violated(Violation::ForeignKey {
                        table: other.clone(),
                        column: column.clone(),
                    }));
                }
            }
        }
        Ok(indices.len() as u64)
    }
}

/// A connection to the in-memory database.
#[derive(Clone, Debug)]
pub struct Connection(Arc<RwLock<Db>>);

impl Connection {
    /// Create a new database and connect to it.
    ///
    /// This will create a connection to a fresh, empty database. It will not be connected or
    /// related to any previous connection or database. Once the database is created, this
    /// connection can be [cloned](Clone) in order to create multiple simultaneous connections to
    /// the same database.
    pub fn create() -> Self {
        Self(Default::default())
    }

    /// The schema of this database, by table name.
    pub async fn schema(&self) -> BTreeMap<String, TableSchema> {
        self.0
            .read()
            .await
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.schema.clone()))
            .collect()
    }

    /// The rows of `table`, as maps from column names to values.
    pub async fn dump(&self, table: &str) -> Option<Vec<BTreeMap<String, Value>>> {
        let db = self.0.read().await;
        let table = db.tables.get(table)?;
        Some(
            table
                .rows
                .iter()
                .map(|row| {
                    table
                        .schema
                        .columns
                        .iter()
                        .map(|col| col.name().to_string())
                        .zip(row.iter().cloned())
                        .collect()
                })
                .collect(),
        )
    }

    /// Simulate losing (or regaining) the connection to the database.
    pub async fn set_offline(&self, offline: bool) {
        self.0.write().await.offline = offline;
    }
}

#[async_trait]
impl super::Connection for Connection {
    type Error = Error;
    type Row = Row;

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, Error> {
        let db = self.0.read().await;
        if db.offline {
            return Err(Error::offline());
        }
        tracing::info!("{}", render(statement).sql);
        db.query(statement)
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, Error> {
        let mut db = self.0.write().await;
        if db.offline {
            return Err(Error::offline());
        }
        tracing::info!("{}", render(statement).sql);
        // Work on a copy so that a failed statement leaves no trace.
        let mut next = db.clone();
        let affected = next.execute(statement)?;
        *db = next;
        Ok(affected)
    }

    async fn transaction(&self, transaction: Transaction) -> Result<bool, Error> {
        let mut db = self.0.write().await;
        if db.offline {
            return Err(Error::offline());
        }
        let mut next = db.clone();
        for (i, statement) in transaction.statements.iter().enumerate() {
            tracing::info!("{}", render(statement).sql);
            let affected = next.execute(statement)?;
            if transaction.guard == Some(i) && affected == 0 {
                tracing::info!("guard statement affected no rows, rolling back");
                return Ok(false);
            }
        }
        *db = next;
        Ok(true)
    }
}

/// A row in a query result.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl super::Row for Row {
    type Error = Error;

    fn column(&self, alias: &str) -> Result<Value, Self::Error> {
        self.columns
            .iter()
            .position(|col| col == alias)
            .map(|i| self.values[i].clone())
            .ok_or_else(|| format!("no such column {alias}").into())
    }
}

/// Find `column` among `columns`.
///
/// Every column of a scope is qualified, so a qualified column must match exactly. An unqualified
/// column matches the first column with the same name.
fn position(columns: &[Column], column: &Column) -> Result<usize, Error> {
    columns
        .iter()
        .position(|col| match &column.table {
            Some(_) => col == column,
            None => col.name == column.name,
        })
        .ok_or_else(|| Error::from(format!("no such column {column}")))
}

/// Order values as PostgreSQL does: ascending puts `NULL` last, descending puts it first.
fn sort_cmp(l: &Value, r: &Value, direction: Direction) -> Ordering {
    let ord = match (l.is_null(), r.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => l.compare(r).unwrap_or(Ordering::Equal),
    };
    match direction {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
    }
}

/// Evaluate a `WHERE` clause on a row, with `None` standing for SQL's unknown truth value.
fn eval(columns: &[Column], row: &[Value], clause: &WhereClause) -> Result<Option<bool>, Error> {
    Ok(match clause {
        WhereClause::All(clauses) => {
            let mut result = Some(true);
            for clause in clauses {
                match eval(columns, row, clause)? {
                    Some(false) => return Ok(Some(false)),
                    None => result = None,
                    Some(true) => {}
                }
            }
            result
        }
        WhereClause::Any(clauses) => {
            let mut result = Some(false);
            for clause in clauses {
                match eval(columns, row, clause)? {
                    Some(true) => return Ok(Some(true)),
                    None => result = None,
                    Some(false) => {}
                }
            }
            result
        }
        WhereClause::Not(clause) => eval(columns, row, clause)?.map(|b| !b),
        WhereClause::Predicate(predicate) => test(columns, row, predicate)?,
    })
}

fn test(columns: &[Column], row: &[Value], predicate: &Boolean) -> Result<Option<bool>, Error> {
    Ok(match predicate {
        Boolean::Cmp { column, op, param } => {
            let value = &row[position(columns, column)?];
            value.compare(param).map(|ord| op.holds(ord))
        }
        Boolean::OneOf { column, params } => {
            let value = &row[position(columns, column)?];
            if value.is_null() {
                None
            } else if params
                .iter()
                .any(|param| value.compare(param) == Some(Ordering::Equal))
            {
                Some(true)
            } else {
                Some(false)
            }
        }
        Boolean::IsNull(column) => Some(row[position(columns, column)?].is_null()),
        Boolean::Matches { column, pattern } => match &row[position(columns, column)?] {
            Value::Null => None,
            Value::Text(text) => Some(pattern.is_match(text)),
            value => Some(pattern.is_match(&value.to_string())),
        },
    })
}
