//! Rendering of [statements](super::Statement) into PostgreSQL text.
//!
//! Rendering is a single pass over the statement tree. Every constant becomes a numbered
//! parameter (`$1`, `$2`, ...) in the order it is encountered, so values never end up interpolated
//! into the query text.

use super::{
    escape_ident, Boolean, Column, ConstraintKind, Direction, Expr, FromItem, JoinClause, JoinKind,
    OrderBy, Select, SelectColumn, Statement, Value, WhereClause,
};
use itertools::Itertools;

/// A statement rendered to text, with the values of its parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Render `statement` to PostgreSQL text.
pub fn render(statement: &Statement) -> Rendered {
    let mut renderer = Renderer::default();
    let sql = renderer.statement(statement);
    Rendered {
        sql,
        params: renderer.params,
    }
}

#[derive(Default)]
struct Renderer {
    params: Vec<Value>,
}

impl Renderer {
    fn param(&mut self, value: &Value) -> String {
        self.params.push(value.clone());
        format!("${}", self.params.len())
    }

    fn statement(&mut self, statement: &Statement) -> String {
        match statement {
            Statement::Select(select) => self.select(select),
            Statement::Union(selects) => selects
                .iter()
                .map(|select| format!("({})", self.select(select)))
                .join(" UNION ALL "),
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                let columns = columns.iter().map(escape_ident).join(",");
                let rows = rows
                    .iter()
                    .map(|row| format!("({})", row.iter().map(|v| self.param(v)).join(",")))
                    .join(",");
                format!(
                    "INSERT INTO {} ({columns}) VALUES {rows}",
                    escape_ident(table)
                )
            }
            Statement::Update { table, set, filter } => {
                let set = set
                    .iter()
                    .map(|(column, value)| format!("{} = {}", escape_ident(column), self.param(value)))
                    .join(", ");
                let filter = self.clause(filter);
                format!("UPDATE {} SET {set} WHERE {filter}", escape_ident(table))
            }
            Statement::Delete { table, filter } => {
                let filter = self.clause(filter);
                format!("DELETE FROM {} WHERE {filter}", escape_ident(table))
            }
            Statement::CreateTable {
                table,
                columns,
                constraints,
            } => {
                let columns = columns
                    .iter()
                    .map(|col| format!("{} {}", escape_ident(col.name()), col.ty()));
                let constraints = constraints
                    .iter()
                    .map(|(kind, cols)| format_constraint(table, kind, cols));
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    escape_ident(table),
                    columns.chain(constraints).join(",")
                )
            }
            Statement::AddConstraint {
                table,
                kind,
                columns,
            } => {
                // `ADD CONSTRAINT` has no `IF NOT EXISTS` form, so swallow the error raised when
                // the constraint is already there.
                format!(
                    "DO $ddl$ BEGIN ALTER TABLE {} ADD {}; \
                     EXCEPTION WHEN duplicate_object THEN NULL; END $ddl$",
                    escape_ident(table),
                    format_constraint(table, kind, columns)
                )
            }
            Statement::CreateIndex {
                table,
                column,
                unique,
            } => format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if *unique { "UNIQUE " } else { "" },
                escape_ident(index_name(table, column, *unique)),
                escape_ident(table),
                escape_ident(column)
            ),
        }
    }

    fn select(&mut self, select: &Select) -> String {
        let columns = select
            .columns
            .iter()
            .map(|SelectColumn { expr, alias }| {
                format!("{} AS {}", self.expr(expr), escape_ident(alias))
            })
            .join(", ");
        let mut sql = format!("SELECT {columns} FROM {}", self.from_item(&select.from));
        for JoinClause {
            kind,
            item,
            lhs,
            rhs,
        } in &select.joins
        {
            let kind = match kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let item = self.from_item(item);
            sql += &format!(" {kind} {item} ON {} = {}", lhs.escape(), rhs.escape());
        }
        if let Some(filter) = &select.filter {
            sql += &format!(" WHERE {}", self.clause(filter));
        }
        if !select.group_by.is_empty() {
            sql += &format!(
                " GROUP BY {}",
                select.group_by.iter().map(Column::escape).join(", ")
            );
        }
        if !select.order_by.is_empty() {
            sql += &format!(" ORDER BY {}", order_by(&select.order_by));
        }
        if let Some(limit) = select.limit {
            sql += &format!(" LIMIT {limit}");
        }
        sql
    }

    fn from_item(&mut self, item: &FromItem) -> String {
        match item {
            FromItem::Table { name, alias } => {
                format!("{} AS {}", escape_ident(name), escape_ident(alias))
            }
            FromItem::Subquery { select, alias } => {
                format!("({}) AS {}", self.select(select), escape_ident(alias))
            }
        }
    }

    fn expr(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Column(column) => column.escape(),
            // A parameter in the select list has no context from which PostgreSQL could infer its
            // type, so it needs an explicit cast.
            Expr::Param(value) => match value.ty() {
                Some(ty) => format!("CAST({} AS {ty})", self.param(value)),
                None => "NULL".to_string(),
            },
            Expr::RowNumber(keys) => format!("ROW_NUMBER() OVER (ORDER BY {})", order_by(keys)),
            Expr::CountOver => "COUNT(*) OVER ()".to_string(),
        }
    }

    fn clause(&mut self, clause: &WhereClause) -> String {
        match clause {
            WhereClause::All(clauses) if clauses.is_empty() => "TRUE".to_string(),
            WhereClause::Any(clauses) if clauses.is_empty() => "FALSE".to_string(),
            WhereClause::All(clauses) => format!(
                "({})",
                clauses.iter().map(|c| self.clause(c)).join(" AND ")
            ),
            WhereClause::Any(clauses) => format!(
                "({})",
                clauses.iter().map(|c| self.clause(c)).join(" OR ")
            ),
            WhereClause::Not(clause) => format!("NOT ({})", self.clause(clause)),
            WhereClause::Predicate(predicate) => self.predicate(predicate),
        }
    }

    fn predicate(&mut self, predicate: &Boolean) -> String {
        match predicate {
            Boolean::Cmp { column, op, param } => {
                format!("{} {op} {}", column.escape(), self.param(param))
            }
            Boolean::OneOf { params, .. } if params.is_empty() => "FALSE".to_string(),
            Boolean::OneOf { column, params } => format!(
                "{} IN ({})",
                column.escape(),
                params.iter().map(|p| self.param(p)).join(", ")
            ),
            Boolean::IsNull(column) => format!("{} IS NULL", column.escape()),
            Boolean::Matches { column, pattern } => format!(
                "CAST({} AS text) ~* {}",
                column.escape(),
                self.param(&Value::Text(pattern.to_regex()))
            ),
        }
    }
}

fn order_by(keys: &[OrderBy]) -> String {
    keys.iter()
        .map(|OrderBy { column, direction }| match direction {
            Direction::Asc => format!("{} ASC NULLS LAST", column.escape()),
            Direction::Desc => format!("{} DESC NULLS FIRST", column.escape()),
        })
        .join(", ")
}

/// The name of the index on `column` of `table`.
pub fn index_name(table: &str, column: &str, unique: bool) -> String {
    format!("{table}-{}-{column}", if unique { "uq" } else { "ix" })
}

/// The name of a constraint on `columns` of `table`.
pub fn constraint_name(table: &str, kind: &ConstraintKind, columns: &[String]) -> String {
    let kind = match kind {
        ConstraintKind::PrimaryKey => "pk",
        ConstraintKind::Unique => "uq",
        ConstraintKind::ForeignKey { .. } => "fk",
    };
    format!("{table}-{kind}-{}", columns.join("-"))
}

fn format_constraint(table: &str, kind: &ConstraintKind, cols: &[String]) -> String {
    let name = escape_ident(constraint_name(table, kind, cols));
    let cols = cols.iter().map(escape_ident).join(",");
    match kind {
        ConstraintKind::PrimaryKey => format!("CONSTRAINT {name} PRIMARY KEY ({cols})"),
        ConstraintKind::Unique => format!("CONSTRAINT {name} UNIQUE ({cols})"),
        ConstraintKind::ForeignKey { table, cascade } => format!(
            "CONSTRAINT {name} FOREIGN KEY ({cols}) REFERENCES {} (\"_id\") ON DELETE {}",
            escape_ident(table),
            if *cascade { "CASCADE" } else { "RESTRICT" }
        ),
    }
}
