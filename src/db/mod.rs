//! Database boundary
//!
//! The core talks to the relational engine only through [`Database`]. Each call
//! runs in its own transaction; see the backend modules for how timeouts and
//! cancellation reach the engine.

pub mod connection;
pub mod postgres;
pub mod sqlite;

pub use connection::{connect, init_pool};
pub use postgres::PgDatabase;
pub use sqlite::SqliteDatabase;

use crate::error::Result;
use crate::schema::Schema;
use crate::value::{Row, Value};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "PostgreSQL",
            Dialect::Sqlite => "SQLite",
        }
    }

    /// Placeholder for the `n`th (1-based) bound parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
        }
    }
}

/// Whether a statement may leave changes behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Always rolled back.
    Read,
    /// Committed on success, rolled back on failure.
    Write,
}

/// Target column of an insert, with the declared type used to coerce
/// text-bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBinding {
    pub name: String,
    pub sql_type: String,
}

#[async_trait]
pub trait Database: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Read the live table structure.
    async fn fetch_schema(&self) -> Result<Schema>;

    /// Run one statement inside a transaction scoped to this call.
    async fn run_statement(&self, sql: &str, kind: StatementKind, timeout: Duration) -> Result<Vec<Row>>;

    /// Apply all statements in a single transaction; nothing is kept on failure.
    async fn apply_ddl(&self, statements: &[String], timeout: Duration) -> Result<()>;

    /// Insert all rows into one table in a single transaction. When
    /// `returning` names a column, its value for each inserted row is returned
    /// in input order.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[ColumnBinding],
        rows: &[Vec<Option<String>>],
        returning: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Value>>;
}

/// Build the INSERT statement shared by both backends.
pub(crate) fn insert_statement(
    dialect: Dialect,
    table: &str,
    columns: &[ColumnBinding],
    returning: Option<&str>,
) -> String {
    let mut sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table)
    } else {
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let values: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| match dialect {
                Dialect::Postgres => format!("CAST({} AS {})", dialect.placeholder(idx + 1), cast_type(&column.sql_type)),
                Dialect::Sqlite => dialect.placeholder(idx + 1),
            })
            .collect();
        format!("INSERT INTO {} ({}) VALUES ({})", table, names.join(", "), values.join(", "))
    };
    if let Some(column) = returning {
        sql.push_str(&format!(" RETURNING {}", column));
    }
    sql
}

/// Serial pseudo-types are not valid cast targets.
pub(crate) fn cast_type(sql_type: &str) -> String {
    match sql_type.trim().to_uppercase().as_str() {
        "SERIAL" | "SERIAL4" => "INTEGER".to_string(),
        "BIGSERIAL" | "SERIAL8" => "BIGINT".to_string(),
        "SMALLSERIAL" | "SERIAL2" => "SMALLINT".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Vec<ColumnBinding> {
        vec![
            ColumnBinding { name: "customer_id".into(), sql_type: "serial".into() },
            ColumnBinding { name: "total".into(), sql_type: "NUMERIC(10,2)".into() },
        ]
    }

    #[test]
    fn test_postgres_insert_casts_parameters() {
        let sql = insert_statement(Dialect::Postgres, "orders", &bindings(), Some("id"));
        assert_eq!(
            sql,
            "INSERT INTO orders (customer_id, total) VALUES (CAST($1 AS INTEGER), CAST($2 AS NUMERIC(10,2))) RETURNING id"
        );
    }

    #[test]
    fn test_sqlite_insert_uses_numbered_placeholders() {
        let sql = insert_statement(Dialect::Sqlite, "orders", &bindings(), None);
        assert_eq!(sql, "INSERT INTO orders (customer_id, total) VALUES (?1, ?2)");
        assert_eq!(
            insert_statement(Dialect::Sqlite, "tags", &[], Some("id")),
            "INSERT INTO tags DEFAULT VALUES RETURNING id"
        );
    }
}
