//! Schema applier
//!
//! Renders a [`Schema`] as DDL in foreign-key dependency order and applies it
//! in one transaction. Tables that already exist with the same signature are
//! left alone; tables that exist with a different one abort the whole apply
//! before any DDL runs.

use crate::db::{Database, Dialect};
use crate::error::{AgentError, Result};
use crate::schema::{Schema, Table};
use itertools::Itertools;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    /// Tables created by this call, in creation order.
    pub created: Vec<String>,
    /// Tables that already existed with a matching signature.
    pub unchanged: Vec<String>,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
    }
}

pub struct SchemaApplier {
    db: Arc<dyn Database>,
    timeout: Duration,
}

impl SchemaApplier {
    pub fn new(db: Arc<dyn Database>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    pub async fn apply(&self, schema: &Schema) -> Result<ApplyReport> {
        schema.validate()?;
        let order = schema.dependency_order()?;
        let live = self.db.fetch_schema().await?;
        let dialect = self.db.dialect();

        let mut report = ApplyReport::default();
        let mut statements = Vec::new();
        for table in order {
            match live.table(&table.name) {
                Some(existing) if existing.signature() == table.signature() => {
                    debug!("Table {} already exists with the same columns", table.name);
                    report.unchanged.push(table.name.clone());
                }
                Some(existing) => {
                    return Err(AgentError::SchemaConflict(describe_conflict(existing, table)));
                }
                None => {
                    statements.extend(render_ddl(table, dialect));
                    report.created.push(table.name.clone());
                }
            }
        }

        if statements.is_empty() {
            info!("Schema already applied; nothing to do");
            return Ok(report);
        }

        self.db.apply_ddl(&statements, self.timeout).await?;
        info!("Created tables: {}", report.created.join(", "));
        Ok(report)
    }
}

fn describe_conflict(existing: &Table, wanted: &Table) -> String {
    let have = existing.signature();
    let want = wanted.signature();
    let missing = want.keys().filter(|c| !have.contains_key(*c)).join(", ");
    let extra = have.keys().filter(|c| !want.contains_key(*c)).join(", ");
    let retyped = want
        .iter()
        .filter(|(c, family)| have.get(*c).is_some_and(|h| h != *family))
        .map(|(c, _)| c.as_str())
        .join(", ");

    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing columns [{}]", missing));
    }
    if !extra.is_empty() {
        parts.push(format!("unexpected columns [{}]", extra));
    }
    if !retyped.is_empty() {
        parts.push(format!("different types for [{}]", retyped));
    }
    format!("table '{}' exists with a different structure: {}", existing.name, parts.join("; "))
}

fn column_type(data_type: &str, dialect: Dialect) -> String {
    let trimmed = data_type.trim();
    match dialect {
        Dialect::Postgres => trimmed.to_string(),
        Dialect::Sqlite => match trimmed.to_uppercase().as_str() {
            "SERIAL" | "SERIAL4" | "SMALLSERIAL" | "SERIAL2" | "BIGSERIAL" | "SERIAL8" => "INTEGER".to_string(),
            _ => trimmed.to_string(),
        },
    }
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// CREATE TABLE (plus PostgreSQL comments) for one table.
pub fn render_ddl(table: &Table, dialect: Dialect) -> Vec<String> {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut line = format!("{} {}", column.name, column_type(&column.data_type, dialect));
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            if let Some(default) = &column.default {
                let sequence = default.trim().to_lowercase().starts_with("nextval(");
                if dialect == Dialect::Postgres || !sequence {
                    line.push_str(&format!(" DEFAULT {}", default.trim()));
                }
            }
            line
        })
        .collect();

    let keys: Vec<&str> = table.columns.iter().filter(|c| c.primary_key).map(|c| c.name.as_str()).collect();
    if !keys.is_empty() {
        lines.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }
    for fk in &table.foreign_keys {
        lines.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            fk.column, fk.referenced_table, fk.referenced_column
        ));
    }

    let mut statements = vec![format!(
        "CREATE TABLE {} (\n    {}\n)",
        table.name,
        lines.join(",\n    ")
    )];

    if dialect == Dialect::Postgres {
        if let Some(description) = &table.description {
            statements.push(format!("COMMENT ON TABLE {} IS {}", table.name, quote_literal(description)));
        }
        for column in &table.columns {
            if let Some(description) = &column.description {
                statements.push(format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    table.name,
                    column.name,
                    quote_literal(description)
                ));
            }
        }
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use crate::schema::Column;

    fn shop() -> Schema {
        Schema::new(vec![
            Table::new(
                "orders",
                vec![
                    Column::new("id", "SERIAL").primary(),
                    Column::new("customer_id", "INTEGER").not_null(),
                    Column::new("total", "NUMERIC(10,2)"),
                ],
            )
            .with_foreign_key("customer_id", "customers", "id"),
            Table::new(
                "customers",
                vec![Column::new("id", "SERIAL").primary(), Column::new("name", "VARCHAR(100)")],
            )
            .with_description("Who's buying"),
        ])
    }

    #[test]
    fn test_render_postgres_ddl() {
        let schema = shop();
        let statements = render_ddl(schema.table("customers").unwrap(), Dialect::Postgres);
        assert_eq!(
            statements[0],
            "CREATE TABLE customers (\n    id SERIAL NOT NULL,\n    name VARCHAR(100),\n    PRIMARY KEY (id)\n)"
        );
        assert_eq!(statements[1], "COMMENT ON TABLE customers IS 'Who''s buying'");
    }

    #[test]
    fn test_render_sqlite_ddl() {
        let schema = shop();
        let statements = render_ddl(schema.table("orders").unwrap(), Dialect::Sqlite);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("id INTEGER NOT NULL"));
        assert!(statements[0].contains("FOREIGN KEY (customer_id) REFERENCES customers (id)"));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let applier = SchemaApplier::new(db.clone(), Duration::from_secs(5));

        let first = applier.apply(&shop()).await.unwrap();
        assert_eq!(first.created, vec!["customers".to_string(), "orders".to_string()]);

        let fetched = db.fetch_schema().await.unwrap();
        let second = applier.apply(&fetched).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged.len(), 2);
        assert_eq!(db.fetch_schema().await.unwrap(), fetched);
    }

    #[tokio::test]
    async fn test_conflicting_table_is_rejected() {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let applier = SchemaApplier::new(db.clone(), Duration::from_secs(5));
        applier.apply(&shop()).await.unwrap();

        let changed = Schema::new(vec![Table::new(
            "customers",
            vec![Column::new("id", "SERIAL").primary(), Column::new("email", "TEXT")],
        )]);
        let err = applier.apply(&changed).await.unwrap_err();
        assert!(matches!(err, AgentError::SchemaConflict(_)));
    }

    #[tokio::test]
    async fn test_failed_table_rolls_back_everything() {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        db.apply_ddl(&["CREATE TABLE zz_blocker (id INTEGER)".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        let err = db
            .apply_ddl(
                &[
                    "CREATE TABLE fresh (id INTEGER)".to_string(),
                    "CREATE TABLE zz_blocker (id INTEGER)".to_string(),
                ],
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Execution(_)));
        assert!(!db.fetch_schema().await.unwrap().has_table("fresh"));
    }
}
