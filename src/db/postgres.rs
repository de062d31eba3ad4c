//! PostgreSQL backend using sqlx

use super::{insert_statement, ColumnBinding, Database, Dialect, StatementKind};
use crate::error::{AgentError, Result};
use crate::schema::{Column, ForeignKey, Schema, Table};
use crate::value::{Row, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column as _, Postgres, Row as _, Transaction, TypeInfo};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Client-side margin on top of the server-side statement timeout.
const CLIENT_GRACE: Duration = Duration::from_millis(500);

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self, timeout: Duration) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(e, timeout))?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis().clamp(1, i32::MAX as u128)))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, timeout))?;
        Ok(tx)
    }

    async fn load_columns(&self) -> Result<Vec<PgRow>> {
        sqlx::query(
            r#"
            SELECT c.table_name::text AS table_name,
                   c.column_name::text AS column_name,
                   c.data_type::text AS data_type,
                   c.udt_name::text AS udt_name,
                   c.character_maximum_length::int4 AS char_length,
                   c.numeric_precision::int4 AS numeric_precision,
                   c.numeric_scale::int4 AS numeric_scale,
                   c.is_nullable::text AS is_nullable,
                   c.column_default::text AS column_default
            FROM information_schema.columns c
            JOIN information_schema.tables t
              ON t.table_schema = c.table_schema AND t.table_name = c.table_name
            WHERE c.table_schema = current_schema() AND t.table_type = 'BASE TABLE'
            ORDER BY c.table_name, c.ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AgentError::Connection(format!("Failed to load columns: {}", e)))
    }

    async fn load_primary_keys(&self) -> Result<HashSet<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = current_schema()
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AgentError::Connection(format!("Failed to load primary keys: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.try_get::<String, _>("table_name").unwrap_or_default(),
                    row.try_get::<String, _>("column_name").unwrap_or_default(),
                )
            })
            .collect())
    }

    async fn load_foreign_keys(&self) -> Result<HashMap<String, Vec<ForeignKey>>> {
        let rows = sqlx::query(
            r#"
            SELECT kcu.table_name::text AS table_name,
                   kcu.column_name::text AS column_name,
                   ccu.table_name::text AS referenced_table,
                   ccu.column_name::text AS referenced_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = current_schema()
            ORDER BY kcu.table_name, kcu.ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AgentError::Connection(format!("Failed to load foreign keys: {}", e)))?;

        let mut by_table: HashMap<String, Vec<ForeignKey>> = HashMap::new();
        for row in rows {
            let table: String = row.try_get("table_name").unwrap_or_default();
            by_table.entry(table).or_default().push(ForeignKey {
                column: row.try_get("column_name").unwrap_or_default(),
                referenced_table: row.try_get("referenced_table").unwrap_or_default(),
                referenced_column: row.try_get("referenced_column").unwrap_or_default(),
            });
        }
        Ok(by_table)
    }
}

#[async_trait]
impl Database for PgDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn fetch_schema(&self) -> Result<Schema> {
        let columns = self.load_columns().await?;
        let primary_keys = self.load_primary_keys().await?;
        let mut foreign_keys = self.load_foreign_keys().await?;

        let mut tables: Vec<Table> = Vec::new();
        for row in columns {
            let table_name: String = row.try_get("table_name").unwrap_or_default();
            let column_name: String = row.try_get("column_name").unwrap_or_default();
            let is_primary = primary_keys.contains(&(table_name.clone(), column_name.clone()));
            let nullable = row.try_get::<String, _>("is_nullable").map(|v| v == "YES").unwrap_or(true);

            let column = Column {
                data_type: render_type(&row),
                nullable: nullable && !is_primary,
                primary_key: is_primary,
                default: row.try_get::<Option<String>, _>("column_default").ok().flatten(),
                description: None,
                name: column_name,
            };

            match tables.last_mut() {
                Some(table) if table.name == table_name => table.columns.push(column),
                _ => tables.push(Table::new(table_name, vec![column])),
            }
        }

        for table in &mut tables {
            table.foreign_keys = foreign_keys.remove(&table.name).unwrap_or_default();
        }

        debug!("Fetched {} tables from PostgreSQL", tables.len());
        Ok(Schema::new(tables))
    }

    async fn run_statement(&self, sql: &str, kind: StatementKind, timeout: Duration) -> Result<Vec<Row>> {
        with_timeout(timeout, async {
            let mut tx = self.begin(timeout).await?;
            let fetched = sqlx::query(sql).fetch_all(&mut *tx).await;
            match fetched {
                Ok(rows) => {
                    let converted = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
                    match kind {
                        StatementKind::Read => tx.rollback().await,
                        StatementKind::Write => tx.commit().await,
                    }
                    .map_err(|e| map_sqlx_error(e, timeout))?;
                    Ok(converted)
                }
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!("Rollback after failed statement also failed: {}", rollback);
                    }
                    Err(map_sqlx_error(e, timeout))
                }
            }
        })
        .await
    }

    async fn apply_ddl(&self, statements: &[String], timeout: Duration) -> Result<()> {
        with_timeout(timeout, async {
            let mut tx = self.begin(timeout).await?;
            for statement in statements {
                debug!("DDL: {}", statement);
                // Dropping `tx` on the error path rolls the whole batch back.
                sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(statement))
                    .await
                    .map_err(|e| map_sqlx_error(e, timeout))?;
            }
            tx.commit().await.map_err(|e| map_sqlx_error(e, timeout))
        })
        .await
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[ColumnBinding],
        rows: &[Vec<Option<String>>],
        returning: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let sql = insert_statement(Dialect::Postgres, table, columns, returning);
        with_timeout(timeout, async {
            let mut tx = self.begin(timeout).await?;
            let mut generated = Vec::with_capacity(if returning.is_some() { rows.len() } else { 0 });
            for values in rows {
                let mut query = sqlx::query(&sql);
                for value in values {
                    query = query.bind(value.clone());
                }
                if returning.is_some() {
                    let row = query.fetch_one(&mut *tx).await.map_err(|e| map_sqlx_error(e, timeout))?;
                    generated.push(decode_value(&row, 0)?);
                } else {
                    query.execute(&mut *tx).await.map_err(|e| map_sqlx_error(e, timeout))?;
                }
            }
            tx.commit().await.map_err(|e| map_sqlx_error(e, timeout))?;
            Ok(generated)
        })
        .await
    }
}

/// Client-side bound; the server-side `statement_timeout` normally fires first.
async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout.saturating_add(CLIENT_GRACE), fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::ExecutionTimeout(timeout.as_secs_f64())),
    }
}

fn map_sqlx_error(err: sqlx::Error, timeout: Duration) -> AgentError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code == "57014" {
                AgentError::ExecutionTimeout(timeout.as_secs_f64())
            } else if code.starts_with("23") {
                AgentError::ConstraintViolation(db.message().to_string())
            } else if code.starts_with("08") {
                AgentError::Connection(db.message().to_string())
            } else {
                AgentError::Execution(format!("{} (SQLSTATE {})", db.message(), code))
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => AgentError::Connection(err.to_string()),
        _ => AgentError::Execution(err.to_string()),
    }
}

fn render_type(row: &PgRow) -> String {
    let data_type: String = row.try_get("data_type").unwrap_or_default();
    let udt_name: String = row.try_get("udt_name").unwrap_or_default();
    let char_length: Option<i32> = row.try_get("char_length").ok().flatten();
    let precision: Option<i32> = row.try_get("numeric_precision").ok().flatten();
    let scale: Option<i32> = row.try_get("numeric_scale").ok().flatten();

    match data_type.as_str() {
        "character varying" => match char_length {
            Some(n) => format!("VARCHAR({})", n),
            None => "VARCHAR".to_string(),
        },
        "character" => format!("CHAR({})", char_length.unwrap_or(1)),
        "numeric" => match (precision, scale) {
            (Some(p), Some(s)) => format!("NUMERIC({},{})", p, s),
            _ => "NUMERIC".to_string(),
        },
        "ARRAY" => format!("{}[]", udt_name.trim_start_matches('_').to_uppercase()),
        "USER-DEFINED" => udt_name.to_uppercase(),
        other => other.to_uppercase(),
    }
}

fn decode_row(row: &PgRow) -> Result<Row> {
    let mut out = Row::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_value(row, idx)?);
    }
    Ok(out)
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx)
        .map_err(|e| AgentError::Execution(format!("Failed to decode column {}: {}", idx, e)))
}

fn decode_value(row: &PgRow, idx: usize) -> Result<Value> {
    let type_name = row.columns()[idx].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => get::<bool>(row, idx)?.map(Value::Bool),
        "INT2" => get::<i16>(row, idx)?.map(|v| Value::Integer(v as i64)),
        "INT4" => get::<i32>(row, idx)?.map(|v| Value::Integer(v as i64)),
        "INT8" => get::<i64>(row, idx)?.map(Value::Integer),
        "FLOAT4" => get::<f32>(row, idx)?.map(|v| Value::Float(v as f64)),
        "FLOAT8" => get::<f64>(row, idx)?.map(Value::Float),
        "NUMERIC" => get::<Decimal>(row, idx)?.map(Value::Decimal),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" => get::<String>(row, idx)?.map(Value::Text),
        "DATE" => get::<NaiveDate>(row, idx)?.map(|d| Value::Text(d.to_string())),
        "TIME" => get::<NaiveTime>(row, idx)?.map(|t| Value::Text(t.to_string())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx)?.map(|t| Value::Text(t.to_string())),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx)?.map(|t| Value::Text(t.to_rfc3339())),
        "UUID" => get::<uuid::Uuid>(row, idx)?.map(|u| Value::Text(u.to_string())),
        "JSON" | "JSONB" => get::<serde_json::Value>(row, idx)?.map(Value::Json),
        other => {
            debug!("No decoder for PostgreSQL type {}", other);
            Some(Value::Text(format!("<{}>", other.to_lowercase())))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
