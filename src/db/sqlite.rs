//! SQLite backend
//!
//! rusqlite is synchronous, so every call runs on the blocking pool behind a
//! `Mutex<Connection>`. Timeouts and dropped futures interrupt the running
//! statement through the connection's interrupt handle; an interrupted
//! transaction is rolled back when it goes out of scope.
//!
//! SQLite stores NUMERIC values as integers or doubles. Columns declared
//! NUMERIC/DECIMAL, and aggregates over them, are decoded back into exact
//! decimals at the declared scale.

use super::{insert_statement, ColumnBinding, Database, Dialect, StatementKind};
use crate::error::{AgentError, Result};
use crate::schema::{Column, ForeignKey, Schema, Table, TypeFamily};
use crate::value::{Row, Value};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ErrorCode, InterruptHandle};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlparser::ast::{Expr, FunctionArg, FunctionArgExpr, SelectItem, SetExpr, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| AgentError::Connection(format!("Failed to open SQLite database: {}", e)))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AgentError::Connection(format!("Failed to open in-memory SQLite database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| AgentError::Connection(format!("Failed to enable foreign keys: {}", e)))?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    /// Run `work` on the blocking pool, bounded by `timeout`.
    async fn blocking<T, F>(&self, timeout: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let guard = InterruptGuard::new(Arc::clone(&self.interrupt));
        let state = Arc::clone(&guard.state);

        let handle = tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| AgentError::Connection("SQLite connection lock poisoned".to_string()))?;
            {
                let mut state = state
                    .lock()
                    .map_err(|_| AgentError::Connection("SQLite run state lock poisoned".to_string()))?;
                if state.cancelled {
                    return Err(AgentError::ExecutionTimeout(timeout.as_secs_f64()));
                }
                state.running = true;
            }
            let result = work(&mut conn);
            if let Ok(mut state) = state.lock() {
                state.running = false;
            }
            result
        });

        let outcome = tokio::time::timeout(timeout, handle).await;
        guard.disarm();
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(AgentError::Execution(format!("SQLite worker failed: {}", join))),
            Err(_) => {
                guard.fire();
                Err(AgentError::ExecutionTimeout(timeout.as_secs_f64()))
            }
        }
    }
}

/// Whether the worker for one call has started, shared with its guard.
#[derive(Debug, Default)]
struct RunState {
    cancelled: bool,
    running: bool,
}

/// Interrupts the statement owned by a future that is dropped before it
/// finishes.
struct InterruptGuard {
    interrupt: Arc<InterruptHandle>,
    state: Arc<Mutex<RunState>>,
    armed: AtomicBool,
}

impl InterruptGuard {
    fn new(interrupt: Arc<InterruptHandle>) -> Self {
        Self {
            interrupt,
            state: Arc::new(Mutex::new(RunState::default())),
            armed: AtomicBool::new(true),
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// The worker cannot clear `running` while the state lock is held, so the
    /// interrupt never lands on a later caller's statement.
    fn fire(&self) {
        let Ok(mut state) = self.state.lock() else { return };
        state.cancelled = true;
        if state.running {
            debug!("Interrupting SQLite statement");
            self.interrupt.interrupt();
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) {
            self.fire();
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn fetch_schema(&self) -> Result<Schema> {
        self.blocking(Duration::from_secs(30), |conn| read_schema(conn)).await
    }

    async fn run_statement(&self, sql: &str, kind: StatementKind, timeout: Duration) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        self.blocking(timeout, move |conn| {
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let rows = query_rows(&tx, &sql)?;
            match kind {
                StatementKind::Read => tx.rollback().map_err(map_sqlite_error)?,
                StatementKind::Write => tx.commit().map_err(map_sqlite_error)?,
            }
            Ok(rows)
        })
        .await
    }

    async fn apply_ddl(&self, statements: &[String], timeout: Duration) -> Result<()> {
        let statements = statements.to_vec();
        self.blocking(timeout, move |conn| {
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            for statement in &statements {
                debug!("DDL: {}", statement);
                tx.execute_batch(statement).map_err(map_sqlite_error)?;
            }
            tx.commit().map_err(map_sqlite_error)
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
        let sql = insert_statement(Dialect::Sqlite, table, columns, returning);
        let rows = rows.to_vec();
        let returning = returning.is_some();
        self.blocking(timeout, move |conn| {
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let mut generated = Vec::new();
            {
                let mut stmt = tx.prepare(&sql).map_err(map_sqlite_error)?;
                for values in &rows {
                    if returning {
                        let value = stmt
                            .query_row(params_from_iter(values.iter()), |row| Ok(convert(row.get_ref(0)?)))
                            .map_err(map_sqlite_error)?;
                        generated.push(value);
                    } else {
                        stmt.execute(params_from_iter(values.iter())).map_err(map_sqlite_error)?;
                    }
                }
            }
            tx.commit().map_err(map_sqlite_error)?;
            Ok(generated)
        })
        .await
    }
}

fn query_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let columns: Vec<(String, Option<String>)> = stmt
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
        .collect();

    let mut exact: Vec<Option<Exact>> = columns.iter().map(|(_, decl)| decl.as_deref().and_then(Exact::from_decl)).collect();
    if columns.iter().any(|(_, decl)| decl.is_none()) {
        for (slot, derived) in exact.iter_mut().zip(derived_exact(conn, sql, columns.len())) {
            if slot.is_none() {
                *slot = derived;
            }
        }
    }

    let mut rows = stmt.query([]).map_err(map_sqlite_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut converted = Row::with_capacity(columns.len());
        for (idx, (name, _)) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(map_sqlite_error)?;
            let value = match exact[idx] {
                Some(exact) => exact.decode(value),
                None => convert(value),
            };
            converted.insert(name.clone(), value);
        }
        out.push(converted);
    }
    Ok(out)
}

/// Exact-numeric decoding for one result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exact {
    Scale(u32),
    Unscaled,
}

impl Exact {
    fn from_decl(decl: &str) -> Option<Self> {
        if TypeFamily::parse(decl) != Some(TypeFamily::Decimal) {
            return None;
        }
        let scale = decl
            .split_once('(')
            .and_then(|(_, args)| args.trim_end().trim_end_matches(')').split(',').nth(1))
            .and_then(|s| s.trim().parse().ok());
        Some(scale.map_or(Exact::Unscaled, Exact::Scale))
    }

    fn merge(self, other: Exact) -> Exact {
        if self == other {
            self
        } else {
            Exact::Unscaled
        }
    }

    fn decode(self, value: ValueRef<'_>) -> Value {
        let decimal = match value {
            ValueRef::Integer(i) => Some(Decimal::from(i)),
            ValueRef::Real(f) => Decimal::from_f64(f),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(|t| t.trim().parse().ok()),
            ValueRef::Null | ValueRef::Blob(_) => None,
        };
        match (decimal, self) {
            (Some(mut d), Exact::Scale(scale)) => {
                d.rescale(scale);
                Value::Decimal(d)
            }
            (Some(d), Exact::Unscaled) => Value::Decimal(d.normalize()),
            (None, _) => convert(value),
        }
    }
}

const EXACT_AGGREGATES: [&str; 5] = ["SUM", "TOTAL", "MIN", "MAX", "AVG"];

/// Result columns without a declared type that aggregate a single NUMERIC
/// column. Only plain projections are recognised; anything else decodes as
/// the storage class SQLite returns.
fn derived_exact(conn: &Connection, sql: &str, width: usize) -> Vec<Option<Exact>> {
    let mut derived = vec![None; width];
    let Ok(mut statements) = Parser::parse_sql(&SQLiteDialect {}, sql) else { return derived };
    let Some(Statement::Query(query)) = statements.pop() else { return derived };
    let SetExpr::Select(select) = query.body.as_ref() else { return derived };
    if select.projection.len() != width {
        return derived;
    }
    let numeric = match numeric_columns(conn) {
        Ok(numeric) if !numeric.is_empty() => numeric,
        _ => return derived,
    };

    for (slot, item) in derived.iter_mut().zip(&select.projection) {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        let Expr::Function(function) = expr else { continue };
        let name = function.name.to_string().to_uppercase();
        if !EXACT_AGGREGATES.contains(&name.as_str()) {
            continue;
        }
        let [FunctionArg::Unnamed(FunctionArgExpr::Expr(arg))] = function.args.as_slice() else { continue };
        let column = match arg {
            Expr::Identifier(ident) => Some(&ident.value),
            Expr::CompoundIdentifier(idents) => idents.last().map(|i| &i.value),
            _ => None,
        };
        *slot = column.and_then(|c| numeric.get(&c.to_lowercase())).map(|exact| match name.as_str() {
            "AVG" => Exact::Unscaled,
            _ => *exact,
        });
    }
    derived
}

/// NUMERIC/DECIMAL columns by lower-cased name across all tables.
fn numeric_columns(conn: &Connection) -> Result<HashMap<String, Exact>> {
    let mut stmt = conn
        .prepare(
            "SELECT p.name, p.type FROM sqlite_master AS m JOIN pragma_table_info(m.name) AS p \
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'",
        )
        .map_err(map_sqlite_error)?;
    let declared = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(map_sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_sqlite_error)?;

    let mut numeric: HashMap<String, Exact> = HashMap::new();
    for (name, decl) in declared {
        if let Some(exact) = Exact::from_decl(&decl) {
            let name = name.to_lowercase();
            let merged = numeric.get(&name).map_or(exact, |seen| seen.merge(exact));
            numeric.insert(name, merged);
        }
    }
    Ok(numeric)
}

fn convert(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(format!("<blob {} bytes>", bytes.len())),
    }
}

fn read_schema(conn: &Connection) -> Result<Schema> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .map_err(map_sqlite_error)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(map_sqlite_error)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(map_sqlite_error)?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let mut columns_stmt = conn
            .prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid")
            .map_err(map_sqlite_error)?;
        let columns = columns_stmt
            .query_map([&name], |row| {
                let primary_key = row.get::<_, i64>(4)? > 0;
                Ok(Column {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    nullable: row.get::<_, i64>(2)? == 0 && !primary_key,
                    primary_key,
                    default: row.get(3)?,
                    description: None,
                })
            })
            .map_err(map_sqlite_error)?
            .collect::<rusqlite::Result<Vec<Column>>>()
            .map_err(map_sqlite_error)?;

        let mut fk_stmt = conn
            .prepare("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq")
            .map_err(map_sqlite_error)?;
        let foreign_keys = fk_stmt
            .query_map([&name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(map_sqlite_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_error)?;

        let mut table = Table::new(name, columns);
        for (column, referenced_table, referenced_column) in foreign_keys {
            table.foreign_keys.push(ForeignKey {
                column,
                referenced_table,
                referenced_column: referenced_column.unwrap_or_default(),
            });
        }
        tables.push(table);
    }

    // `REFERENCES parent` without a column list points at the parent's key.
    let primary_keys: Vec<(String, String)> = tables
        .iter()
        .filter_map(|t| t.primary_key().map(|c| (t.name.to_lowercase(), c.name.clone())))
        .collect();
    for table in &mut tables {
        for fk in &mut table.foreign_keys {
            if fk.referenced_column.is_empty() {
                match primary_keys.iter().find(|(t, _)| *t == fk.referenced_table.to_lowercase()) {
                    Some((_, pk)) => fk.referenced_column = pk.clone(),
                    None => warn!("Foreign key {}.{} has no resolvable target column", table.name, fk.column),
                }
            }
        }
    }

    Ok(Schema::new(tables))
}

fn map_sqlite_error(err: rusqlite::Error) -> AgentError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let detail = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::OperationInterrupted => AgentError::ExecutionTimeout(0.0),
                ErrorCode::ConstraintViolation => AgentError::ConstraintViolation(detail),
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::NotADatabase => AgentError::Connection(detail),
                _ => AgentError::Execution(detail),
            }
        }
        _ => AgentError::Execution(err.to_string()),
    }
}
