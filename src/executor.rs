//! Query executor
//!
//! Runs validated statements only. Transaction scope, rollback and
//! cancellation are delegated to the [`Database`] backend.

use crate::db::Database;
use crate::error::Result;
use crate::sql::ValidatedStatement;
use crate::value::Row;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Rows plus how long the database call took.
#[derive(Debug, Clone)]
pub struct Execution {
    pub rows: Vec<Row>,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct QueryExecutor {
    db: Arc<dyn Database>,
}

impl QueryExecutor {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn execute(&self, statement: &ValidatedStatement, timeout: Duration) -> Result<Execution> {
        let started = Instant::now();
        let result = self.db.run_statement(&statement.sql, statement.kind, timeout).await;
        let elapsed = started.elapsed();

        match result {
            Ok(rows) => {
                info!("Query returned {} rows in {:.3}s", rows.len(), elapsed.as_secs_f64());
                Ok(Execution { rows, elapsed })
            }
            Err(e) => {
                warn!("Query failed after {:.3}s: {}", elapsed.as_secs_f64(), e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteDatabase, StatementKind};
    use crate::error::AgentError;
    use crate::value::Value;
    use rust_decimal::Decimal;

    async fn executor() -> QueryExecutor {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.apply_ddl(
            &[
                "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance NUMERIC(10,2))".to_string(),
                "INSERT INTO accounts (balance) VALUES (10.5), (20)".to_string(),
            ],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        QueryExecutor::new(Arc::new(db))
    }

    fn statement(sql: &str, kind: StatementKind) -> ValidatedStatement {
        ValidatedStatement {
            sql: sql.to_string(),
            kind,
            tables: vec!["accounts".to_string()],
        }
    }

    #[tokio::test]
    async fn test_returns_rows_in_column_order() {
        let executor = executor().await;
        let execution = executor
            .execute(&statement("SELECT id, balance FROM accounts ORDER BY id", StatementKind::Read), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(execution.rows.len(), 2);
        let columns: Vec<&str> = execution.rows[0].keys().map(|k| k.as_str()).collect();
        assert_eq!(columns, vec!["id", "balance"]);
        assert_eq!(execution.rows[0]["balance"], Value::Decimal(Decimal::new(1050, 2)));
        assert_eq!(execution.rows[1]["balance"], Value::Decimal(Decimal::new(2000, 2)));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing_behind() {
        let executor = executor().await;
        let err = executor
            .execute(
                &statement("UPDATE accounts SET balance = balance + missing_column", StatementKind::Write),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Execution(_)));

        let execution = executor
            .execute(&statement("SELECT SUM(balance) AS total FROM accounts", StatementKind::Read), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(execution.rows[0]["total"], Value::Decimal(Decimal::new(3050, 2)));
    }
}
