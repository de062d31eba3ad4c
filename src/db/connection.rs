//! Database connection management

use super::{Database, PgDatabase, SqliteDatabase};
use crate::error::{AgentError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Initialize the PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(|e| AgentError::Connection(format!("Failed to connect to database: {}", e)))?;

    // Test the connection
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| AgentError::Connection(format!("Connection test failed: {}", e)))?;

    Ok(pool)
}

/// Open the backend named by the URL scheme.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Database>> {
    let url = database_url.trim();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        info!("Connecting to PostgreSQL");
        let pool = init_pool(url).await?;
        return Ok(Arc::new(PgDatabase::new(pool)));
    }

    if let Some(rest) = url.strip_prefix("sqlite:") {
        let path = rest.trim_start_matches("//");
        let db = if path.is_empty() || path == ":memory:" {
            info!("Opening in-memory SQLite database");
            SqliteDatabase::open_in_memory()?
        } else {
            info!("Opening SQLite database at {}", path);
            SqliteDatabase::open(path)?
        };
        return Ok(Arc::new(db));
    }

    Err(AgentError::Config(format!(
        "unsupported database URL '{}' (expected postgres://, postgresql:// or sqlite:)",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Dialect;

    #[tokio::test]
    async fn test_connect_sqlite_memory() {
        let db = connect("sqlite::memory:").await.unwrap();
        assert_eq!(db.dialect(), Dialect::Sqlite);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("mysql://localhost/db").await.err().unwrap();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
