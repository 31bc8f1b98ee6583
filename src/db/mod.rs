//! Store plumbing: pool configuration, schema bookkeeping and migrations.
//! The SQL engine itself is an external collaborator; this module only
//! encodes how the engine uses it (WAL, foreign keys, versioned DDL).

pub mod access;
pub mod migrations;
pub mod schema;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

/// Open the database, creating it if missing, with the PRAGMAs every
/// connection needs.
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    let url = format!("sqlite:{}?mode=rwc", db_path.display());
    let connect_options = SqliteConnectOptions::from_str(&url)
        .context("invalid database path")?
        .create_if_missing(true)
        // WAL lets the parser workers read while the discoverer writes
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                use sqlx::Executor;
                // Cache size: -32000 = 32MB (negative = KB)
                conn.execute("PRAGMA cache_size = -32000").await?;
                conn.execute("PRAGMA temp_store = MEMORY").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    tracing::debug!("SQLite configured: WAL mode, NORMAL sync, foreign keys on");
    Ok(pool)
}

/// Single-connection in-memory pool for tests. One connection only: each
/// in-memory connection is its own database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("in-memory options")?
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options)
        .await?;
    Ok(pool)
}

/// Model version recorded in the settings row, or `None` when the database
/// has no settings table yet (fresh file).
pub async fn model_version(pool: &SqlitePool) -> Result<Option<u32>> {
    let table: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'settings'",
    )
    .fetch_optional(pool)
    .await?;
    if table.is_none() {
        return Ok(None);
    }
    let row: Option<(i64,)> = sqlx::query_as("SELECT db_model_version FROM settings WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v as u32))
}

pub async fn set_model_version(pool: &SqlitePool, version: u32) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (id, db_model_version) VALUES (1, ?)
         ON CONFLICT(id) DO UPDATE SET db_model_version = excluded.db_model_version",
    )
    .bind(version as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Verify both the storage-level integrity (`PRAGMA quick_check`) and that
/// the DDL of every expected table matches the one shipped for the current
/// model version. A database whose DDL strings differ is rejected.
pub async fn check_integrity(pool: &SqlitePool) -> Result<bool> {
    let check: (String,) = sqlx::query_as("PRAGMA quick_check(1)")
        .fetch_one(pool)
        .await?;
    if check.0 != "ok" {
        tracing::error!("Database quick_check failed: {}", check.0);
        return Ok(false);
    }

    for (name, ddl) in schema::TABLES {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        let found = match row {
            Some((sql,)) => sql,
            None => {
                tracing::error!("Missing table '{}'", name);
                return Ok(false);
            }
        };
        if normalize_ddl(&found) != normalize_ddl(ddl) {
            tracing::error!("Unexpected DDL for table '{}'", name);
            return Ok(false);
        }
    }
    Ok(true)
}

/// SQLite stores the DDL mostly verbatim and `ALTER TABLE ADD COLUMN`
/// splices text around the original indentation; strip whitespace entirely
/// so only the token stream is compared.
fn normalize_ddl(sql: &str) -> String {
    sql.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Release unused memory back to the OS after a large scan.
pub async fn shrink_memory(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA shrink_memory").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_database_has_no_version() {
        let pool = connect_in_memory().await.unwrap();
        assert_eq!(model_version(&pool).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_schema_roundtrip() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        assert_eq!(
            model_version(&pool).await.unwrap(),
            Some(schema::DB_MODEL_VERSION)
        );
        assert!(check_integrity(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_integrity_rejects_modified_ddl() {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        sqlx::query("ALTER TABLE genres ADD COLUMN extra TEXT")
            .execute(&pool)
            .await
            .unwrap();
        assert!(!check_integrity(&pool).await.unwrap());
    }
}
