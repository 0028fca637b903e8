//! Shared migration helpers
//!
//! Each service owns its own table definitions and its own ordered list of
//! migration functions; this module only provides the idempotency checks
//! and version bookkeeping those functions are built from, so every
//! service's migration runner reads the same way.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** — they must remain stable for
//!    databases that already recorded them as applied.
//! 2. **Always add new migrations** — one function per schema change.
//! 3. **Use `ALTER TABLE ADD COLUMN`** over drop/recreate to preserve data.
//! 4. **Guard every migration with an existence check** so re-running the
//!    full list against an up-to-date database is a no-op.

use crate::Result;
use sqlx::SqlitePool;

/// Highest `schema_migrations.version` recorded, or 0 if none has run yet.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;
    Ok(version.unwrap_or(0))
}

/// Record that `version` has been applied.
pub async fn record_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether `table` exists in the database.
pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Whether `table` already has a column named `column`.
pub async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?",
        table
    ))
    .bind(column)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn current_version_is_zero_without_table() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn record_and_read_back_version() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)",
        )
        .execute(&pool)
        .await
        .unwrap();
        record_version(&pool, 1).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn column_exists_detects_added_column() {
        let pool = memory_pool().await;
        sqlx::query("CREATE TABLE widgets (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        assert!(!column_exists(&pool, "widgets", "name").await.unwrap());
        sqlx::query("ALTER TABLE widgets ADD COLUMN name TEXT")
            .execute(&pool)
            .await
            .unwrap();
        assert!(column_exists(&pool, "widgets", "name").await.unwrap());
    }
}
