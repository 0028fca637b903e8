//! Database connection bootstrap
//!
//! Opens (creating if absent) the catalog database and ensures the
//! `schema_migrations` bookkeeping table exists. Domain tables are created
//! by each service's own migration module via [`crate::db::migrations`]
//! helpers, the same split the teacher uses between its shared
//! `schema_version` table and each binary's own passages/songs/files tables.

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open a SQLite connection pool for `db_path`, creating the file and its
/// parent directory if necessary.
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    ensure_schema_migrations_table(&pool).await?;

    Ok(pool)
}

async fn ensure_schema_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
