//! Domain schema: artifact records, access grants, job history.
//!
//! Each migration is guarded by `schema_migrations.version` via
//! `chorus_common::db::migrations`, following its "never modify, only add"
//! guidelines.

use chorus_common::db::migrations::{current_version, record_version};
use chorus_common::Result;
use sqlx::SqlitePool;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS artifact_records (
            source_id TEXT PRIMARY KEY,
            title TEXT,
            duration_seconds REAL,
            thumbnail_ref TEXT,
            audio_blob_ref TEXT,
            analysis_json TEXT NOT NULL DEFAULT '{}',
            extraction_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE IF NOT EXISTS access_grants (
            user_id TEXT NOT NULL,
            source_id TEXT NOT NULL,
            granted_at TEXT NOT NULL,
            PRIMARY KEY (user_id, source_id)
        )
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE IF NOT EXISTS job_history (
            job_id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            outcome TEXT NOT NULL,
            error_kind TEXT,
            brief_message TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL
        )
        "#,
    ),
    (
        4,
        "CREATE INDEX IF NOT EXISTS idx_job_history_source_stage ON job_history (source_id, stage)",
    ),
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let version = current_version(pool).await?;
    for (migration_version, sql) in MIGRATIONS {
        if *migration_version <= version {
            continue;
        }
        sqlx::query(sql).execute(pool).await?;
        record_version(pool, *migration_version).await?;
        tracing::info!(version = migration_version, "applied engine migration");
    }
    Ok(())
}
