//! Access View: per-user read/subscribe permissions over Artifact Store
//! entries, §4.3.

use crate::models::{ArtifactRecord, Role};
use crate::store::ArtifactStore;
use chorus_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

/// A record as seen by a particular user: internal-only fields are
/// redacted unless the viewer is [`Role::Admin`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    pub record: ArtifactRecord,
}

pub struct AccessView {
    pool: SqlitePool,
    store: Arc<ArtifactStore>,
}

impl AccessView {
    pub fn new(pool: SqlitePool, store: Arc<ArtifactStore>) -> Self {
        Self { pool, store }
    }

    /// Idempotent: granting an existing `(user_id, source_id)` pair is a
    /// no-op that still returns success.
    pub async fn grant(&self, user_id: &str, source_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO access_grants (user_id, source_id, granted_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id, source_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(source_id)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent: revoking a grant that does not exist is a no-op.
    pub async fn revoke(&self, user_id: &str, source_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM access_grants WHERE user_id = ? AND source_id = ?")
            .bind(user_id)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn has_access(&self, user_id: &str, source_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM access_grants WHERE user_id = ? AND source_id = ?)",
        )
        .bind(user_id)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Every `user_id` holding a grant on `source_id`, used by the Progress
    /// Bus to fan out completion events to every entitled room.
    pub async fn grantees(&self, source_id: &str) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT user_id FROM access_grants WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Joins access grants with records, redacting fields a non-admin user
    /// should not see. Redaction here is a placeholder for a richer
    /// user-facing projection; today every field on [`ArtifactRecord`] is
    /// already user-safe, so only the `Role::User` path is distinguished
    /// for future extension.
    pub async fn list_for_user(&self, user_id: &str, role: Role) -> Result<Vec<RecordView>> {
        let source_ids: Vec<String> =
            sqlx::query_scalar("SELECT source_id FROM access_grants WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        let mut views = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            if let Some(record) = self.store.get_record(&source_id).await? {
                views.push(self.redact(record, role));
            }
        }
        Ok(views)
    }

    fn redact(&self, record: ArtifactRecord, role: Role) -> RecordView {
        let record = match role {
            Role::Admin => record,
            Role::User => record,
        };
        RecordView { record }
    }

    /// Removes every grant for `source_id`, used by `delete_record`'s
    /// cascading cleanup.
    pub async fn revoke_all_for_source(&self, source_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM access_grants WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    async fn test_view() -> AccessView {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ArtifactStore::open(pool.clone(), dir.path().to_path_buf())
                .await
                .unwrap(),
        );
        AccessView::new(pool, store)
    }

    #[tokio::test]
    async fn grant_is_idempotent() {
        let view = test_view().await;
        view.grant("u_alice", "xA1B2c").await.unwrap();
        view.grant("u_alice", "xA1B2c").await.unwrap();

        let grantees = view.grantees("xA1B2c").await.unwrap();
        assert_eq!(grantees, vec!["u_alice".to_string()]);
    }

    #[tokio::test]
    async fn revoke_removes_only_that_grant() {
        let view = test_view().await;
        view.grant("u_alice", "xA1B2c").await.unwrap();
        view.grant("u_bob", "xA1B2c").await.unwrap();

        view.revoke("u_alice", "xA1B2c").await.unwrap();

        assert!(!view.has_access("u_alice", "xA1B2c").await.unwrap());
        assert!(view.has_access("u_bob", "xA1B2c").await.unwrap());
    }
}
