//! `ArtifactStore`: the transactional metadata catalog plus the blob tree
//! it indexes, §4.1.
//!
//! Record-level mutual exclusion is an in-process `Arc<Mutex<()>>` per
//! `source_id`, held in a map guarded by its own short-lived
//! `std::sync::Mutex`, the same sharded-lock idiom the teacher uses in
//! `AppState` for its cancellation-token map, repurposed here for
//! read-modify-write safety on `upsert_record`.

use super::blobs::{self, BlobKind, BlobRef};
use super::migrations;
use crate::models::{ArtifactPatch, ArtifactRecord, ExtractionState, JobHistoryRecord};
use chorus_common::{Error, Result};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, FromRow)]
struct RecordRow {
    source_id: String,
    title: Option<String>,
    duration_seconds: Option<f64>,
    thumbnail_ref: Option<String>,
    audio_blob_ref: Option<String>,
    analysis_json: String,
    extraction_json: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl RecordRow {
    fn into_record(self) -> Result<ArtifactRecord> {
        let audio_blob_ref = self
            .audio_blob_ref
            .map(|s| serde_json::from_str(&s))
            .transpose()?;
        Ok(ArtifactRecord {
            source_id: self.source_id,
            title: self.title,
            duration_seconds: self.duration_seconds,
            thumbnail_ref: self.thumbnail_ref,
            audio_blob_ref,
            analysis: serde_json::from_str(&self.analysis_json)?,
            extraction: serde_json::from_str(&self.extraction_json)?,
            created_at: self.created_at,
        })
    }
}

fn job_state_str(state: crate::models::JobState) -> &'static str {
    use crate::models::JobState;
    match state {
        JobState::Queued => "queued",
        JobState::Running => "running",
        JobState::Succeeded => "succeeded",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}

/// Filter accepted by [`ArtifactStore::list_records`]. All fields are
/// conjunctive; an absent field matches everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub title_contains: Option<String>,
    pub extraction_state: Option<ExtractionState>,
    pub limit: Option<i64>,
}

pub struct ArtifactStore {
    pool: SqlitePool,
    root: PathBuf,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ArtifactStore {
    pub async fn open(pool: SqlitePool, root: PathBuf) -> Result<Self> {
        migrations::run_migrations(&pool).await?;
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            pool,
            root,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, source_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("artifact store lock poisoned");
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Read-modify-write a record: loads the current row (or starts a fresh
    /// one), applies only the `Some` fields of `patch`, and writes it back.
    /// Serialized per `source_id` so concurrent stage runners never clobber
    /// each other's fields.
    pub async fn upsert_record(
        &self,
        source_id: &str,
        patch: ArtifactPatch,
    ) -> Result<ArtifactRecord> {
        let lock = self.lock_for(source_id);
        let _guard = lock.lock().await;

        let mut record = self
            .get_record_unlocked(source_id)
            .await?
            .unwrap_or_else(|| ArtifactRecord::new(source_id));

        if let Some(v) = patch.title {
            record.title = Some(v);
        }
        if let Some(v) = patch.duration_seconds {
            record.duration_seconds = Some(v);
        }
        if let Some(v) = patch.thumbnail_ref {
            record.thumbnail_ref = Some(v);
        }
        if let Some(v) = patch.audio_blob_ref {
            record.audio_blob_ref = Some(v);
        }
        if let Some(v) = patch.analysis {
            record.analysis = v;
        }
        if let Some(v) = patch.extraction {
            record.extraction = v;
        }

        let audio_blob_ref = record
            .audio_blob_ref
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let analysis_json = serde_json::to_string(&record.analysis)?;
        let extraction_json = serde_json::to_string(&record.extraction)?;

        sqlx::query(
            r#"
            INSERT INTO artifact_records
                (source_id, title, duration_seconds, thumbnail_ref, audio_blob_ref,
                 analysis_json, extraction_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                title = excluded.title,
                duration_seconds = excluded.duration_seconds,
                thumbnail_ref = excluded.thumbnail_ref,
                audio_blob_ref = excluded.audio_blob_ref,
                analysis_json = excluded.analysis_json,
                extraction_json = excluded.extraction_json
            "#,
        )
        .bind(&record.source_id)
        .bind(&record.title)
        .bind(record.duration_seconds)
        .bind(&record.thumbnail_ref)
        .bind(&audio_blob_ref)
        .bind(&analysis_json)
        .bind(&extraction_json)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_record(&self, source_id: &str) -> Result<Option<ArtifactRecord>> {
        let lock = self.lock_for(source_id);
        let _guard = lock.lock().await;
        self.get_record_unlocked(source_id).await
    }

    async fn get_record_unlocked(&self, source_id: &str) -> Result<Option<ArtifactRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT source_id, title, duration_seconds, thumbnail_ref, audio_blob_ref,
                   analysis_json, extraction_json, created_at
            FROM artifact_records WHERE source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    pub async fn list_records(&self, filter: ListFilter) -> Result<Vec<ArtifactRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT source_id, title, duration_seconds, thumbnail_ref, audio_blob_ref,
                   analysis_json, extraction_json, created_at
            FROM artifact_records ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(row.into_record()?);
        }

        if let Some(needle) = &filter.title_contains {
            let needle = needle.to_lowercase();
            records.retain(|r| {
                r.title
                    .as_ref()
                    .is_some_and(|t| t.to_lowercase().contains(&needle))
            });
        }
        if let Some(state) = filter.extraction_state {
            records.retain(|r| r.extraction.state_or_none() == state);
        }
        if let Some(limit) = filter.limit {
            records.truncate(limit.max(0) as usize);
        }

        Ok(records)
    }

    /// Removes the record and its entire blob tree. Idempotent: a missing
    /// record is not an error.
    pub async fn delete_record(&self, source_id: &str) -> Result<()> {
        let lock = self.lock_for(source_id);
        let _guard = lock.lock().await;

        sqlx::query("DELETE FROM artifact_records WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        blobs::delete_source_tree(&self.root, source_id).await?;

        self.locks.lock().expect("artifact store lock poisoned").remove(source_id);
        Ok(())
    }

    pub async fn put_blob(
        &self,
        source_id: &str,
        kind: BlobKind,
        ext: &str,
        bytes: &[u8],
    ) -> Result<BlobRef> {
        blobs::put_blob(&self.root, source_id, kind, ext, bytes).await
    }

    pub async fn open_blob(&self, blob_ref: &BlobRef) -> Result<Vec<u8>> {
        blobs::open_blob(&self.root, blob_ref).await
    }

    /// Appends one row to the job history ledger. Never updated afterward —
    /// a job's outcome is written exactly once, when it reaches a terminal
    /// state.
    pub async fn record_job_history(&self, record: JobHistoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_history
                (job_id, source_id, stage, outcome, error_kind, brief_message, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(&record.source_id)
        .bind(record.stage.as_str())
        .bind(job_state_str(record.outcome))
        .bind(record.error_kind.map(|k| k.to_string()))
        .bind(&record.brief_message)
        .bind(record.started_at)
        .bind(record.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether every stem the named model produces has a ref and the
    /// extraction is marked `Done`. Used by the Deduplication Index before
    /// it reports `AlreadyDone`.
    pub async fn extraction_complete(&self, source_id: &str, model_id: &str) -> Result<bool> {
        let record = match self.get_record(source_id).await? {
            Some(r) => r,
            None => return Ok(false),
        };
        Ok(matches!(
            (record.extraction.model_id.as_deref(), record.extraction.state),
            (Some(recorded_model), Some(ExtractionState::Done)) if recorded_model == model_id
        ))
    }
}
