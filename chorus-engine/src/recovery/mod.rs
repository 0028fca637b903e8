//! Recovery Manager, §4.8: makes the system safe to restart.
//!
//! Modeled on the teacher's two-phase startup shape — connect, reconcile,
//! *then* accept traffic — generalized from a one-shot schema sync to a
//! full claim-state reconciliation pass.

use crate::models::ExtractionState;
use crate::store::ArtifactStore;
use chorus_common::{ErrorKind, ProgressBus, ProgressEvent};
use std::collections::HashSet;
use std::sync::Arc;

pub struct RecoveryManager {
    store: Arc<ArtifactStore>,
    bus: ProgressBus,
}

impl RecoveryManager {
    pub fn new(store: Arc<ArtifactStore>, bus: ProgressBus) -> Self {
        Self { store, bus }
    }

    /// Runs once at startup, before the Job Queue accepts submissions.
    /// Idempotent: a second run against an already-reconciled catalog is a
    /// no-op (§8's recovery law).
    pub async fn run(&self) -> chorus_common::Result<()> {
        let records = self.store.list_records(Default::default()).await?;
        let mut known_source_ids = HashSet::new();

        for record in &records {
            known_source_ids.insert(record.source_id.clone());

            let stuck = matches!(
                record.extraction.state,
                Some(ExtractionState::Claimed) | Some(ExtractionState::Running)
            );
            if !stuck {
                continue;
            }

            tracing::warn!(
                source_id = %record.source_id,
                "reconciling interrupted extraction claim at startup"
            );

            let mut extraction = record.extraction.clone();
            extraction.state = Some(ExtractionState::Failed);
            let patch = crate::models::ArtifactPatch {
                extraction: Some(extraction),
                ..Default::default()
            };
            self.store.upsert_record(&record.source_id, patch).await?;

            self.bus
                .publish_global(ProgressEvent::failed(
                    uuid::Uuid::nil(),
                    record.source_id.clone(),
                    None,
                    chorus_common::Stage::Extract,
                    ErrorKind::Interrupted,
                    "process restarted mid-extraction",
                ))
                .await;
        }

        self.sweep_orphan_blobs(&known_source_ids).await?;
        Ok(())
    }

    async fn sweep_orphan_blobs(&self, known_source_ids: &HashSet<String>) -> chorus_common::Result<()> {
        let root = self.store.root();
        let entries = match tokio::fs::read_dir(root).await {
            Ok(rd) => rd,
            Err(_) => return Ok(()),
        };
        let mut entries = entries;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if known_source_ids.contains(&name) {
                continue;
            }
            tracing::warn!(source_id = %name, "removing orphan blob directory with no matching record");
            tokio::fs::remove_dir_all(entry.path()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactPatch, Extraction};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> (Arc<ArtifactStore>, tempfile::TempDir) {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(pool, dir.path().to_path_buf()).await.unwrap());
        (store, dir)
    }

    #[tokio::test]
    async fn stuck_extraction_is_marked_failed() {
        let (store, _dir) = test_store().await;
        store
            .upsert_record(
                "xA1B2c",
                ArtifactPatch {
                    extraction: Some(Extraction {
                        state: Some(ExtractionState::Running),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let manager = RecoveryManager::new(store.clone(), ProgressBus::new(10));
        manager.run().await.unwrap();

        let record = store.get_record("xA1B2c").await.unwrap().unwrap();
        assert_eq!(record.extraction.state, Some(ExtractionState::Failed));
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let (store, _dir) = test_store().await;
        store
            .upsert_record(
                "xA1B2c",
                ArtifactPatch {
                    extraction: Some(Extraction {
                        state: Some(ExtractionState::Claimed),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let manager = RecoveryManager::new(store.clone(), ProgressBus::new(10));
        manager.run().await.unwrap();
        manager.run().await.unwrap();

        let record = store.get_record("xA1B2c").await.unwrap().unwrap();
        assert_eq!(record.extraction.state, Some(ExtractionState::Failed));
    }
}
