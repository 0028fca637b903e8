//! Deduplication Index: at-most-one producer per `(source_id, stage[,
//! model_id])`, §4.2.
//!
//! The claim table is in-memory only — durability of "who is claiming
//! what" lives in the Artifact Store's `extraction.state` column, which the
//! Recovery Manager reconciles on restart. This index just arbitrates
//! *within* a single process lifetime, the same split the teacher draws
//! between its in-memory session map and the durable `import_sessions`
//! table.

use crate::models::ArtifactRecord;
use crate::store::ArtifactStore;
use chorus_common::{ErrorKind, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// The claim key. `model_id` only participates for `extract` — two
/// `extract` requests for the same `source_id` but different models never
/// collide, per §4.2.1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub source_id: String,
    pub stage: chorus_common::Stage,
    pub model_id: Option<String>,
}

impl ClaimKey {
    pub fn new(
        source_id: impl Into<String>,
        stage: chorus_common::Stage,
        model_id: Option<&str>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            stage,
            model_id: model_id.map(str::to_string),
        }
    }
}

/// What a [`DedupIndex::release`] tells waiting subscribers.
#[derive(Debug, Clone)]
pub enum ClaimResolution {
    Succeeded(Box<ArtifactRecord>),
    Failed(ErrorKind),
}

/// The outcome of a [`DedupIndex::claim`] call.
pub enum ClaimOutcome {
    /// The caller is now the sole producer; it must eventually call
    /// [`DedupIndex::release`] exactly once.
    Won,
    /// Another job already owns this claim; `watch()` resolves once that
    /// job (or whichever job it hands off to) calls `release`.
    AlreadyInProgress(watch::Receiver<Option<ClaimResolution>>),
    /// The work is already committed; no job is needed.
    AlreadyDone(Box<ArtifactRecord>),
}

struct ClaimEntry {
    job_id: Uuid,
    tx: watch::Sender<Option<ClaimResolution>>,
}

pub struct DedupIndex {
    store: Arc<ArtifactStore>,
    claims: Mutex<HashMap<ClaimKey, ClaimEntry>>,
}

impl DedupIndex {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to become the sole producer of `key`. Checks the durable
    /// "already done" condition before consulting the in-memory claim
    /// table, so a completed extraction never gets re-claimed just because
    /// the process restarted and the table is empty.
    pub async fn claim(&self, key: ClaimKey, job_id: Uuid) -> Result<ClaimOutcome> {
        if key.stage == chorus_common::Stage::Extract {
            if let Some(model_id) = &key.model_id {
                if self
                    .store
                    .extraction_complete(&key.source_id, model_id)
                    .await?
                {
                    let record = self
                        .store
                        .get_record(&key.source_id)
                        .await?
                        .expect("extraction_complete implies a record exists");
                    return Ok(ClaimOutcome::AlreadyDone(Box::new(record)));
                }
            }
        }

        let mut claims = self.claims.lock().await;
        if let Some(entry) = claims.get(&key) {
            // A `reassign` handoff (§5 cancel-with-subscribers) points this
            // claim at a continuation job before that job ever calls
            // `claim` itself; when it does, it must see `Won`, not
            // `AlreadyInProgress` on its own claim, or it would subscribe
            // to a `release` only it can send and hang until the stage
            // timeout.
            if entry.job_id == job_id {
                return Ok(ClaimOutcome::Won);
            }
            return Ok(ClaimOutcome::AlreadyInProgress(entry.tx.subscribe()));
        }

        let (tx, _rx) = watch::channel(None);
        claims.insert(key, ClaimEntry { job_id, tx });
        Ok(ClaimOutcome::Won)
    }

    /// Called by the winning claimant exactly once. Broadcasts the
    /// resolution to every subscriber and removes the claim.
    pub async fn release(&self, key: &ClaimKey, resolution: ClaimResolution) {
        let mut claims = self.claims.lock().await;
        if let Some(entry) = claims.remove(key) {
            let _ = entry.tx.send(Some(resolution));
        }
    }

    /// Hands the claim to `new_job_id` without resolving subscribers — used
    /// when the original claimant is cancelled but at least one subscriber
    /// still wants the result (§5, "ownership handoff on cancel"). Returns
    /// `false` if the claim no longer exists (already released).
    pub async fn reassign(&self, key: &ClaimKey, new_job_id: Uuid) -> bool {
        let mut claims = self.claims.lock().await;
        match claims.get_mut(key) {
            Some(entry) => {
                entry.job_id = new_job_id;
                true
            }
            None => false,
        }
    }

    /// The job currently recognized as the producer for `key`, if any.
    pub async fn current_claimant(&self, key: &ClaimKey) -> Option<Uuid> {
        self.claims.lock().await.get(key).map(|e| e.job_id)
    }

    /// Number of subscribers still waiting on `key` (the owning job does
    /// not count itself). Used to decide whether a cancel should hand off
    /// ownership or simply release.
    pub async fn subscriber_count(&self, key: &ClaimKey) -> usize {
        self.claims
            .lock()
            .await
            .get(key)
            .map(|e| e.tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactStore;
    use chorus_common::Stage;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> Arc<ArtifactStore> {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        Arc::new(
            ArtifactStore::open(pool, dir.path().to_path_buf())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn second_claimant_loses_and_observes_release() {
        let index = DedupIndex::new(test_store().await);
        let key = ClaimKey::new("xA1B2c", Stage::Extract, Some("four_stem_v1"));

        let first = index.claim(key.clone(), Uuid::new_v4()).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Won));

        let second = index.claim(key.clone(), Uuid::new_v4()).await.unwrap();
        let mut rx = match second {
            ClaimOutcome::AlreadyInProgress(rx) => rx,
            _ => panic!("expected AlreadyInProgress"),
        };

        index
            .release(
                &key,
                ClaimResolution::Succeeded(Box::new(ArtifactRecord::new("xA1B2c"))),
            )
            .await;

        rx.changed().await.unwrap();
        assert!(matches!(
            *rx.borrow(),
            Some(ClaimResolution::Succeeded(_))
        ));
    }

    #[tokio::test]
    async fn different_model_ids_do_not_collide() {
        let index = DedupIndex::new(test_store().await);
        let four_stem = ClaimKey::new("xA1B2c", Stage::Extract, Some("four_stem_v1"));
        let six_stem = ClaimKey::new("xA1B2c", Stage::Extract, Some("six_stem_v1"));

        let a = index.claim(four_stem, Uuid::new_v4()).await.unwrap();
        let b = index.claim(six_stem, Uuid::new_v4()).await.unwrap();
        assert!(matches!(a, ClaimOutcome::Won));
        assert!(matches!(b, ClaimOutcome::Won));
    }

    #[tokio::test]
    async fn reassign_moves_ownership_without_resolving() {
        let index = DedupIndex::new(test_store().await);
        let key = ClaimKey::new("xA1B2c", Stage::Fetch, None);
        let original = Uuid::new_v4();
        index.claim(key.clone(), original).await.unwrap();

        let subscriber = Uuid::new_v4();
        assert!(index.reassign(&key, subscriber).await);
        assert_eq!(index.current_claimant(&key).await, Some(subscriber));
    }

    #[tokio::test]
    async fn reassigned_job_wins_its_own_claim_instead_of_waiting_on_itself() {
        let index = DedupIndex::new(test_store().await);
        let key = ClaimKey::new("xA1B2c", Stage::Fetch, None);
        let original = Uuid::new_v4();
        index.claim(key.clone(), original).await.unwrap();

        let continuation = Uuid::new_v4();
        assert!(index.reassign(&key, continuation).await);

        // The continuation job's own `claim` call must see `Won`, not
        // `AlreadyInProgress` — otherwise it subscribes to a `release` it
        // alone is responsible for sending and hangs forever.
        let outcome = index.claim(key.clone(), continuation).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Won));
    }
}
