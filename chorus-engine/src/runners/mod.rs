//! Stage Runners: one state machine per job, §4.5.
//!
//! Grounded on the teacher's `SongWorkflowEngine` / `SessionOrchestrator`
//! pair (`import_v2::song_workflow_engine`, `import_v2::session_orchestrator`):
//! a small `*Engine` struct per unit of work, invoked by an orchestrator that
//! owns the database pool, the event bus and cancellation token, and that
//! persists a single commit after the unit of work finishes. Here the
//! "orchestrator" role is split across `Engine::spawn_queues` (the common
//! PREPARING/WORKING/COMMITTING bookkeeping, identical for every stage) and
//! one `StageRunner` impl per stage (the stage-specific algorithm).

mod analyze;
mod context;
mod extract;
mod fetch;
mod post_extract;

pub use analyze::AnalyzeRunner;
pub use context::{RunnerContext, UploadStaging};
pub use extract::ExtractRunner;
pub use fetch::FetchRunner;
pub use post_extract::PostExtractRunner;

use crate::dedup::ClaimKey;
use crate::queue::Job;
use async_trait::async_trait;
use chorus_common::events::{ArtifactSummary, ProgressEventBody};
use chorus_common::{ClassifiedError, ProgressEvent};
use tokio_util::sync::CancellationToken;

/// What a [`StageRunner::run`] call resolved to. `Produced` and `Reused`
/// both mean "this source_id's stage output is now available"; the
/// distinction only matters to [`crate::engine::Engine`]'s decision of
/// whether to auto-enqueue the dependent stage (only the winner that
/// actually produced new output triggers it — a deduplicated loser would
/// otherwise enqueue a redundant follow-on for every subscriber).
#[derive(Debug)]
pub enum StageOutcome {
    Produced(Box<crate::models::ArtifactRecord>),
    Reused(Box<crate::models::ArtifactRecord>),
    Failed(ClassifiedError),
    Cancelled,
}

#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, job: &Job, cancel: &CancellationToken, ctx: &RunnerContext) -> StageOutcome;
}

/// Builds the `Completed` event payload from a freshly committed record.
pub fn artifact_summary(record: &crate::models::ArtifactRecord) -> ArtifactSummary {
    ArtifactSummary {
        source_id: record.source_id.clone(),
        title: record.title.clone(),
        has_stems: record.extraction.stem_refs.as_ref().is_some_and(|m| !m.is_empty()),
        has_chords: record.analysis.chords.as_ref().is_some_and(|c| !c.is_empty()),
        has_structure: record.analysis.structure.as_ref().is_some_and(|s| !s.is_empty()),
        has_lyrics: record.analysis.lyrics.as_ref().is_some_and(|l| !l.lines.is_empty()),
    }
}

/// Classifies an adapter-boundary error into the §7 taxonomy. Adapters
/// return the shared `chorus_common::Error`, not a capability-specific
/// error type, so classification happens here, at the Stage Runner
/// boundary, exactly as §7's propagation policy describes. `default_kind`
/// covers the cases a capability failure should map to when nothing more
/// specific applies (e.g. `CodecFailure` for the audio codec, `AnalyzerFailure`
/// for the analysis adapters).
pub fn classify_adapter_error(err: &chorus_common::Error, default_kind: chorus_common::ErrorKind) -> ClassifiedError {
    use chorus_common::{Error, ErrorKind};
    match err {
        Error::MissingBlob(_) | Error::Conflict(_) | Error::Database(_) | Error::Io(_) => {
            ClassifiedError::new(ErrorKind::StorageFailure, err.to_string())
        }
        Error::Serialization(_) | Error::Config(_) => {
            ClassifiedError::new(ErrorKind::StorageFailure, err.to_string())
        }
        Error::NotFound(_) | Error::InvalidInput(_) => {
            ClassifiedError::new(ErrorKind::BadInput, err.to_string())
        }
        Error::Internal(msg) if msg.contains("rate_limited") => {
            ClassifiedError::new(ErrorKind::RateLimited, msg.clone())
        }
        Error::Internal(msg) => ClassifiedError::new(default_kind, msg.clone()),
    }
}

/// Emits a `Progress` event for `job` to its claimant's room.
pub async fn emit_progress(
    ctx: &RunnerContext,
    job: &Job,
    phase: &str,
    percent: u8,
    detail: Option<String>,
) {
    let event = ProgressEvent {
        job_id: Some(job.job_id),
        source_id: job.source_id.clone(),
        user_id: Some(job.claimant_user_id.clone()),
        stage: Some(job.stage),
        body: ProgressEventBody::Progress {
            phase: phase.to_string(),
            percent,
            detail,
        },
        timestamp: chrono::Utc::now(),
    };
    ctx.bus.publish_to_user(job.claimant_user_id.clone(), event).await;
}

/// Common "cancel during produce" handling shared by the Fetch and Extract
/// runners, the two stages whose claim can be handed off to a waiting
/// subscriber rather than simply failed, per §5: "the first cancellation
/// by the original claimant reassigns ownership to one of the subscribers
/// if any exist." Since the Deduplication Index does not track individual
/// subscriber identities (only a count and a shared watch channel), the
/// handoff is realized by re-enqueueing a fresh job for the same
/// `(source_id, stage[, model_id])` and reassigning the claim to it; every
/// existing subscriber (including the original claimant's own watchers,
/// if any) stays attached to the same watch channel and observes that
/// job's eventual `release`.
pub async fn handle_mid_produce_cancellation(
    ctx: &RunnerContext,
    key: &ClaimKey,
    job: &Job,
) -> StageOutcome {
    let subscribers = ctx.dedup.subscriber_count(key).await;
    if subscribers == 0 {
        ctx.dedup
            .release(
                key,
                crate::dedup::ClaimResolution::Failed(chorus_common::ErrorKind::Cancelled),
            )
            .await;
        return StageOutcome::Cancelled;
    }

    let continuation = Job::new(
        job.source_id.clone(),
        job.stage,
        job.claimant_user_id.clone(),
        job.resource_tag,
        job.parameters.clone(),
    );
    ctx.dedup.reassign(key, continuation.job_id).await;
    ctx.queue.enqueue(continuation);
    StageOutcome::Cancelled
}
