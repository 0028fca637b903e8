//! The `Engine`: wires every component together, runs the Recovery Manager
//! once at startup, spawns the four stage queues, and exposes the control
//! surface from §6.
//!
//! Grounded on the teacher's two-phase `AppState` bootstrap (connect → run
//! migrations → *then* build the router), generalized here to "connect →
//! reconcile claims → *then* accept job submissions."

use crate::access::AccessView;
use crate::adapters::{AdapterRegistry, SourceSummary};
use crate::config::EngineConfig;
use crate::dedup::DedupIndex;
use crate::models::{ArtifactRecord, JobHistoryRecord, JobState as PersistedJobState, Role, StemName};
use crate::queue::{Job, JobId, JobParameters, JobQueue, ResourceTag};
use crate::recovery::RecoveryManager;
use crate::runners::{AnalyzeRunner, ExtractRunner, FetchRunner, PostExtractRunner, RunnerContext, StageOutcome, UploadStaging};
use crate::store::ArtifactStore;
use chorus_common::events::ProgressEventBody;
use chorus_common::{ClassifiedError, ErrorKind, ProgressBus, ProgressEvent, Result, RoomId, Stage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Outcome handed back to the control surface caller for a request that may
/// short-circuit on an already-satisfied dedup claim.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Accepted { job_id: JobId },
    AlreadyDone { record: Box<ArtifactRecord> },
}

/// Outcome of `cancel`, per §6's `cancel(user_id, job_id) -> ok | not_owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotOwner,
    NotFound,
}

pub struct Engine {
    pub store: Arc<ArtifactStore>,
    pub dedup: Arc<DedupIndex>,
    pub access: Arc<AccessView>,
    pub bus: ProgressBus,
    pub adapters: Arc<AdapterRegistry>,
    pub config: Arc<EngineConfig>,
    pub queue: Arc<JobQueue>,
    uploads: UploadStaging,
    /// Who requested each in-flight job, consulted by `cancel` to report
    /// `not_owner`. `job_history` only gains a row once a job finishes, so
    /// this in-memory map covers the window `job_history` can't.
    job_owners: StdMutex<HashMap<JobId, String>>,
}

impl Engine {
    /// Connects storage, reconciles any interrupted claims left by a
    /// previous process, then spawns the four stage queues. No job can be
    /// submitted before this returns, matching §4.8's "runs exactly once
    /// per process start, before the Job Queue accepts new submissions."
    pub async fn bootstrap(config: EngineConfig, adapters: AdapterRegistry) -> Result<Arc<Self>> {
        let db_path = config.downloads_root.join("catalog.db");
        let pool = chorus_common::db::connect(&db_path).await?;
        let store = Arc::new(ArtifactStore::open(pool.clone(), config.downloads_root.clone()).await?);
        let dedup = Arc::new(DedupIndex::new(store.clone()));
        let access = Arc::new(AccessView::new(pool, store.clone()));
        let bus = ProgressBus::new(config.progress_room_capacity);

        RecoveryManager::new(store.clone(), bus.clone()).run().await?;

        let cpu_slots = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let queue = JobQueue::new(cpu_slots, config.gpu_slots);

        let engine = Arc::new(Self {
            store,
            dedup,
            access,
            bus,
            adapters: Arc::new(adapters),
            config: Arc::new(config),
            queue,
            uploads: Arc::new(Mutex::new(HashMap::new())),
            job_owners: StdMutex::new(HashMap::new()),
        });

        engine.spawn_queues();
        Ok(engine)
    }

    fn runner_context(&self) -> RunnerContext {
        RunnerContext {
            store: self.store.clone(),
            dedup: self.dedup.clone(),
            access: self.access.clone(),
            bus: self.bus.clone(),
            adapters: self.adapters.clone(),
            config: self.config.clone(),
            queue: self.queue.clone(),
            uploads: self.uploads.clone(),
        }
    }

    fn spawn_queues(self: &Arc<Self>) {
        self.spawn_one(Stage::Fetch, Arc::new(FetchRunner));
        self.spawn_one(Stage::Analyze, Arc::new(AnalyzeRunner));
        self.spawn_one(Stage::Extract, Arc::new(ExtractRunner));
        self.spawn_one(Stage::PostExtract, Arc::new(PostExtractRunner));
    }

    fn spawn_one(self: &Arc<Self>, stage: Stage, runner: Arc<dyn crate::runners::StageRunner>) {
        let engine = self.clone();
        let concurrency = engine.config.max_concurrency(stage);
        engine.queue.clone().spawn_stage(stage, concurrency, move |job, cancel| {
            let engine = engine.clone();
            let runner = runner.clone();
            async move {
                engine.run_job(job, cancel, runner).await;
            }
        });
    }

    /// Common PREPARING/WORKING/COMMITTING bookkeeping shared by every
    /// stage: resource-slot acquisition, Enqueued/Started/terminal event
    /// emission, job-history persistence and auto-enqueue of the dependent
    /// stage. The stage-specific algorithm lives entirely in `runner`.
    async fn run_job(self: &Arc<Self>, job: Job, cancel: tokio_util::sync::CancellationToken, runner: Arc<dyn crate::runners::StageRunner>) {
        let started_at = chrono::Utc::now();
        self.bus
            .publish_to_user(job.claimant_user_id.clone(), Self::event(&job, ProgressEventBody::Started))
            .await;

        let semaphore = self.queue.resource_semaphore(job.resource_tag);
        let permit = match semaphore.acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                self.finish(&job, started_at, StageOutcome::Failed(ClassifiedError::new(
                    ErrorKind::OutOfResource,
                    "resource pool closed",
                )))
                .await;
                return;
            }
        };

        let ctx = self.runner_context();
        let outcome = self.run_with_timeout(&job, &cancel, runner, &ctx).await;
        drop(permit);
        self.queue.forget(job.job_id);

        self.finish(&job, started_at, outcome).await;
    }

    async fn run_with_timeout(
        self: &Arc<Self>,
        job: &Job,
        cancel: &tokio_util::sync::CancellationToken,
        runner: Arc<dyn crate::runners::StageRunner>,
        ctx: &RunnerContext,
    ) -> StageOutcome {
        let timeout = self.config.stage_timeout(job.stage);
        let job_clone = job.clone();
        let cancel_clone = cancel.clone();
        let ctx_clone = ctx.clone();

        let handle = tokio::spawn(async move { runner.run(&job_clone, &cancel_clone, &ctx_clone).await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_join_error)) => StageOutcome::Failed(ClassifiedError::new(
                ErrorKind::StorageFailure,
                "stage runner task panicked",
            )),
            Err(_elapsed) => {
                // Trips the token so the still-running task (left detached,
                // not aborted) can observe cancellation at its next poll
                // point and resolve its own dedup claim; this job is
                // reported failed immediately rather than waiting for that.
                cancel.cancel();
                StageOutcome::Failed(ClassifiedError::new(ErrorKind::Timeout, "stage exceeded its configured timeout"))
            }
        }
    }

    async fn finish(self: &Arc<Self>, job: &Job, started_at: chrono::DateTime<chrono::Utc>, outcome: StageOutcome) {
        let ended_at = chrono::Utc::now();
        let (persisted, error_kind, brief_message) = match &outcome {
            StageOutcome::Produced(_) | StageOutcome::Reused(_) => (PersistedJobState::Succeeded, None, None),
            StageOutcome::Failed(err) => (PersistedJobState::Failed, Some(err.kind), Some(err.brief_message.clone())),
            StageOutcome::Cancelled => (PersistedJobState::Cancelled, Some(ErrorKind::Cancelled), None),
        };

        let _ = self
            .store
            .record_job_history(JobHistoryRecord {
                job_id: job.job_id,
                source_id: job.source_id.clone(),
                stage: job.stage,
                outcome: persisted,
                error_kind,
                brief_message,
                started_at,
                ended_at,
            })
            .await;
        self.job_owners
            .lock()
            .expect("job owners lock poisoned")
            .remove(&job.job_id);

        match outcome {
            StageOutcome::Produced(record) => {
                self.publish_completion(job, &record).await;
                self.auto_enqueue_next(job, &record).await;
            }
            StageOutcome::Reused(record) => {
                self.publish_completion(job, &record).await;
            }
            StageOutcome::Failed(err) => {
                self.bus
                    .publish_to_user(
                        job.claimant_user_id.clone(),
                        Self::event(
                            job,
                            ProgressEventBody::Failed {
                                error_kind: err.kind,
                                message: err.brief_message,
                            },
                        ),
                    )
                    .await;
            }
            StageOutcome::Cancelled => {
                self.bus
                    .publish_to_user(job.claimant_user_id.clone(), Self::event(job, ProgressEventBody::Cancelled))
                    .await;
            }
        }
    }

    async fn publish_completion(self: &Arc<Self>, job: &Job, record: &ArtifactRecord) {
        let summary = crate::runners::artifact_summary(record);
        let grantees = self.access.grantees(&job.source_id).await.unwrap_or_default();
        self.bus
            .publish_to_users(
                &grantees,
                Self::event(job, ProgressEventBody::Completed { artifact_summary: summary }),
            )
            .await;
        self.bus
            .publish_global(ProgressEvent {
                job_id: None,
                source_id: job.source_id.clone(),
                user_id: None,
                stage: None,
                body: ProgressEventBody::GlobalArtifactReady {
                    source_id: job.source_id.clone(),
                },
                timestamp: chrono::Utc::now(),
            })
            .await;
    }

    /// Only a stage that actually produced fresh output enqueues the
    /// dependent stage — a deduplicated `Reused` result must not trigger a
    /// redundant follow-on job for every subscriber (§4.5.5's distinction).
    ///
    /// Routed through `emit_enqueued`, exactly like the `request_*` control
    /// surface methods, so the auto-enqueued job's owner is registered and
    /// its `Enqueued` event is published — §8 scenario 2's ordered sequence
    /// depends on `Enqueued(analyze)` actually firing after `Completed(fetch)`.
    async fn auto_enqueue_next(self: &Arc<Self>, job: &Job, _record: &ArtifactRecord) {
        match job.stage {
            Stage::Fetch => {
                let next = Job::new(
                    job.source_id.clone(),
                    Stage::Analyze,
                    job.claimant_user_id.clone(),
                    ResourceTag::Cpu,
                    JobParameters::default(),
                );
                self.emit_enqueued(&next).await;
                self.queue.enqueue(next);
            }
            Stage::Extract => {
                let next = Job::new(
                    job.source_id.clone(),
                    Stage::PostExtract,
                    job.claimant_user_id.clone(),
                    ResourceTag::Cpu,
                    job.parameters.clone(),
                );
                self.emit_enqueued(&next).await;
                self.queue.enqueue(next);
            }
            Stage::Analyze | Stage::PostExtract => {}
        }
    }

    fn event(job: &Job, body: ProgressEventBody) -> ProgressEvent {
        ProgressEvent {
            job_id: Some(job.job_id),
            source_id: job.source_id.clone(),
            user_id: Some(job.claimant_user_id.clone()),
            stage: Some(job.stage),
            body,
            timestamp: chrono::Utc::now(),
        }
    }

    // ---- Control surface, §6 ----

    pub async fn search_sources(&self, query: &str) -> Result<Vec<SourceSummary>> {
        self.adapters.source_fetcher.search(query).await
    }

    pub async fn request_fetch(&self, user_id: &str, source_id: &str) -> Result<RequestOutcome> {
        if let Some(record) = self.store.get_record(source_id).await? {
            if record.audio_blob_ref.is_some() {
                self.access.grant(user_id, source_id).await?;
                return Ok(RequestOutcome::AlreadyDone {
                    record: Box::new(record),
                });
            }
        }
        let job = Job::new(
            source_id,
            Stage::Fetch,
            user_id,
            ResourceTag::Cpu,
            JobParameters {
                source_url: Some(source_id.to_string()),
                ..Default::default()
            },
        );
        let job_id = job.job_id;
        self.emit_enqueued(&job).await;
        self.queue.enqueue(job);
        Ok(RequestOutcome::Accepted { job_id })
    }

    /// Stages `bytes` under a freshly minted upload token and enqueues a
    /// Fetch job carrying only that token, per the runner's "uploads never
    /// travel inside `Job`" design.
    pub async fn request_upload(
        &self,
        user_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<RequestOutcome> {
        if bytes.len() as u64 > self.config.upload_max_bytes {
            return Err(chorus_common::Error::InvalidInput(format!(
                "upload of {} bytes exceeds the configured maximum of {} bytes",
                bytes.len(),
                self.config.upload_max_bytes
            )));
        }
        let source_id = format!("u_{}", Uuid::new_v4().simple());
        let token = Uuid::new_v4().to_string();
        let ext = filename.rsplit('.').next().unwrap_or("wav").to_string();
        self.uploads.lock().await.insert(token.clone(), (bytes, ext));

        let job = Job::new(
            source_id.clone(),
            Stage::Fetch,
            user_id,
            ResourceTag::Cpu,
            JobParameters {
                upload_token: Some(token),
                upload_filename: Some(filename.to_string()),
                ..Default::default()
            },
        );
        let job_id = job.job_id;
        self.emit_enqueued(&job).await;
        self.queue.enqueue(job);
        Ok(RequestOutcome::Accepted { job_id })
    }

    pub async fn request_extract(
        &self,
        user_id: &str,
        source_id: &str,
        model_id: &str,
        stems: Vec<StemName>,
    ) -> Result<RequestOutcome> {
        if !self.config.allowed_separator_models.iter().any(|m| m == model_id) {
            return Err(chorus_common::Error::InvalidInput(format!(
                "model_id {model_id} is not in the configured allow-list"
            )));
        }
        if self.store.extraction_complete(source_id, model_id).await? {
            let record = self
                .store
                .get_record(source_id)
                .await?
                .expect("extraction_complete implies a record exists");
            self.access.grant(user_id, source_id).await?;
            return Ok(RequestOutcome::AlreadyDone {
                record: Box::new(record),
            });
        }

        let resource_tag = if self.config.prefer_gpu && self.config.gpu_slots > 0 {
            ResourceTag::Gpu
        } else {
            ResourceTag::Cpu
        };
        let job = Job::new(
            source_id,
            Stage::Extract,
            user_id,
            resource_tag,
            JobParameters {
                model_id: Some(model_id.to_string()),
                requested_stems: stems,
                ..Default::default()
            },
        );
        let job_id = job.job_id;
        self.emit_enqueued(&job).await;
        self.queue.enqueue(job);
        Ok(RequestOutcome::Accepted { job_id })
    }

    pub async fn request_regenerate_chords(&self, user_id: &str, source_id: &str, backend: Option<String>) -> JobId {
        let job = Job::new(
            source_id,
            Stage::Analyze,
            user_id,
            ResourceTag::Cpu,
            JobParameters {
                chord_backend_override: backend,
                ..Default::default()
            },
        );
        let job_id = job.job_id;
        self.emit_enqueued(&job).await;
        self.queue.enqueue(job);
        job_id
    }

    pub async fn request_generate_lyrics(&self, user_id: &str, source_id: &str) -> JobId {
        let job = Job::new(source_id, Stage::PostExtract, user_id, ResourceTag::Cpu, JobParameters::default());
        let job_id = job.job_id;
        self.emit_enqueued(&job).await;
        self.queue.enqueue(job);
        job_id
    }

    /// `NotOwner` is reported whenever the caller did not initiate the job;
    /// the Job Queue itself has no notion of ownership, so that check
    /// happens here against `job_owners`, populated when the job was
    /// enqueued and cleared once it reaches a terminal state.
    pub async fn cancel(&self, user_id: &str, job_id: JobId) -> Result<CancelOutcome> {
        let owner = self
            .job_owners
            .lock()
            .expect("job owners lock poisoned")
            .get(&job_id)
            .cloned();
        match owner {
            None => Ok(CancelOutcome::NotFound),
            Some(owner) if owner != user_id => Ok(CancelOutcome::NotOwner),
            Some(_) => Ok(if self.queue.cancel(job_id) {
                CancelOutcome::Cancelled
            } else {
                CancelOutcome::NotFound
            }),
        }
    }

    pub async fn list_for_user(&self, user_id: &str, role: Role) -> Result<Vec<crate::access::RecordView>> {
        self.access.list_for_user(user_id, role).await
    }

    pub async fn subscribe(
        &self,
        user_id: &str,
    ) -> (Vec<ProgressEvent>, tokio::sync::broadcast::Receiver<ProgressEvent>) {
        self.bus.subscribe_with_backlog(&RoomId::user(user_id)).await
    }

    pub async fn subscribe_global(
        &self,
    ) -> (Vec<ProgressEvent>, tokio::sync::broadcast::Receiver<ProgressEvent>) {
        self.bus.subscribe_with_backlog(&RoomId::Global).await
    }

    pub async fn grant(&self, user_id: &str, source_id: &str) -> Result<()> {
        self.access.grant(user_id, source_id).await
    }

    pub async fn revoke(&self, user_id: &str, source_id: &str) -> Result<()> {
        self.access.revoke(user_id, source_id).await
    }

    /// Admin-only cascade per §4.1: delete the record and every blob it
    /// owns, then revoke every grant that referenced it, so no dangling
    /// grant can later resolve to a record that no longer exists.
    pub async fn delete_record(&self, source_id: &str) -> Result<()> {
        self.store.delete_record(source_id).await?;
        self.access.revoke_all_for_source(source_id).await
    }

    async fn emit_enqueued(&self, job: &Job) {
        self.job_owners
            .lock()
            .expect("job owners lock poisoned")
            .insert(job.job_id, job.claimant_user_id.clone());
        self.bus
            .publish_to_user(job.claimant_user_id.clone(), Self::event(job, ProgressEventBody::Enqueued))
            .await;
    }
}
