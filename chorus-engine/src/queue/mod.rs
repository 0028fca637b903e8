//! Job Queue: bounded-concurrency FIFO queues per stage with resource-tag
//! admission control and cooperative cancellation, §4.4.
//!
//! Per-stage FIFO is a `tokio::sync::mpsc::unbounded_channel<Job>` drained
//! by a fixed pool of worker tasks spawned once at startup, the teacher's
//! "pool of workers sized by config" idiom realized with long-lived
//! `tokio::spawn` loops rather than one task per job.

mod job;

pub use job::{Job, JobId, JobParameters, JobState, ResourceTag};

use chorus_common::Stage;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// Scheduling authority for the whole engine: one FIFO per stage, two
/// resource-tag semaphores (`cpu`, `gpu`), and the cancellation-token map
/// `cancel()` consults.
pub struct JobQueue {
    senders: StdMutex<HashMap<Stage, mpsc::UnboundedSender<Job>>>,
    cancellations: StdMutex<HashMap<JobId, CancellationToken>>,
    cpu_slots: Arc<Semaphore>,
    gpu_slots: Arc<Semaphore>,
}

impl JobQueue {
    /// `gpu_slots = 0` is the expected configuration when no GPU is
    /// available: acquiring a GPU permit then simply never succeeds,
    /// which is the natural `out_of_resource` trigger.
    pub fn new(cpu_slots: usize, gpu_slots: usize) -> Arc<Self> {
        Arc::new(Self {
            senders: StdMutex::new(HashMap::new()),
            cancellations: StdMutex::new(HashMap::new()),
            cpu_slots: Arc::new(Semaphore::new(cpu_slots)),
            gpu_slots: Arc::new(Semaphore::new(gpu_slots)),
        })
    }

    pub fn resource_semaphore(&self, tag: ResourceTag) -> Arc<Semaphore> {
        match tag {
            ResourceTag::Cpu => self.cpu_slots.clone(),
            ResourceTag::Gpu => self.gpu_slots.clone(),
        }
    }

    /// Spawns `concurrency` long-lived worker tasks draining `stage`'s
    /// queue, each invoking `handler(job, cancel_token)`. Must be called
    /// once per stage before `enqueue` targets it.
    pub fn spawn_stage<F, Fut>(self: &Arc<Self>, stage: Stage, concurrency: usize, handler: F)
    where
        F: Fn(Job, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        self.senders.lock().expect("job queue lock poisoned").insert(stage, tx);

        let rx = Arc::new(AsyncMutex::new(rx));
        let handler = Arc::new(handler);
        let queue = self.clone();

        for worker_index in 0..concurrency.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else {
                        tracing::debug!(?stage, worker_index, "worker channel closed");
                        break;
                    };
                    let token = queue.token_for(job.job_id);
                    handler(job, token).await;
                }
            });
        }
    }

    /// Enqueues `job`, registering a fresh cancellation token. Fails
    /// silently (returns `false`) only if `spawn_stage` was never called
    /// for this job's stage — a programming error, not a runtime one.
    pub fn enqueue(&self, job: Job) -> bool {
        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .expect("job queue lock poisoned")
            .insert(job.job_id, token);

        let senders = self.senders.lock().expect("job queue lock poisoned");
        match senders.get(&job.stage) {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    fn token_for(&self, job_id: JobId) -> CancellationToken {
        self.cancellations
            .lock()
            .expect("job queue lock poisoned")
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// A `queued` job cancels synchronously by tripping its token before
    /// a worker ever picks it up; a `running` job's runner observes the
    /// same token at its next poll point. Returns `false` if no such job
    /// is known (already completed or never enqueued).
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self
            .cancellations
            .lock()
            .expect("job queue lock poisoned")
            .get(&job_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops the bookkeeping for a job once its runner has reached a
    /// terminal state, so the cancellation map does not grow unbounded.
    pub fn forget(&self, job_id: JobId) {
        self.cancellations
            .lock()
            .expect("job queue lock poisoned")
            .remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn enqueued_jobs_run_in_fifo_order() {
        let queue = JobQueue::new(4, 0);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let observed = order.clone();

        queue.spawn_stage(Stage::Fetch, 1, move |job, _token| {
            let observed = observed.clone();
            async move {
                observed.lock().unwrap().push(job.source_id.clone());
            }
        });

        for id in ["a", "b", "c"] {
            queue.enqueue(Job::new(
                id,
                Stage::Fetch,
                "u_alice",
                ResourceTag::Cpu,
                JobParameters::default(),
            ));
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancel_trips_the_jobs_token() {
        let queue = JobQueue::new(4, 0);
        let cancelled_count = Arc::new(AtomicUsize::new(0));
        let counter = cancelled_count.clone();

        queue.spawn_stage(Stage::Fetch, 1, move |_job, token| {
            let counter = counter.clone();
            async move {
                token.cancelled().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let job = Job::new(
            "xA1B2c",
            Stage::Fetch,
            "u_alice",
            ResourceTag::Cpu,
            JobParameters::default(),
        );
        let job_id = job.job_id;
        queue.enqueue(job);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(queue.cancel(job_id));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(cancelled_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gpu_slots_zero_means_acquire_never_succeeds_immediately() {
        let queue = JobQueue::new(1, 0);
        let gpu = queue.resource_semaphore(ResourceTag::Gpu);
        assert!(gpu.try_acquire().is_err());
    }
}
