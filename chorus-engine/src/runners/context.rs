//! Collaborators a [`super::StageRunner`] needs, bundled once and passed by
//! reference — never re-fetched from a global, mirroring the way the
//! teacher's orchestrators thread `&self.db` / `&self.event_tx` through
//! their phase methods rather than reaching for a singleton.

use crate::access::AccessView;
use crate::adapters::AdapterRegistry;
use crate::dedup::DedupIndex;
use crate::queue::JobQueue;
use crate::store::ArtifactStore;
use chorus_common::ProgressBus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Bytes staged by `request_upload` before the Fetch job is enqueued,
/// keyed by the one-shot upload token carried in `JobParameters`. The
/// Fetch Runner removes its entry on pickup, so a token is consumed
/// exactly once.
pub type UploadStaging = Arc<Mutex<HashMap<String, (Vec<u8>, String)>>>;

#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<ArtifactStore>,
    pub dedup: Arc<DedupIndex>,
    pub access: Arc<AccessView>,
    pub bus: ProgressBus,
    pub adapters: Arc<AdapterRegistry>,
    pub config: Arc<crate::config::EngineConfig>,
    pub queue: Arc<JobQueue>,
    pub uploads: UploadStaging,
}
