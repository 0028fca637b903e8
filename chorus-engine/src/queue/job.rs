//! The unit of work the Job Queue schedules and Stage Runners execute.

use crate::models::StemName;
use chorus_common::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// Which bounded compute pool a job needs before it can enter `WORKING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTag {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Stage-specific inputs. Most fields are only meaningful for one stage;
/// unused fields stay `None`/empty rather than splitting into per-stage
/// structs, since a `Job` only ever travels through one queue at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParameters {
    pub model_id: Option<String>,
    pub requested_stems: Vec<StemName>,
    pub chord_backend_override: Option<String>,
    pub upload_token: Option<String>,
    pub upload_filename: Option<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub source_id: String,
    pub stage: Stage,
    pub claimant_user_id: String,
    pub resource_tag: ResourceTag,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        source_id: impl Into<String>,
        stage: Stage,
        claimant_user_id: impl Into<String>,
        resource_tag: ResourceTag,
        parameters: JobParameters,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source_id: source_id.into(),
            stage,
            claimant_user_id: claimant_user_id.into(),
            resource_tag,
            parameters,
            created_at: Utc::now(),
        }
    }
}
