//! Message body published for every job.
//!
//! ```json
//! {
//!   "jobId": "…",
//!   "jobType": "MARKETPLACE_SYNC",
//!   "data": { "userId": "u1", "workspaceId": "w1" },
//!   "metadata": { "attempts": 0, "priority": "HIGH", "createdAt": "…", "workspaceId": "w1" },
//!   "progress": 0
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Job, JobType, Priority};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub attempts: u32,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    pub workspace_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub job_id: String,
    pub job_type: JobType,
    pub data: Value,
    pub metadata: EnvelopeMetadata,
    #[serde(default)]
    pub progress: f64,
}

impl JobEnvelope {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            data: job.data.clone(),
            metadata: EnvelopeMetadata {
                attempts: job.attempts,
                priority: job.priority,
                created_at: job.created_at,
                parent_job_id: job.metadata.parent_job_id.clone(),
                workspace_id: job.workspace_id.clone(),
            },
            progress: job.progress.value(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
