use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::JobResult;
use crate::models::{Job, JobHistory, JobStatus, QueueHealth};

/// Repository trait for job, job-history and queue-health persistence
///
/// Writes are per-document and last-writer-wins; there is no optimistic
/// locking, so only the consumer holding a job's delivery may call `save`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job; `DuplicateJob` if the id is taken
    async fn insert(&self, job: &Job) -> JobResult<()>;

    /// Get a job by id
    async fn find(&self, job_id: &str) -> JobResult<Option<Job>>;

    /// Replace an existing job; `NotFound` if it does not exist
    async fn save(&self, job: &Job) -> JobResult<()>;

    /// Append an audit row
    async fn append_history(&self, entry: &JobHistory) -> JobResult<()>;

    /// Audit rows for a job, oldest first
    async fn history(&self, job_id: &str) -> JobResult<Vec<JobHistory>>;

    /// Count jobs in a physical queue with the given status
    async fn count_by_status(&self, queue_name: &str, status: JobStatus) -> JobResult<u64>;

    /// Count queued jobs whose delay has not elapsed at `now`
    async fn count_delayed(&self, queue_name: &str, now: DateTime<Utc>) -> JobResult<u64>;

    /// Jobs that reached a terminal state at or after `since`
    async fn finished_since(&self, queue_name: &str, since: DateTime<Utc>) -> JobResult<Vec<Job>>;

    /// Persist a health snapshot
    async fn record_health(&self, health: &QueueHealth) -> JobResult<()>;

    /// Most recent health snapshot for a queue
    async fn latest_health(&self, queue_name: &str) -> JobResult<Option<QueueHealth>>;
}
