//! MongoDB implementation of JobRepository
//!
//! Three collections: `jobs` (one document per job, unique on `jobId`),
//! `job_history` (append-only) and `queue_health` (snapshots). Timestamps
//! are stored as BSON dates so range filters use the indexes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneOptions, FindOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::error::{JobError, JobResult};
use crate::models::{
    HistoryEvent, Job, JobHistory, JobMetadata, JobProgress, JobStatus, JobType, Priority,
    QueueHealth, QueueHealthMetrics,
};
use crate::repository::JobRepository;

const DUPLICATE_KEY: i32 = 11000;

fn to_bson_date(dt: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(dt.timestamp_millis())
}

fn from_bson_date(dt: bson::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or_default()
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDocument {
    job_id: String,
    job_type: JobType,
    queue_name: String,
    routing_key: String,
    user_id: String,
    workspace_id: String,
    data: Value,
    status: JobStatus,
    progress: JobProgress,
    attempts: u32,
    max_attempts: u32,
    priority: Priority,
    result: Option<Value>,
    last_error: Option<String>,
    created_at: bson::DateTime,
    /// `createdAt + delay`, for delayed counts
    available_at: bson::DateTime,
    started_at: Option<bson::DateTime>,
    completed_at: Option<bson::DateTime>,
    queue_wait_time_ms: Option<i64>,
    processing_time_ms: Option<i64>,
    metadata: JobMetadata,
}

impl From<&Job> for JobDocument {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            queue_name: job.queue_name.clone(),
            routing_key: job.routing_key.clone(),
            user_id: job.user_id.clone(),
            workspace_id: job.workspace_id.clone(),
            data: job.data.clone(),
            status: job.status,
            progress: job.progress.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            priority: job.priority,
            result: job.result.clone(),
            last_error: job.last_error.clone(),
            created_at: to_bson_date(job.created_at),
            available_at: to_bson_date(job.available_at()),
            started_at: job.started_at.map(to_bson_date),
            completed_at: job.completed_at.map(to_bson_date),
            queue_wait_time_ms: job.queue_wait_time_ms,
            processing_time_ms: job.processing_time_ms,
            metadata: job.metadata.clone(),
        }
    }
}

impl From<JobDocument> for Job {
    fn from(doc: JobDocument) -> Self {
        Self {
            job_id: doc.job_id,
            job_type: doc.job_type,
            queue_name: doc.queue_name,
            routing_key: doc.routing_key,
            user_id: doc.user_id,
            workspace_id: doc.workspace_id,
            data: doc.data,
            status: doc.status,
            progress: doc.progress,
            attempts: doc.attempts,
            max_attempts: doc.max_attempts,
            priority: doc.priority,
            result: doc.result,
            last_error: doc.last_error,
            created_at: from_bson_date(doc.created_at),
            started_at: doc.started_at.map(from_bson_date),
            completed_at: doc.completed_at.map(from_bson_date),
            queue_wait_time_ms: doc.queue_wait_time_ms,
            processing_time_ms: doc.processing_time_ms,
            metadata: doc.metadata,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDocument {
    job_id: String,
    event: HistoryEvent,
    timestamp: bson::DateTime,
    attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl From<&JobHistory> for HistoryDocument {
    fn from(entry: &JobHistory) -> Self {
        Self {
            job_id: entry.job_id.clone(),
            event: entry.event,
            timestamp: to_bson_date(entry.timestamp),
            attempt: entry.attempt,
            progress: entry.progress,
            message: entry.message.clone(),
            data: entry.data.clone(),
        }
    }
}

impl From<HistoryDocument> for JobHistory {
    fn from(doc: HistoryDocument) -> Self {
        Self {
            job_id: doc.job_id,
            event: doc.event,
            timestamp: from_bson_date(doc.timestamp),
            attempt: doc.attempt,
            progress: doc.progress,
            message: doc.message,
            data: doc.data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthDocument {
    queue_name: String,
    is_healthy: bool,
    metrics: QueueHealthMetrics,
    timestamp: bson::DateTime,
}

impl From<&QueueHealth> for HealthDocument {
    fn from(health: &QueueHealth) -> Self {
        Self {
            queue_name: health.queue_name.clone(),
            is_healthy: health.is_healthy,
            metrics: health.metrics.clone(),
            timestamp: to_bson_date(health.timestamp),
        }
    }
}

impl From<HealthDocument> for QueueHealth {
    fn from(doc: HealthDocument) -> Self {
        Self {
            queue_name: doc.queue_name,
            is_healthy: doc.is_healthy,
            metrics: doc.metrics,
            timestamp: from_bson_date(doc.timestamp),
        }
    }
}

/// MongoDB-backed job store
#[derive(Clone)]
pub struct MongoJobRepository {
    jobs: Collection<JobDocument>,
    history: Collection<HistoryDocument>,
    health: Collection<HealthDocument>,
}

impl MongoJobRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            jobs: db.collection("jobs"),
            history: db.collection("job_history"),
            health: db.collection("queue_health"),
        }
    }

    /// Create indexes. Must run before the first insert so `jobId`
    /// uniqueness is enforced.
    pub async fn init_indexes(&self) -> JobResult<()> {
        let job_indexes = vec![
            IndexModel::builder()
                .keys(doc! { "jobId": 1 })
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .name("idx_job_id_unique".to_string())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "queueName": 1, "status": 1 })
                .options(
                    IndexOptions::builder()
                        .name("idx_queue_status".to_string())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "queueName": 1, "completedAt": -1 })
                .options(
                    IndexOptions::builder()
                        .name("idx_queue_completed".to_string())
                        .build(),
                )
                .build(),
        ];
        self.jobs.create_indexes(job_indexes).await?;

        self.history
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "jobId": 1, "timestamp": 1 })
                    .build(),
            )
            .await?;

        self.health
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "queueName": 1, "timestamp": -1 })
                    .build(),
            )
            .await?;

        tracing::info!("Job indexes created successfully");
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MongoJobRepository {
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    async fn insert(&self, job: &Job) -> JobResult<()> {
        match self.jobs.insert_one(JobDocument::from(job)).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(JobError::DuplicateJob(job.job_id.clone())),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn find(&self, job_id: &str) -> JobResult<Option<Job>> {
        let doc = self.jobs.find_one(doc! { "jobId": job_id }).await?;
        Ok(doc.map(Job::from))
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, status = %job.status))]
    async fn save(&self, job: &Job) -> JobResult<()> {
        let result = self
            .jobs
            .replace_one(doc! { "jobId": &job.job_id }, JobDocument::from(job))
            .await?;
        if result.matched_count == 0 {
            return Err(JobError::NotFound(job.job_id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, event = %entry.event))]
    async fn append_history(&self, entry: &JobHistory) -> JobResult<()> {
        self.history.insert_one(HistoryDocument::from(entry)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn history(&self, job_id: &str) -> JobResult<Vec<JobHistory>> {
        let options = FindOptions::builder().sort(doc! { "timestamp": 1 }).build();
        let cursor = self
            .history
            .find(doc! { "jobId": job_id })
            .with_options(options)
            .await?;
        let docs: Vec<HistoryDocument> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(JobHistory::from).collect())
    }

    #[instrument(skip(self))]
    async fn count_by_status(&self, queue_name: &str, status: JobStatus) -> JobResult<u64> {
        let filter = doc! { "queueName": queue_name, "status": status.to_string() };
        Ok(self.jobs.count_documents(filter).await?)
    }

    #[instrument(skip(self))]
    async fn count_delayed(&self, queue_name: &str, now: DateTime<Utc>) -> JobResult<u64> {
        let filter = doc! {
            "queueName": queue_name,
            "status": JobStatus::Queued.to_string(),
            "availableAt": { "$gt": Bson::DateTime(to_bson_date(now)) },
        };
        Ok(self.jobs.count_documents(filter).await?)
    }

    #[instrument(skip(self))]
    async fn finished_since(&self, queue_name: &str, since: DateTime<Utc>) -> JobResult<Vec<Job>> {
        let filter = doc! {
            "queueName": queue_name,
            "status": { "$in": [JobStatus::Completed.to_string(), JobStatus::Failed.to_string()] },
            "completedAt": { "$gte": Bson::DateTime(to_bson_date(since)) },
        };
        let cursor = self.jobs.find(filter).await?;
        let docs: Vec<JobDocument> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(Job::from).collect())
    }

    #[instrument(skip(self, health), fields(queue = %health.queue_name))]
    async fn record_health(&self, health: &QueueHealth) -> JobResult<()> {
        self.health.insert_one(HealthDocument::from(health)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest_health(&self, queue_name: &str) -> JobResult<Option<QueueHealth>> {
        let options = FindOneOptions::builder().sort(doc! { "timestamp": -1 }).build();
        let doc = self
            .health
            .find_one(doc! { "queueName": queue_name })
            .with_options(options)
            .await?;
        Ok(doc.map(QueueHealth::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_keeps_available_at() {
        let created_at: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        let job = Job {
            job_id: "job-1".into(),
            job_type: JobType::ProductSync,
            queue_name: "sync.products".into(),
            routing_key: "sync.products.normal".into(),
            user_id: "u1".into(),
            workspace_id: "w1".into(),
            data: json!({"userId": "u1", "workspaceId": "w1"}),
            status: JobStatus::Queued,
            progress: JobProgress::default(),
            attempts: 0,
            max_attempts: 3,
            priority: Priority::Normal,
            result: None,
            last_error: None,
            created_at,
            started_at: None,
            completed_at: None,
            queue_wait_time_ms: None,
            processing_time_ms: None,
            metadata: JobMetadata {
                queue_alias: "sync-products".into(),
                delay_ms: Some(60_000),
                ..Default::default()
            },
        };

        let doc = JobDocument::from(&job);
        assert_eq!(
            doc.available_at.timestamp_millis() - doc.created_at.timestamp_millis(),
            60_000
        );

        let encoded = bson::to_document(&doc).unwrap();
        assert!(encoded.get_datetime("createdAt").is_ok());
        assert_eq!(encoded.get_str("status").unwrap(), "queued");

        let decoded: JobDocument = bson::from_document(encoded).unwrap();
        assert_eq!(Job::from(decoded), job);
    }
}
