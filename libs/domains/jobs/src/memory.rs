use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{JobError, JobResult};
use crate::models::{Job, JobHistory, JobStatus, QueueHealth};
use crate::repository::JobRepository;

/// In-process job store for tests and broker-less local runs
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<String, Job>>,
    history: RwLock<Vec<JobHistory>>,
    health: RwLock<Vec<QueueHealth>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &Job) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(JobError::DuplicateJob(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn find(&self, job_id: &str) -> JobResult<Option<Job>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn save(&self, job: &Job) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.job_id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(JobError::NotFound(job.job_id.clone())),
        }
    }

    async fn append_history(&self, entry: &JobHistory) -> JobResult<()> {
        self.history.write().await.push(entry.clone());
        Ok(())
    }

    async fn history(&self, job_id: &str) -> JobResult<Vec<JobHistory>> {
        Ok(self
            .history
            .read()
            .await
            .iter()
            .filter(|h| h.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, queue_name: &str, status: JobStatus) -> JobResult<u64> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.queue_name == queue_name && j.status == status)
            .count() as u64)
    }

    async fn count_delayed(&self, queue_name: &str, now: DateTime<Utc>) -> JobResult<u64> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.queue_name == queue_name && j.is_delayed(now))
            .count() as u64)
    }

    async fn finished_since(&self, queue_name: &str, since: DateTime<Utc>) -> JobResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| {
                j.queue_name == queue_name
                    && j.status.is_terminal()
                    && j.completed_at.is_some_and(|at| at >= since)
            })
            .cloned()
            .collect())
    }

    async fn record_health(&self, health: &QueueHealth) -> JobResult<()> {
        self.health.write().await.push(health.clone());
        Ok(())
    }

    async fn latest_health(&self, queue_name: &str) -> JobResult<Option<QueueHealth>> {
        Ok(self
            .health
            .read()
            .await
            .iter()
            .filter(|h| h.queue_name == queue_name)
            .max_by_key(|h| h.timestamp)
            .cloned())
    }
}
