//! Job queue service: the entry point calling modules use.

use amqp_worker::{AmqpError, ConnectionManager};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::consumer::ConsumerRegistry;
use crate::error::{JobError, JobResult};
use crate::health::QueueHealthMonitor;
use crate::models::{
    JobHandle, JobHistory, JobStatusView, JobType, QueueHealth, QueueStatsView, SubmitOptions,
};
use crate::processor::JobProcessor;
use crate::publisher::JobPublisher;
use crate::queues::QueueName;
use crate::repository::JobRepository;
use crate::stats::StatsReporter;
use crate::transitions;

/// Job queue service
///
/// Wires one `ConnectionManager` and one `JobRepository` into the publisher,
/// consumer registry, stats reporter and health monitor. Cheap to share
/// behind an `Arc`.
pub struct JobQueue {
    connection: ConnectionManager,
    repository: Arc<dyn JobRepository>,
    publisher: JobPublisher,
    consumers: ConsumerRegistry,
    stats: StatsReporter,
    health: QueueHealthMonitor,
}

impl JobQueue {
    pub fn new(connection: ConnectionManager, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            publisher: JobPublisher::new(connection.clone(), repository.clone()),
            consumers: ConsumerRegistry::new(connection.clone(), repository.clone()),
            stats: StatsReporter::new(repository.clone()),
            health: QueueHealthMonitor::new(repository.clone(), connection.clone()),
            connection,
            repository,
        }
    }

    /// Connect to the broker. A failure leaves the queue in degraded mode
    /// (reconnecting in the background) and is returned for logging only.
    pub async fn initialize(&self) -> Result<(), AmqpError> {
        self.connection.initialize().await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn health_monitor(&self) -> &QueueHealthMonitor {
        &self.health
    }

    #[instrument(skip(self, payload, options), fields(queue = %alias, job_type = %job_type))]
    pub async fn submit(
        &self,
        alias: &str,
        job_type: JobType,
        payload: Value,
        options: SubmitOptions,
    ) -> JobResult<JobHandle> {
        self.publisher.submit(alias, job_type, payload, options).await
    }

    /// `None` for an unknown id. Store errors are logged and also reported
    /// as `None`.
    #[instrument(skip(self))]
    pub async fn status(&self, job_id: &str) -> Option<JobStatusView> {
        match self.repository.find(job_id).await {
            Ok(job) => job.as_ref().map(JobStatusView::from),
            Err(e) => {
                warn!(job_id, error = %e, "Status lookup failed");
                None
            }
        }
    }

    pub async fn stats(&self, alias: &str) -> QueueStatsView {
        self.stats.stats(alias).await
    }

    pub async fn all_stats(&self) -> Vec<(&'static str, QueueStatsView)> {
        self.stats.all().await
    }

    /// Messages the broker holds ready for `alias`. `None` for an unknown
    /// alias, in degraded mode, or when the broker query fails.
    pub async fn broker_depth(&self, alias: &str) -> Option<u32> {
        let queue = QueueName::lookup(alias)?;
        let channel = self.connection.channel()?;
        match channel.message_count(queue.physical()).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(queue = %queue.physical(), error = %e, "Queue depth lookup failed");
                None
            }
        }
    }

    #[instrument(skip(self, processor), fields(processor = processor.name()))]
    pub fn register_processor(
        &self,
        alias: &str,
        job_type: JobType,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
    ) -> JobResult<Vec<String>> {
        self.consumers
            .register_processor(alias, job_type, concurrency, processor)
    }

    pub fn consumer_tags(&self, alias: &str) -> Vec<String> {
        self.consumers.consumer_tags(alias)
    }

    pub async fn pause_queue(&self, alias: &str) -> JobResult<usize> {
        self.consumers.pause(alias).await
    }

    /// Finish a job a processor left `processing` with `AwaitingChildren`
    #[instrument(skip(self, outcome))]
    pub async fn resolve_pending(
        &self,
        job_id: &str,
        outcome: Result<Value, String>,
    ) -> JobResult<JobStatusView> {
        let mut job = self
            .repository
            .find(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let entry = transitions::resolve(&mut job, outcome, Utc::now())?;
        self.repository.save(&job).await?;
        self.repository.append_history(&entry).await?;

        info!(job_id, status = %job.status, "Pending job resolved");
        Ok(JobStatusView::from(&job))
    }

    pub async fn history(&self, job_id: &str) -> JobResult<Vec<JobHistory>> {
        self.repository.history(job_id).await
    }

    pub async fn latest_health(&self, alias: &str) -> JobResult<Option<QueueHealth>> {
        let queue =
            QueueName::lookup(alias).ok_or_else(|| JobError::UnknownQueue(alias.to_string()))?;
        self.repository.latest_health(queue.physical()).await
    }

    /// Stop consumers (letting in-flight deliveries finish), then close the
    /// broker connection.
    pub async fn shutdown(&self) {
        self.consumers.shutdown().await;
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJobRepository;
    use crate::models::{HistoryEvent, JobStatus};
    use crate::processor::{JobContext, ProcessOutcome, processor_fn};
    use crate::repository::MockJobRepository;
    use crate::test_support::{connected, payload};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_status_unknown_is_none() {
        let (manager, _broker) = connected().await;
        let queue = JobQueue::new(manager, Arc::new(InMemoryJobRepository::new()));
        assert!(queue.status("nonexistent-id").await.is_none());
    }

    #[tokio::test]
    async fn test_broker_depth() {
        let (manager, _broker) = connected().await;
        let queue = JobQueue::new(manager, Arc::new(InMemoryJobRepository::new()));
        assert_eq!(queue.broker_depth("ai-scan").await, Some(0));
        queue
            .submit("ai-scan", JobType::AiProductScan, payload(), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(queue.broker_depth("ai-scan").await, Some(1));
        assert_eq!(queue.broker_depth("nope").await, None);

        let broker = amqp_worker::InMemoryBroker::new();
        let degraded = JobQueue::new(
            crate::test_support::disconnected(&broker),
            Arc::new(InMemoryJobRepository::new()),
        );
        assert_eq!(degraded.broker_depth("ai-scan").await, None);
    }

    #[tokio::test]
    async fn test_status_store_error_is_none() {
        let (manager, _broker) = connected().await;
        let mut repo = MockJobRepository::new();
        repo.expect_find()
            .returning(|_| Err(JobError::store("timeout")));
        let queue = JobQueue::new(manager, Arc::new(repo));
        assert!(queue.status("job-1").await.is_none());
    }

    #[tokio::test]
    async fn test_batch_then_resolve() {
        let (manager, _broker) = connected().await;
        let repo = Arc::new(InMemoryJobRepository::new());
        let queue = JobQueue::new(manager, repo.clone());

        queue
            .register_processor(
                "product-batch",
                JobType::ProductBatch,
                1,
                Arc::new(processor_fn("fan-out", |_ctx: JobContext| async move {
                    Ok::<_, crate::error::ProcessingError>(ProcessOutcome::AwaitingChildren(
                        Some(json!({"children": 2})),
                    ))
                })),
            )
            .unwrap();

        let handle = queue
            .submit(
                "product-batch",
                JobType::ProductBatch,
                payload(),
                SubmitOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let history = repo.history(&handle.job_id).await.unwrap();
                if history.iter().any(|e| e.event == HistoryEvent::BatchInitiated) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let view = queue.status(&handle.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Processing);

        let view = queue
            .resolve_pending(&handle.job_id, Ok(json!({"created": 2})))
            .await
            .unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result, Some(json!({"created": 2})));

        assert!(matches!(
            queue.resolve_pending(&handle.job_id, Ok(json!(null))).await,
            Err(JobError::TerminalState { .. })
        ));
        assert!(matches!(
            queue.resolve_pending("missing", Ok(json!(null))).await,
            Err(JobError::NotFound(_))
        ));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_latest_health_unknown_queue() {
        let (manager, _broker) = connected().await;
        let queue = JobQueue::new(manager, Arc::new(InMemoryJobRepository::new()));
        assert!(matches!(
            queue.latest_health("nope").await,
            Err(JobError::UnknownQueue(_))
        ));
        assert!(queue.latest_health("ai-scan").await.unwrap().is_none());
    }
}
