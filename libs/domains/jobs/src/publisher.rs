//! Job submission
//!
//! Normal mode persists the job, writes its `created` history row and
//! publishes the envelope. With no broker channel, `submit` fails open and
//! returns a placeholder handle without touching the store or the broker.

use amqp_worker::{ConnectionManager, PublishProperties};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::envelope::JobEnvelope;
use crate::error::{JobError, JobResult};
use crate::metrics::JobMetrics;
use crate::models::{HandleKind, JobHandle, JobStatus, JobType, SubmitOptions};
use crate::queues::{self, QueueName};
use crate::repository::JobRepository;
use crate::transitions;

#[derive(Clone)]
pub struct JobPublisher {
    connection: ConnectionManager,
    repository: Arc<dyn JobRepository>,
}

impl JobPublisher {
    pub fn new(connection: ConnectionManager, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            connection,
            repository,
        }
    }

    /// Submit a job to the queue registered under `alias`.
    ///
    /// A `PublishFailure` leaves the persisted job in `queued`; the caller
    /// owns any compensation.
    #[instrument(skip(self, payload, options), fields(queue = %alias, job_type = %job_type))]
    pub async fn submit(
        &self,
        alias: &str,
        job_type: JobType,
        payload: Value,
        options: SubmitOptions,
    ) -> JobResult<JobHandle> {
        let Some(channel) = self.connection.channel() else {
            return Ok(self.placeholder(alias, &options));
        };

        let queue = queues::resolve(alias, job_type)?;
        let metrics = JobMetrics::new(queue.physical());
        if let Err(e) = options.validate() {
            metrics.job_rejected("validation");
            return Err(JobError::Validation(e.to_string()));
        }

        let job = transitions::new_job(queue, alias, job_type, payload, &options, Utc::now())
            .inspect_err(|_| metrics.job_rejected("validation"))?;
        self.repository.insert(&job).await?;
        self.repository
            .append_history(&transitions::created(&job))
            .await?;

        let body = JobEnvelope::from_job(&job).to_bytes()?;
        let mut properties = PublishProperties::persistent_json()
            .with_priority(job.priority.broker_priority())
            .with_message_id(job.job_id.clone());
        if let Some(delay) = options.delay {
            properties = properties.with_expiration(delay);
        }

        if let Err(source) = channel
            .publish(queue.exchange(), &job.routing_key, &body, &properties)
            .await
        {
            metrics.publish_failed();
            error!(
                job_id = %job.job_id,
                routing_key = %job.routing_key,
                error = %source,
                "Job persisted but publish failed; record left queued"
            );
            return Err(JobError::PublishFailure {
                job_id: job.job_id,
                source,
            });
        }

        metrics.job_submitted(job.priority);
        info!(
            job_id = %job.job_id,
            routing_key = %job.routing_key,
            priority = %job.priority,
            "Job submitted"
        );

        Ok(JobHandle {
            job_id: job.job_id,
            status: JobStatus::Queued,
            queue_name: job.queue_name,
            routing_key: job.routing_key,
            kind: HandleKind::Enqueued,
        })
    }

    fn placeholder(&self, alias: &str, options: &SubmitOptions) -> JobHandle {
        let (queue_name, routing_key) = match QueueName::lookup(alias) {
            Some(queue) => (
                queue.physical().to_string(),
                queue.routing_key(options.priority),
            ),
            None => (alias.to_string(), alias.to_string()),
        };
        let job_id = Uuid::new_v4().to_string();

        JobMetrics::new(queue_name.clone()).job_rejected("degraded");
        warn!(
            job_id = %job_id,
            queue = %queue_name,
            "Broker unavailable, job not enqueued (placeholder handle)"
        );

        JobHandle {
            job_id,
            status: JobStatus::Queued,
            queue_name,
            routing_key,
            kind: HandleKind::Placeholder,
        }
    }
}
