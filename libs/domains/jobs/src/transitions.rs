//! Pure job state transitions.
//!
//! Each function mutates a `Job` in place and returns the history row that
//! must be appended alongside it. Persistence is the caller's concern.
//!
//! ```text
//! queued ──start──▶ processing ──complete──▶ completed
//!   ▲                  │   │
//!   └──retry (fail)────┘   └──fail (exhausted / permanent)──▶ failed
//! ```

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{JobError, JobResult, ProcessingError};
use crate::models::{
    HistoryEvent, Job, JobHistory, JobMetadata, JobProgress, JobStatus, JobType, SubmitOptions,
};
use crate::queues::QueueName;

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `queued`; requeue the delivery
    Retry,
    /// Now `failed`; dead-letter the delivery
    Exhausted,
}

fn ensure_active(job: &Job) -> JobResult<()> {
    if job.status.is_terminal() {
        return Err(JobError::TerminalState {
            job_id: job.job_id.clone(),
            status: job.status,
        });
    }
    Ok(())
}

fn required_string(payload: &Map<String, Value>, field: &str) -> JobResult<String> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(JobError::Validation(format!("{} must be a non-empty string", field))),
        None => Err(JobError::Validation(format!("{} is required", field))),
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}

/// Build a fresh `queued` job. The payload must be an object carrying
/// `userId` and `workspaceId` strings.
pub fn new_job(
    queue: QueueName,
    alias: &str,
    job_type: JobType,
    payload: Value,
    options: &SubmitOptions,
    now: DateTime<Utc>,
) -> JobResult<Job> {
    let fields = payload
        .as_object()
        .ok_or_else(|| JobError::Validation("payload must be a JSON object".to_string()))?;
    let user_id = required_string(fields, "userId")?;
    let workspace_id = required_string(fields, "workspaceId")?;

    Ok(Job {
        job_id: Uuid::new_v4().to_string(),
        job_type,
        queue_name: queue.physical().to_string(),
        routing_key: queue.routing_key(options.priority),
        user_id,
        workspace_id,
        data: payload,
        status: JobStatus::Queued,
        progress: JobProgress::default(),
        attempts: 0,
        max_attempts: options.max_attempts.max(1),
        priority: options.priority,
        result: None,
        last_error: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        queue_wait_time_ms: None,
        processing_time_ms: None,
        metadata: JobMetadata {
            queue_alias: alias.to_string(),
            parent_job_id: options.parent_job_id.clone(),
            delay_ms: options.delay.map(|d| d.as_millis() as u64),
            extra: Map::new(),
        },
    })
}

pub fn created(job: &Job) -> JobHistory {
    JobHistory::new(job, HistoryEvent::Created).with_message(format!("queued on {}", job.routing_key))
}

/// `queued → processing`. A redelivered job already in `processing`
/// (connection lost mid-run) restarts.
pub fn start(job: &mut Job, now: DateTime<Utc>) -> JobResult<JobHistory> {
    ensure_active(job)?;

    job.status = JobStatus::Processing;
    job.started_at = Some(now);
    job.queue_wait_time_ms = Some(millis_between(job.created_at, now));

    Ok(JobHistory::new(job, HistoryEvent::Started)
        .with_message(format!("attempt {} of {}", job.attempts + 1, job.max_attempts)))
}

pub fn set_progress(job: &mut Job, progress: JobProgress) -> JobResult<JobHistory> {
    ensure_active(job)?;

    let progress = match progress {
        JobProgress::Percent(p) => JobProgress::percent(p),
        JobProgress::Detailed(d) => JobProgress::detailed(d),
    };
    let value = progress.value();
    let mut entry = JobHistory::new(job, HistoryEvent::Progress).with_progress(value);
    if let JobProgress::Detailed(detail) = &progress {
        if let Ok(data) = serde_json::to_value(detail) {
            entry = entry.with_data(data);
        }
    }
    job.progress = progress;
    Ok(entry)
}

pub fn complete(job: &mut Job, result: Value, now: DateTime<Utc>) -> JobResult<JobHistory> {
    ensure_active(job)?;

    job.status = JobStatus::Completed;
    job.progress = JobProgress::percent(100.0);
    job.result = Some(result.clone());
    job.completed_at = Some(now);
    job.processing_time_ms = job.started_at.map(|started| millis_between(started, now));

    Ok(JobHistory::new(job, HistoryEvent::Completed).with_data(result))
}

/// Count a failed attempt. `attempts` never exceeds `max_attempts`.
pub fn fail_attempt(
    job: &mut Job,
    error: &ProcessingError,
    now: DateTime<Utc>,
) -> JobResult<(FailureOutcome, JobHistory)> {
    ensure_active(job)?;

    job.attempts = (job.attempts + 1).min(job.max_attempts);
    job.last_error = Some(error.message.clone());

    if !error.is_permanent() && job.attempts < job.max_attempts {
        job.status = JobStatus::Queued;
        let entry = JobHistory::new(job, HistoryEvent::Retry).with_message(error.message.clone());
        return Ok((FailureOutcome::Retry, entry));
    }

    job.status = JobStatus::Failed;
    job.completed_at = Some(now);
    job.processing_time_ms = job.started_at.map(|started| millis_between(started, now));
    let entry = JobHistory::new(job, HistoryEvent::Failed)
        .with_message(error.message.clone())
        .with_data(Value::String(error.category.as_str().to_string()));
    Ok((FailureOutcome::Exhausted, entry))
}

/// Marker for a fan-out job whose completion is reported later.
pub fn batch_initiated(job: &Job, detail: Option<Value>) -> JobResult<JobHistory> {
    ensure_active(job)?;
    if job.status != JobStatus::Processing {
        return Err(JobError::InvalidState {
            job_id: job.job_id.clone(),
            status: job.status,
            expected: JobStatus::Processing,
        });
    }
    let entry = JobHistory::new(job, HistoryEvent::BatchInitiated);
    Ok(match detail {
        Some(data) => entry.with_data(data),
        None => entry,
    })
}

/// Settle a job left in `processing` by a fan-out.
pub fn resolve(
    job: &mut Job,
    outcome: Result<Value, String>,
    now: DateTime<Utc>,
) -> JobResult<JobHistory> {
    ensure_active(job)?;
    if job.status != JobStatus::Processing {
        return Err(JobError::InvalidState {
            job_id: job.job_id.clone(),
            status: job.status,
            expected: JobStatus::Processing,
        });
    }

    match outcome {
        Ok(result) => complete(job, result, now),
        Err(message) => {
            job.status = JobStatus::Failed;
            job.last_error = Some(message.clone());
            job.completed_at = Some(now);
            job.processing_time_ms = job.started_at.map(|started| millis_between(started, now));
            Ok(JobHistory::new(job, HistoryEvent::Failed).with_message(message))
        }
    }
}
