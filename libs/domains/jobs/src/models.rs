use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};
use validator::Validate;

/// Kind of work a job performs
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    MarketplaceSync,
    ProductSync,
    ProductBatch,
    AiProductScan,
    AiOptimization,
}

/// Job priority
///
/// The routing-key suffix and the broker-native priority both derive from
/// this one type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric priority sent to the broker (0-10 scale)
    pub const fn broker_priority(self) -> u8 {
        match self {
            Priority::Critical => 10,
            Priority::High => 8,
            Priority::Normal => 5,
            Priority::Low => 2,
        }
    }

    /// Routing-key suffix
    pub const fn routing_name(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Job lifecycle status
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Structured sub-progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetail {
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Job progress: a plain percentage or a structured object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobProgress {
    Percent(f64),
    Detailed(ProgressDetail),
}

impl Default for JobProgress {
    fn default() -> Self {
        JobProgress::Percent(0.0)
    }
}

/// Clamp to `[0, 100]`; NaN becomes 0
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

impl JobProgress {
    pub fn percent(value: f64) -> Self {
        JobProgress::Percent(clamp_percent(value))
    }

    pub fn detailed(mut detail: ProgressDetail) -> Self {
        detail.percent = clamp_percent(detail.percent);
        JobProgress::Detailed(detail)
    }

    pub fn value(&self) -> f64 {
        match self {
            JobProgress::Percent(p) => *p,
            JobProgress::Detailed(d) => d.percent,
        }
    }
}

/// Free-form job metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    /// Caller-facing queue alias used at submission
    pub queue_alias: String,
    /// Parent job for batch fan-out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub queue_name: String,
    pub routing_key: String,
    pub user_id: String,
    pub workspace_id: String,
    /// Caller payload, stored verbatim
    pub data: Value,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: Priority,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub queue_wait_time_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub metadata: JobMetadata,
}

impl Job {
    /// When a delayed job becomes eligible for delivery
    pub fn available_at(&self) -> DateTime<Utc> {
        match self.metadata.delay_ms {
            Some(ms) => self.created_at + ChronoDuration::milliseconds(ms as i64),
            None => self.created_at,
        }
    }

    /// Queued and still inside its delay window
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at() > now
    }
}

/// History event kinds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HistoryEvent {
    Created,
    Started,
    Progress,
    Completed,
    Failed,
    Retry,
    BatchInitiated,
}

/// Append-only audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistory {
    pub job_id: String,
    pub event: HistoryEvent,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JobHistory {
    pub fn new(job: &Job, event: HistoryEvent) -> Self {
        Self {
            job_id: job.job_id.clone(),
            event,
            timestamp: Utc::now(),
            attempt: job.attempts,
            progress: None,
            message: None,
            data: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Queue health metrics block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealthMetrics {
    pub waiting: u64,
    pub active: u64,
    /// Finished within the window
    pub completed: u64,
    pub failed: u64,
    /// Jobs finished per minute over the window
    pub processing_rate: f64,
    /// Milliseconds
    pub average_wait_time: f64,
    /// failed / (completed + failed) over the window
    pub error_rate: f64,
}

/// Periodic per-queue health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub queue_name: String,
    pub is_healthy: bool,
    pub metrics: QueueHealthMetrics,
    pub timestamp: DateTime<Utc>,
}

/// Read view returned by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: Priority,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub queue_wait_time_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            status: job.status,
            progress: job.progress.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            priority: job.priority,
            result: job.result.clone(),
            error: job.last_error.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            queue_wait_time_ms: job.queue_wait_time_ms,
            processing_time_ms: job.processing_time_ms,
        }
    }
}

/// Point-in-time queue counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueStatsView {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Options accepted by `submit`
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct SubmitOptions {
    pub priority: Priority,
    /// Published as message expiration
    pub delay: Option<Duration>,
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,
    pub parent_job_id: Option<String>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            delay: None,
            max_attempts: 3,
            parent_job_id: None,
        }
    }
}

impl SubmitOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_parent(mut self, parent_job_id: impl Into<String>) -> Self {
        self.parent_job_id = Some(parent_job_id.into());
        self
    }
}

/// Whether a handle is backed by a persisted, published job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    Enqueued,
    /// Returned in degraded mode: nothing was persisted or published
    Placeholder,
}

/// Returned by `submit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub status: JobStatus,
    pub queue_name: String,
    pub routing_key: String,
    pub kind: HandleKind,
}

impl JobHandle {
    pub fn is_placeholder(&self) -> bool {
        self.kind == HandleKind::Placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_priority_mapping_is_strictly_ordered() {
        let ordered = [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].broker_priority() > pair[1].broker_priority());
        }
        assert_eq!(Priority::Critical.broker_priority(), 10);
        assert_eq!(Priority::High.broker_priority(), 8);
        assert_eq!(Priority::Normal.broker_priority(), 5);
        assert_eq!(Priority::Low.broker_priority(), 2);
    }

    #[test]
    fn test_priority_names() {
        for priority in Priority::iter() {
            assert_eq!(
                priority.routing_name(),
                priority.to_string().to_lowercase()
            );
        }
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(
            serde_json::to_value(Priority::Critical).unwrap(),
            "CRITICAL"
        );
    }

    #[test]
    fn test_job_type_wire_names() {
        assert_eq!(
            serde_json::to_value(JobType::MarketplaceSync).unwrap(),
            "MARKETPLACE_SYNC"
        );
        assert_eq!(
            "AI_PRODUCT_SCAN".parse::<JobType>().unwrap(),
            JobType::AiProductScan
        );
    }

    #[test]
    fn test_progress_clamping() {
        assert_eq!(JobProgress::percent(-10.0).value(), 0.0);
        assert_eq!(JobProgress::percent(150.0).value(), 100.0);
        assert_eq!(JobProgress::percent(f64::NAN).value(), 0.0);
        let detailed = JobProgress::detailed(ProgressDetail {
            percent: 120.0,
            stage: Some("upload".into()),
            ..Default::default()
        });
        assert_eq!(detailed.value(), 100.0);
    }

    #[test]
    fn test_progress_serde_untagged() {
        let plain: JobProgress = serde_json::from_value(serde_json::json!(42.5)).unwrap();
        assert_eq!(plain, JobProgress::Percent(42.5));

        let detailed: JobProgress =
            serde_json::from_value(serde_json::json!({"percent": 10.0, "stage": "fetch"}))
                .unwrap();
        assert!(matches!(detailed, JobProgress::Detailed(_)));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_submit_options_validation() {
        assert!(SubmitOptions::default().validate().is_ok());
        assert!(
            SubmitOptions::default()
                .with_max_attempts(0)
                .validate()
                .is_err()
        );
    }
}
