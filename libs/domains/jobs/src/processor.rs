//! Job processor trait and the per-delivery context handed to it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ProcessingError;
use crate::metrics::JobMetrics;
use crate::models::{Job, JobProgress, JobStatusView, JobType, ProgressDetail};
use crate::repository::JobRepository;
use crate::transitions;

/// What a processor reports on success
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Done; the value is stored as the job result
    Completed(Value),
    /// Work was fanned out and finishes later through `resolve_pending`.
    /// The job stays `processing` and the delivery is acknowledged.
    AwaitingChildren(Option<Value>),
}

impl ProcessOutcome {
    pub fn completed(result: impl Into<Value>) -> Self {
        ProcessOutcome::Completed(result.into())
    }
}

/// Trait for job processors.
///
/// Registered per queue with `ConsumerRegistry::register_processor`.
///
/// # Example
///
/// ```rust,ignore
/// struct MarketplaceSync { client: Arc<MarketplaceClient> }
///
/// #[async_trait]
/// impl JobProcessor for MarketplaceSync {
///     async fn process(&self, ctx: JobContext) -> Result<ProcessOutcome, ProcessingError> {
///         let req: SyncRequest = ctx.parse()?;
///         let synced = self.client.sync(&req, |p| ctx.report_progress(p)).await?;
///         Ok(ProcessOutcome::completed(json!({ "synced": synced })))
///     }
///
///     fn name(&self) -> &'static str {
///         "MarketplaceSync"
///     }
/// }
/// ```
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> Result<ProcessOutcome, ProcessingError>;

    /// Processor name for logging
    fn name(&self) -> &'static str;
}

/// Processor backed by a closure, see [`processor_fn`]
pub struct FnProcessor<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async closure as a `JobProcessor`
pub fn processor_fn<F, Fut>(name: &'static str, f: F) -> FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProcessOutcome, ProcessingError>> + Send + 'static,
{
    FnProcessor { name, f }
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProcessOutcome, ProcessingError>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> Result<ProcessOutcome, ProcessingError> {
        (self.f)(ctx).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

struct ContextInner {
    job: Mutex<Job>,
    payload: Value,
    repository: Arc<dyn JobRepository>,
    metrics: JobMetrics,
}

/// View of the job being processed.
///
/// Cheap to clone; every clone reports progress against the same record.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
    job_id: String,
    job_type: JobType,
    attempt: u32,
    max_attempts: u32,
}

impl JobContext {
    pub(crate) fn new(job: Job, repository: Arc<dyn JobRepository>, metrics: JobMetrics) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            attempt: job.attempts + 1,
            max_attempts: job.max_attempts,
            inner: Arc::new(ContextInner {
                payload: job.data.clone(),
                job: Mutex::new(job),
                repository,
                metrics,
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// 1-based attempt number of this delivery
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Caller payload as submitted
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// Deserialize the payload. A shape mismatch is a permanent failure.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProcessingError> {
        Ok(serde_json::from_value(self.inner.payload.clone())?)
    }

    pub async fn status(&self) -> JobStatusView {
        JobStatusView::from(&*self.inner.job.lock().await)
    }

    /// Persist progress, clamped to `[0, 100]`
    pub async fn report_progress(&self, percent: f64) -> Result<(), ProcessingError> {
        self.store_progress(JobProgress::percent(percent)).await
    }

    pub async fn report_detailed(&self, detail: ProgressDetail) -> Result<(), ProcessingError> {
        self.store_progress(JobProgress::detailed(detail)).await
    }

    async fn store_progress(&self, progress: JobProgress) -> Result<(), ProcessingError> {
        let mut job = self.inner.job.lock().await;
        let entry = transitions::set_progress(&mut job, progress)?;
        self.inner.repository.save(&job).await?;
        self.inner.repository.append_history(&entry).await?;
        self.inner.metrics.progress_reported();
        tracing::debug!(job_id = %job.job_id, progress = job.progress.value(), "Progress reported");
        Ok(())
    }

    /// Job record as last written by this context
    pub(crate) async fn current(&self) -> Job {
        self.inner.job.lock().await.clone()
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .finish()
    }
}
