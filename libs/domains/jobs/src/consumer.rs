//! Consumer registry: delivery loops per queue.
//!
//! Each registered processor gets `concurrency` loops, one consumer tag each.
//! Per delivery:
//!
//! 1. Decode the envelope. Garbage, a job type the queue does not carry, or
//!    an unknown `jobId` is rejected without requeue (dead-lettered).
//! 2. A job already `completed` is acknowledged and skipped; one already
//!    `failed` is dead-lettered again.
//! 3. `queued → processing`, `started` history row, run the processor.
//! 4. Success completes and acks. `AwaitingChildren` records
//!    `batch_initiated` and acks, leaving the job `processing`.
//! 5. Failure counts an attempt. Attempts left: `retry` row, requeue.
//!    Exhausted or permanent: `failed`, dead-letter.
//!
//! Loops outlive reconnects: when the delivery stream ends without a pause
//! they wait for the next connection generation and consume again with the
//! same tag. A `Fatal` connection parks them until `initialize` succeeds
//! again; only a stop or `Shutdown` ends a loop.

use amqp_worker::{AmqpError, ConnectionManager, ConnectionStatus, Delivery};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::envelope::JobEnvelope;
use crate::error::{JobError, JobResult, ProcessingError};
use crate::metrics::JobMetrics;
use crate::models::{Job, JobHistory, JobStatus, JobType};
use crate::processor::{JobContext, JobProcessor, ProcessOutcome};
use crate::queues::{self, QueueName};
use crate::repository::JobRepository;
use crate::transitions::{self, FailureOutcome};

struct ConsumerHandle {
    tag: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Starts and stops delivery loops
pub struct ConsumerRegistry {
    connection: ConnectionManager,
    repository: Arc<dyn JobRepository>,
    consumers: Mutex<HashMap<QueueName, Vec<ConsumerHandle>>>,
}

impl ConsumerRegistry {
    pub fn new(connection: ConnectionManager, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            connection,
            repository,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Start `concurrency` delivery loops for `alias`; returns their consumer
    /// tags. Loops registered while the broker is down start consuming once
    /// it connects.
    #[instrument(skip(self, processor), fields(processor = processor.name()))]
    pub fn register_processor(
        &self,
        alias: &str,
        job_type: JobType,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
    ) -> JobResult<Vec<String>> {
        let queue = queues::resolve(alias, job_type)?;
        let worker = Arc::new(Worker {
            queue,
            repository: self.repository.clone(),
            processor,
            metrics: JobMetrics::new(queue.physical()),
        });

        let mut tags = Vec::new();
        let mut handles = Vec::new();
        for slot in 0..concurrency.max(1) {
            let id = Uuid::new_v4().simple().to_string();
            let tag = format!(
                "{}.{}.{}.{}",
                queue.physical(),
                worker.processor.name(),
                slot,
                &id[..8]
            );
            let (stop, stop_rx) = watch::channel(false);
            let task = tokio::spawn(consume_loop(
                worker.clone(),
                self.connection.clone(),
                tag.clone(),
                stop_rx,
            ));
            tags.push(tag.clone());
            handles.push(ConsumerHandle { tag, stop, task });
        }

        self.lock().entry(queue).or_default().extend(handles);
        info!(queue = %queue.physical(), tags = ?tags, "Processor registered");
        Ok(tags)
    }

    /// Consumer tags currently running for `alias`
    pub fn consumer_tags(&self, alias: &str) -> Vec<String> {
        let Some(queue) = QueueName::lookup(alias) else {
            return Vec::new();
        };
        self.lock()
            .get(&queue)
            .map(|handles| handles.iter().map(|h| h.tag.clone()).collect())
            .unwrap_or_default()
    }

    /// Cancel every consumer on `alias`. In-flight deliveries still finish.
    /// Resuming means registering a processor again.
    #[instrument(skip(self))]
    pub async fn pause(&self, alias: &str) -> JobResult<usize> {
        let queue =
            QueueName::lookup(alias).ok_or_else(|| JobError::UnknownQueue(alias.to_string()))?;
        let handles = self.lock().remove(&queue).unwrap_or_default();

        let count = handles.len();
        self.cancel(&handles).await;
        info!(queue = %queue.physical(), cancelled = count, "Queue paused");
        Ok(count)
    }

    /// Cancel all consumers and wait for in-flight deliveries
    pub async fn shutdown(&self) {
        let handles: Vec<ConsumerHandle> =
            self.lock().drain().flat_map(|(_, h)| h).collect();

        self.cancel(&handles).await;
        for handle in handles {
            if let Err(e) = handle.task.await {
                warn!(consumer_tag = %handle.tag, error = %e, "Consumer task ended abnormally");
            }
        }
        info!("Consumers stopped");
    }

    // A panic while holding the map leaves it consistent; keep using it.
    fn lock(&self) -> MutexGuard<'_, HashMap<QueueName, Vec<ConsumerHandle>>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn cancel(&self, handles: &[ConsumerHandle]) {
        let channel = self.connection.channel();
        for handle in handles {
            handle.stop.send_replace(true);
            if let Some(channel) = &channel {
                if let Err(e) = channel.cancel(&handle.tag).await {
                    debug!(consumer_tag = %handle.tag, error = %e, "Consumer cancel failed");
                }
            }
        }
    }
}

async fn consume_loop(
    worker: Arc<Worker>,
    connection: ConnectionManager,
    tag: String,
    mut stop: watch::Receiver<bool>,
) {
    let queue = worker.queue.physical();
    let mut generation = connection.generation_signal();
    let mut status = connection.status_signal();

    loop {
        if *stop.borrow() {
            break;
        }

        let channel = tokio::select! {
            channel = connection.wait_ready() => channel,
            _ = stop.changed() => break,
        };
        let Some(channel) = channel else {
            if connection.status() == ConnectionStatus::Shutdown {
                break;
            }
            warn!(
                consumer_tag = %tag,
                queue,
                "Broker reconnection abandoned, consumer idle until the connection is re-initialized"
            );
            let resumed = tokio::select! {
                changed = status.wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::Shutdown)) => {
                    changed.map(|s| *s == ConnectionStatus::Connected).unwrap_or(false)
                }
                _ = stop.changed() => false,
            };
            if !resumed {
                break;
            }
            continue;
        };
        let seen = *generation.borrow_and_update();

        match channel.consume(queue, &tag).await {
            Ok(mut deliveries) => {
                info!(consumer_tag = %tag, queue, "Consumer started");
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => break,
                        next = deliveries.next() => match next {
                            Some(Ok(delivery)) => worker.handle(delivery).await,
                            Some(Err(e)) => {
                                warn!(consumer_tag = %tag, error = %e, "Delivery stream error");
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
            Err(e) => warn!(consumer_tag = %tag, queue, error = %e, "Failed to start consumer"),
        }

        if *stop.borrow() {
            if let Err(e) = channel.cancel(&tag).await {
                debug!(consumer_tag = %tag, error = %e, "Consumer cancel failed");
            }
            break;
        }

        debug!(consumer_tag = %tag, "Delivery stream ended, waiting for reconnect");
        let reconnected = tokio::select! {
            changed = generation.wait_for(|g| *g > seen) => changed.is_ok(),
            _ = status.wait_for(|s| *s == ConnectionStatus::Shutdown) => false,
            _ = stop.changed() => false,
        };
        if !reconnected {
            break;
        }
    }

    info!(consumer_tag = %tag, queue, "Consumer stopped");
}

struct Worker {
    queue: QueueName,
    repository: Arc<dyn JobRepository>,
    processor: Arc<dyn JobProcessor>,
    metrics: JobMetrics,
}

impl Worker {
    async fn handle(&self, delivery: Delivery) {
        let envelope = match JobEnvelope::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue.physical(), error = %e, "Undecodable delivery, dead-lettering");
                self.metrics.delivery_rejected("malformed");
                settle(delivery.dead_letter().await);
                return;
            }
        };

        if envelope.job_type != self.queue.job_type() {
            warn!(
                job_id = %envelope.job_id,
                job_type = %envelope.job_type,
                queue = %self.queue.physical(),
                "Job type does not belong on this queue, dead-lettering"
            );
            self.metrics.delivery_rejected("job_type_mismatch");
            settle(delivery.dead_letter().await);
            return;
        }

        let job = match self.repository.find(&envelope.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %envelope.job_id, "Orphaned delivery, job record missing");
                self.metrics.delivery_rejected("orphaned");
                settle(delivery.dead_letter().await);
                return;
            }
            Err(e) => {
                error!(job_id = %envelope.job_id, error = %e, "Job lookup failed, requeueing");
                settle(delivery.requeue().await);
                return;
            }
        };

        if job.status == JobStatus::Failed {
            // dead-letter nack lost after the failure was recorded
            info!(job_id = %job.job_id, "Job already failed, dead-lettering redelivery");
            settle(delivery.dead_letter().await);
            return;
        }
        if job.status.is_terminal() {
            info!(job_id = %job.job_id, status = %job.status, "Job already finished, skipping redelivery");
            settle(delivery.ack().await);
            return;
        }

        self.run(job, delivery).await;
    }

    async fn run(&self, mut job: Job, delivery: Delivery) {
        let job_id = job.job_id.clone();
        let started = match transitions::start(&mut job, Utc::now()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Cannot start job");
                settle(delivery.ack().await);
                return;
            }
        };
        if let Err(e) = self.persist(&job, &started).await {
            error!(job_id = %job_id, error = %e, "Failed to record job start, requeueing");
            settle(delivery.requeue().await);
            return;
        }

        self.metrics.job_started();
        debug!(job_id = %job_id, attempt = job.attempts + 1, redelivered = delivery.redelivered, "Processing job");

        let ctx = JobContext::new(job, self.repository.clone(), self.metrics.clone());
        let timer = Instant::now();
        let result = AssertUnwindSafe(self.processor.process(ctx.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ProcessingError::transient("processor panicked")));
        let mut job = ctx.current().await;

        match result {
            Ok(ProcessOutcome::Completed(value)) => {
                self.settle_success(&mut job, value, delivery, timer).await
            }
            Ok(ProcessOutcome::AwaitingChildren(detail)) => {
                self.settle_batch(&job, detail, delivery).await
            }
            Err(err) => self.settle_failure(&mut job, err, delivery).await,
        }
    }

    async fn settle_success(
        &self,
        job: &mut Job,
        value: serde_json::Value,
        delivery: Delivery,
        timer: Instant,
    ) {
        let entry = match transitions::complete(job, value, Utc::now()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Completion rejected");
                settle(delivery.ack().await);
                return;
            }
        };
        if let Err(e) = self.persist(job, &entry).await {
            error!(job_id = %job.job_id, error = %e, "Failed to record completion, requeueing");
            settle(delivery.requeue().await);
            return;
        }
        self.metrics.job_completed(timer.elapsed());
        info!(
            job_id = %job.job_id,
            processing_time_ms = job.processing_time_ms,
            "Job completed"
        );
        settle(delivery.ack().await);
    }

    async fn settle_batch(
        &self,
        job: &Job,
        detail: Option<serde_json::Value>,
        delivery: Delivery,
    ) {
        match transitions::batch_initiated(job, detail) {
            Ok(entry) => {
                if let Err(e) = self.repository.append_history(&entry).await {
                    error!(job_id = %job.job_id, error = %e, "Failed to record batch start");
                }
                self.metrics.job_batched();
                info!(job_id = %job.job_id, "Batch initiated, awaiting children");
            }
            Err(e) => warn!(job_id = %job.job_id, error = %e, "Batch outcome rejected"),
        }
        settle(delivery.ack().await);
    }

    async fn settle_failure(&self, job: &mut Job, err: ProcessingError, delivery: Delivery) {
        let (outcome, entry) = match transitions::fail_attempt(job, &err, Utc::now()) {
            Ok(result) => result,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Failure rejected");
                settle(delivery.ack().await);
                return;
            }
        };
        if let Err(e) = self.persist(job, &entry).await {
            error!(job_id = %job.job_id, error = %e, "Failed to record failure, requeueing");
            settle(delivery.requeue().await);
            return;
        }

        match outcome {
            FailureOutcome::Retry => {
                self.metrics.job_retried();
                warn!(
                    job_id = %job.job_id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %err,
                    "Job failed, requeueing"
                );
                settle(delivery.requeue().await);
            }
            FailureOutcome::Exhausted => {
                self.metrics.job_failed(err.category.as_str());
                error!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    category = err.category.as_str(),
                    error = %err,
                    "Job failed permanently, dead-lettering"
                );
                settle(delivery.dead_letter().await);
            }
        }
    }

    async fn persist(&self, job: &Job, entry: &JobHistory) -> JobResult<()> {
        self.repository.save(job).await?;
        self.repository.append_history(entry).await
    }
}

fn settle(result: Result<(), AmqpError>) {
    if let Err(e) = result {
        warn!(error = %e, "Failed to settle delivery; broker will redeliver");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJobRepository;
    use crate::models::{HistoryEvent, SubmitOptions};
    use crate::processor::processor_fn;
    use crate::publisher::JobPublisher;
    use crate::test_support::{connected, payload};
    use amqp_worker::{BrokerChannel, InMemoryBroker};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Harness {
        broker: InMemoryBroker,
        repo: Arc<InMemoryJobRepository>,
        publisher: JobPublisher,
        registry: ConsumerRegistry,
    }

    async fn harness() -> Harness {
        let (manager, broker) = connected().await;
        let repo = Arc::new(InMemoryJobRepository::new());
        Harness {
            broker,
            publisher: JobPublisher::new(manager.clone(), repo.clone()),
            registry: ConsumerRegistry::new(manager, repo.clone()),
            repo,
        }
    }

    async fn wait_for_status(repo: &InMemoryJobRepository, job_id: &str, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = repo.find(job_id).await.unwrap() {
                    if job.status == status {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never reached expected status")
    }

    #[tokio::test]
    async fn test_completes_job() {
        let h = harness().await;
        let tags = h
            .registry
            .register_processor(
                "sync-products",
                JobType::ProductSync,
                2,
                Arc::new(processor_fn("sync", |ctx: JobContext| async move {
                    ctx.report_progress(40.0).await?;
                    Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::json!({"synced": 3})))
                })),
            )
            .unwrap();
        assert_eq!(tags.len(), 2);
        assert_ne!(tags[0], tags[1]);

        let handle = h
            .publisher
            .submit("sync-products", JobType::ProductSync, payload(), SubmitOptions::default())
            .await
            .unwrap();

        let job = wait_for_status(&h.repo, &handle.job_id, JobStatus::Completed).await;
        assert_eq!(job.result, Some(serde_json::json!({"synced": 3})));
        assert_eq!(job.progress.value(), 100.0);
        assert_eq!(job.attempts, 0);
        assert!(job.queue_wait_time_ms.is_some());

        let events: Vec<HistoryEvent> = h
            .repo
            .history(&handle.job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![
                HistoryEvent::Created,
                HistoryEvent::Started,
                HistoryEvent::Progress,
                HistoryEvent::Completed
            ]
        );
        h.registry.shutdown().await;
        assert_eq!(h.broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_dead_letters() {
        let h = harness().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        h.registry
            .register_processor(
                "ai-scan",
                JobType::AiProductScan,
                1,
                Arc::new(processor_fn("flaky", move |_ctx: JobContext| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<ProcessOutcome, _>(ProcessingError::transient("upstream 503"))
                    }
                })),
            )
            .unwrap();

        let handle = h
            .publisher
            .submit("ai-scan", JobType::AiProductScan, payload(), SubmitOptions::default())
            .await
            .unwrap();

        let job = wait_for_status(&h.repo, &handle.job_id, JobStatus::Failed).await;
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("upstream 503"));
        h.registry.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.broker.requeued_count(), 2);
        assert_eq!(h.broker.queue_len(queues::DEAD_LETTER_QUEUE), 1);
        assert_eq!(h.broker.queue_len("ai.scan"), 0);
    }

    #[tokio::test]
    async fn test_bad_deliveries_are_dead_lettered() {
        let h = harness().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        h.registry
            .register_processor(
                "sync-products",
                JobType::ProductSync,
                1,
                Arc::new(processor_fn("counting", move |_ctx: JobContext| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::Value::Null))
                    }
                })),
            )
            .unwrap();

        // never persisted
        let orphan = transitions::new_job(
            QueueName::SyncProducts,
            "sync-products",
            JobType::ProductSync,
            payload(),
            &SubmitOptions::default(),
            Utc::now(),
        )
        .unwrap();
        // persisted, but for another queue
        let misrouted = transitions::new_job(
            QueueName::AiScan,
            "ai-scan",
            JobType::AiProductScan,
            payload(),
            &SubmitOptions::default(),
            Utc::now(),
        )
        .unwrap();
        h.repo.insert(&misrouted).await.unwrap();

        let properties = amqp_worker::PublishProperties::persistent_json();
        for body in [
            b"{not json".to_vec(),
            JobEnvelope::from_job(&orphan).to_bytes().unwrap(),
            JobEnvelope::from_job(&misrouted).to_bytes().unwrap(),
        ] {
            h.broker
                .publish("sync", "sync.products.normal", &body, &properties)
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.queue_len(queues::DEAD_LETTER_QUEUE) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.registry.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let untouched = h.repo.find(&misrouted.job_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_finished_job_redelivery_is_skipped() {
        let h = harness().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        h.registry
            .register_processor(
                "sync-products",
                JobType::ProductSync,
                1,
                Arc::new(processor_fn("counting", move |_ctx: JobContext| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::Value::Null))
                    }
                })),
            )
            .unwrap();

        let handle = h
            .publisher
            .submit("sync-products", JobType::ProductSync, payload(), SubmitOptions::default())
            .await
            .unwrap();
        let job = wait_for_status(&h.repo, &handle.job_id, JobStatus::Completed).await;

        // duplicate message for the same job
        h.broker
            .publish(
                "sync",
                "sync.products.normal",
                &JobEnvelope::from_job(&job).to_bytes().unwrap(),
                &amqp_worker::PublishProperties::persistent_json(),
            )
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.acked_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.registry.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let history = h.repo.history(&handle.job_id).await.unwrap();
        assert_eq!(
            history.iter().filter(|e| e.event == HistoryEvent::Started).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_pause_cancels_all_tags() {
        let h = harness().await;
        h.registry
            .register_processor(
                "ai-optimize",
                JobType::AiOptimization,
                3,
                Arc::new(processor_fn("opt", |_ctx: JobContext| async move {
                    Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::Value::Null))
                })),
            )
            .unwrap();
        assert_eq!(h.registry.consumer_tags("ai-optimize").len(), 3);
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.consumer_tags("ai.optimize").len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.registry.pause("ai-optimize").await.unwrap(), 3);
        assert!(h.registry.consumer_tags("ai-optimize").is_empty());
        assert!(h.broker.consumer_tags("ai.optimize").is_empty());
        assert!(matches!(
            h.registry.pause("nope").await,
            Err(JobError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_lets_in_flight_delivery_finish() {
        let h = harness().await;
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        h.registry
            .register_processor(
                "sync-products",
                JobType::ProductSync,
                1,
                Arc::new(processor_fn("gated", move |_ctx: JobContext| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::json!({"synced": 1})))
                    }
                })),
            )
            .unwrap();

        let first = h
            .publisher
            .submit("sync-products", JobType::ProductSync, payload(), SubmitOptions::default())
            .await
            .unwrap();
        wait_for_status(&h.repo, &first.job_id, JobStatus::Processing).await;

        assert_eq!(h.registry.pause("sync-products").await.unwrap(), 1);
        release.notify_one();

        let job = wait_for_status(&h.repo, &first.job_id, JobStatus::Completed).await;
        assert_eq!(job.result, Some(serde_json::json!({"synced": 1})));
        assert_eq!(h.broker.acked_count(), 1);

        let second = h
            .publisher
            .submit("sync-products", JobType::ProductSync, payload(), SubmitOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting = h.repo.find(&second.job_id).await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Queued);
        assert_eq!(h.broker.queue_len("sync.products"), 1);
        assert_eq!(h.broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_redelivery_is_dead_lettered() {
        let h = harness().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        h.registry
            .register_processor(
                "sync-products",
                JobType::ProductSync,
                1,
                Arc::new(processor_fn("counting", move |_ctx: JobContext| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::Value::Null))
                    }
                })),
            )
            .unwrap();

        // failure recorded, but the dead-letter nack never reached the broker
        let mut job = transitions::new_job(
            QueueName::SyncProducts,
            "sync-products",
            JobType::ProductSync,
            payload(),
            &SubmitOptions::default(),
            Utc::now(),
        )
        .unwrap();
        transitions::start(&mut job, Utc::now()).unwrap();
        transitions::fail_attempt(&mut job, &ProcessingError::permanent("bad sku"), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        h.repo.insert(&job).await.unwrap();

        h.broker
            .publish(
                "sync",
                "sync.products.normal",
                &JobEnvelope::from_job(&job).to_bytes().unwrap(),
                &amqp_worker::PublishProperties::persistent_json(),
            )
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.queue_len(queues::DEAD_LETTER_QUEUE) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.registry.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.broker.acked_count(), 0);
        let stored = h.repo.find(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_registry_usable_after_poisoned_lock() {
        let broker = InMemoryBroker::new();
        let registry = ConsumerRegistry::new(
            crate::test_support::disconnected(&broker),
            Arc::new(InMemoryJobRepository::new()),
        );
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = registry.consumers.lock().unwrap();
            panic!("panicked while holding the consumer map");
        }));
        assert!(result.is_err());
        assert!(registry.consumers.is_poisoned());

        let tags = registry
            .register_processor(
                "ai-scan",
                JobType::AiProductScan,
                2,
                Arc::new(processor_fn("scan", |_ctx: JobContext| async move {
                    Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::Value::Null))
                })),
            )
            .unwrap();
        assert_eq!(registry.consumer_tags("ai-scan"), tags);
        assert_eq!(registry.pause("ai-scan").await.unwrap(), 2);
        assert!(registry.consumer_tags("ai-scan").is_empty());
    }

    #[test]
    fn test_register_rejects_wrong_job_type() {
        let broker = InMemoryBroker::new();
        let registry = ConsumerRegistry::new(
            crate::test_support::disconnected(&broker),
            Arc::new(InMemoryJobRepository::new()),
        );
        let result = registry.register_processor(
            "sync-products",
            JobType::AiOptimization,
            1,
            Arc::new(processor_fn("x", |_ctx: JobContext| async move {
                Ok::<_, ProcessingError>(ProcessOutcome::completed(serde_json::Value::Null))
            })),
        );
        assert!(matches!(result, Err(JobError::JobTypeMismatch { .. })));
    }
}
