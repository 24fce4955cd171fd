//! Prometheus metrics for the job queue
//!
//! The recorder itself is installed by `amqp_worker::init_metrics`.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::models::{Priority, QueueHealth};

/// Job metrics helper, labelled by physical queue
#[derive(Clone)]
pub struct JobMetrics {
    queue: String,
}

impl JobMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn job_submitted(&self, priority: Priority) {
        counter!(
            "jobs_submitted_total",
            "queue" => self.queue.clone(),
            "priority" => priority.routing_name()
        )
        .increment(1);
    }

    /// Submission rejected by validation, or degraded mode placeholder
    pub fn job_rejected(&self, reason: &'static str) {
        counter!(
            "jobs_rejected_total",
            "queue" => self.queue.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn publish_failed(&self) {
        counter!("jobs_publish_failures_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn job_started(&self) {
        counter!("jobs_started_total", "queue" => self.queue.clone()).increment(1);
        gauge!("jobs_active", "queue" => self.queue.clone()).increment(1.0);
    }

    pub fn job_completed(&self, duration: Duration) {
        gauge!("jobs_active", "queue" => self.queue.clone()).decrement(1.0);
        counter!(
            "jobs_processed_total",
            "queue" => self.queue.clone(),
            "status" => "completed"
        )
        .increment(1);
        histogram!(
            "jobs_processing_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Fan-out job handed off; still counted as processed
    pub fn job_batched(&self) {
        gauge!("jobs_active", "queue" => self.queue.clone()).decrement(1.0);
        counter!(
            "jobs_processed_total",
            "queue" => self.queue.clone(),
            "status" => "batched"
        )
        .increment(1);
    }

    pub fn job_retried(&self) {
        gauge!("jobs_active", "queue" => self.queue.clone()).decrement(1.0);
        counter!("jobs_retried_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn job_failed(&self, category: &'static str) {
        gauge!("jobs_active", "queue" => self.queue.clone()).decrement(1.0);
        counter!(
            "jobs_processed_total",
            "queue" => self.queue.clone(),
            "status" => "failed"
        )
        .increment(1);
        counter!(
            "jobs_dead_lettered_total",
            "queue" => self.queue.clone(),
            "category" => category
        )
        .increment(1);
    }

    pub fn progress_reported(&self) {
        counter!("jobs_progress_updates_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Delivery that could not be decoded or matched to a job
    pub fn delivery_rejected(&self, reason: &'static str) {
        counter!(
            "jobs_deliveries_rejected_total",
            "queue" => self.queue.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn health_snapshot(&self, health: &QueueHealth) {
        let m = &health.metrics;
        gauge!("jobs_queue_waiting", "queue" => self.queue.clone()).set(m.waiting as f64);
        gauge!("jobs_queue_error_rate", "queue" => self.queue.clone()).set(m.error_rate);
        gauge!("jobs_queue_processing_rate", "queue" => self.queue.clone())
            .set(m.processing_rate);
        gauge!("jobs_queue_healthy", "queue" => self.queue.clone())
            .set(if health.is_healthy { 1.0 } else { 0.0 });
    }
}
