//! Periodic queue health snapshots.
//!
//! A queue is healthy when the broker is connected, its error rate over the
//! window is below `max_error_rate` and fewer than `max_waiting` jobs wait.

use amqp_worker::ConnectionManager;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::JobResult;
use crate::metrics::JobMetrics;
use crate::models::{JobStatus, QueueHealth, QueueHealthMetrics};
use crate::queues::QueueName;
use crate::repository::JobRepository;
use crate::stats::StatsReporter;

/// Health thresholds and window
///
/// Defaults:
/// - window: 5 minutes
/// - max_error_rate: 0.5
/// - max_waiting: 1000
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub window: Duration,
    pub max_error_rate: f64,
    pub max_waiting: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            max_error_rate: 0.5,
            max_waiting: 1000,
        }
    }
}

#[derive(Clone)]
pub struct QueueHealthMonitor {
    repository: Arc<dyn JobRepository>,
    stats: StatsReporter,
    connection: ConnectionManager,
    thresholds: HealthThresholds,
}

impl QueueHealthMonitor {
    pub fn new(repository: Arc<dyn JobRepository>, connection: ConnectionManager) -> Self {
        Self {
            stats: StatsReporter::new(repository.clone()),
            repository,
            connection,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Compute a snapshot without persisting it
    pub async fn snapshot(&self, queue: QueueName) -> JobResult<QueueHealth> {
        let now = Utc::now();
        let window = ChronoDuration::from_std(self.thresholds.window)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let counts = self.stats.stats(queue.alias()).await;
        let finished = self
            .repository
            .finished_since(queue.physical(), now - window)
            .await?;

        let completed = finished
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count() as u64;
        let failed = finished
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .count() as u64;

        let waits: Vec<i64> = finished.iter().filter_map(|j| j.queue_wait_time_ms).collect();
        let average_wait_time = if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<i64>() as f64 / waits.len() as f64
        };

        let error_rate = if completed + failed == 0 {
            0.0
        } else {
            failed as f64 / (completed + failed) as f64
        };
        let window_minutes = self.thresholds.window.as_secs_f64() / 60.0;
        let processing_rate = if window_minutes > 0.0 {
            completed as f64 / window_minutes
        } else {
            0.0
        };

        let is_healthy = self.connection.is_initialized()
            && error_rate < self.thresholds.max_error_rate
            && counts.waiting < self.thresholds.max_waiting;

        Ok(QueueHealth {
            queue_name: queue.physical().to_string(),
            is_healthy,
            metrics: QueueHealthMetrics {
                waiting: counts.waiting,
                active: counts.active,
                completed,
                failed,
                processing_rate,
                average_wait_time,
                error_rate,
            },
            timestamp: now,
        })
    }

    /// Snapshot and persist every queue. Failures are logged per queue.
    pub async fn record_all(&self) -> Vec<QueueHealth> {
        let mut recorded = Vec::new();
        for queue in QueueName::all() {
            let health = match self.snapshot(queue).await {
                Ok(health) => health,
                Err(e) => {
                    warn!(queue = %queue.physical(), error = %e, "Health snapshot failed");
                    continue;
                }
            };
            if let Err(e) = self.repository.record_health(&health).await {
                warn!(queue = %queue.physical(), error = %e, "Failed to store health snapshot");
            }
            JobMetrics::new(queue.physical()).health_snapshot(&health);
            if !health.is_healthy {
                warn!(
                    queue = %health.queue_name,
                    waiting = health.metrics.waiting,
                    error_rate = health.metrics.error_rate,
                    "Queue unhealthy"
                );
            }
            recorded.push(health);
        }
        debug!(queues = recorded.len(), "Health snapshots recorded");
        recorded
    }

    /// Record snapshots every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Queue health monitor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.record_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Queue health monitor stopped");
    }
}
