//! Per-queue job counts for dashboards.
//!
//! Best effort: a store error or an unknown alias yields all zeros.

use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use crate::error::JobResult;
use crate::models::{JobStatus, QueueStatsView};
use crate::queues::QueueName;
use crate::repository::JobRepository;

#[derive(Clone)]
pub struct StatsReporter {
    repository: Arc<dyn JobRepository>,
}

impl StatsReporter {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self { repository }
    }

    pub async fn stats(&self, alias: &str) -> QueueStatsView {
        let Some(queue) = QueueName::lookup(alias) else {
            warn!(queue = alias, "Stats requested for unknown queue");
            return QueueStatsView::default();
        };

        match self.count(queue).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(queue = %queue.physical(), error = %e, "Stats query failed, reporting zeros");
                QueueStatsView::default()
            }
        }
    }

    /// Stats for every queue, keyed by alias
    pub async fn all(&self) -> Vec<(&'static str, QueueStatsView)> {
        let mut out = Vec::new();
        for queue in QueueName::all() {
            out.push((queue.alias(), self.stats(queue.alias()).await));
        }
        out
    }

    async fn count(&self, queue: QueueName) -> JobResult<QueueStatsView> {
        let name = queue.physical();
        let queued = self.repository.count_by_status(name, JobStatus::Queued).await?;
        let delayed = self.repository.count_delayed(name, Utc::now()).await?;

        Ok(QueueStatsView {
            waiting: queued.saturating_sub(delayed),
            active: self
                .repository
                .count_by_status(name, JobStatus::Processing)
                .await?,
            completed: self
                .repository
                .count_by_status(name, JobStatus::Completed)
                .await?,
            failed: self
                .repository
                .count_by_status(name, JobStatus::Failed)
                .await?,
            delayed,
        })
    }
}
