//! Ops HTTP surface: probes, metrics, queue stats and health, pause, job lookup.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::error::{JobError, JobResult};
use crate::models::{JobHistory, JobStatusView, QueueHealth, QueueStatsView};
use crate::queues::QueueName;
use crate::service::JobQueue;

/// Shared state for the admin router
#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<JobQueue>,
    pub app_name: String,
    pub app_version: String,
}

impl AdminState {
    pub fn new(
        queue: Arc<JobQueue>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub queue: &'static str,
    pub physical_name: &'static str,
    pub stats: QueueStatsView,
    /// Ready messages on the broker; `null` while degraded
    pub broker_depth: Option<u32>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/queues", get(list_queues))
        .route("/queues/{alias}/stats", get(queue_stats))
        .route("/queues/{alias}/health", get(queue_health))
        .route("/queues/{alias}/pause", post(pause_queue))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/history", get(job_history))
        .with_state(state)
}

fn lookup(alias: &str) -> JobResult<QueueName> {
    QueueName::lookup(alias).ok_or_else(|| JobError::UnknownQueue(alias.to_string()))
}

/// Liveness: always OK while the process serves requests
async fn health_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": state.app_name,
        "version": state.app_version,
    }))
}

/// Readiness: 503 unless the broker channel is live
async fn ready_handler(State(state): State<AdminState>) -> (StatusCode, Json<Value>) {
    let connection = state.queue.connection();
    let broker = connection.status();

    if connection.is_initialized() {
        (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "broker": broker.to_string() }
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "broker": broker.to_string(),
                    "reconnectAttempts": connection.reconnect_attempts(),
                }
            })),
        )
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        amqp_worker::render_metrics(),
    )
}

async fn list_queues(State(state): State<AdminState>) -> Json<Vec<QueueSummary>> {
    let mut summaries = Vec::new();
    for (alias, stats) in state.queue.all_stats().await {
        let Some(queue) = QueueName::lookup(alias) else {
            continue;
        };
        summaries.push(QueueSummary {
            queue: alias,
            physical_name: queue.physical(),
            stats,
            broker_depth: state.queue.broker_depth(alias).await,
        });
    }
    Json(summaries)
}

async fn queue_stats(
    State(state): State<AdminState>,
    Path(alias): Path<String>,
) -> JobResult<Json<QueueStatsView>> {
    let queue = lookup(&alias)?;
    Ok(Json(state.queue.stats(queue.alias()).await))
}

/// Latest stored snapshot, or a live one when none was recorded yet
async fn queue_health(
    State(state): State<AdminState>,
    Path(alias): Path<String>,
) -> JobResult<Json<QueueHealth>> {
    let queue = lookup(&alias)?;
    match state.queue.latest_health(queue.alias()).await? {
        Some(health) => Ok(Json(health)),
        None => Ok(Json(state.queue.health_monitor().snapshot(queue).await?)),
    }
}

async fn pause_queue(
    State(state): State<AdminState>,
    Path(alias): Path<String>,
) -> JobResult<Json<Value>> {
    let queue = lookup(&alias)?;
    let cancelled = state.queue.pause_queue(queue.alias()).await?;
    Ok(Json(json!({
        "queue": queue.alias(),
        "cancelled": cancelled,
    })))
}

async fn get_job(
    State(state): State<AdminState>,
    Path(job_id): Path<String>,
) -> JobResult<Json<JobStatusView>> {
    state
        .queue
        .status(&job_id)
        .await
        .map(Json)
        .ok_or(JobError::NotFound(job_id))
}

async fn job_history(
    State(state): State<AdminState>,
    Path(job_id): Path<String>,
) -> JobResult<Json<Vec<JobHistory>>> {
    Ok(Json(state.queue.history(&job_id).await?))
}
