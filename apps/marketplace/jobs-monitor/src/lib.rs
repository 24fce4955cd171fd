//! Jobs Monitor Service
//!
//! Owns the broker topology and watches the job queues.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ (sync / products / ai / dead-letter exchanges)
//!   ↑ (declare topology, reconnect with backoff)
//! ConnectionManager
//!   ↓
//! JobQueue ──→ MongoDB (jobs, job_history, queue_health)
//!   ↓
//! QueueHealthMonitor (snapshot every HEALTH_SNAPSHOT_INTERVAL_SECS)
//!   ↓
//! Admin HTTP: /health /ready /metrics /queues /jobs
//! ```
//!
//! ## Features
//!
//! - Starts in degraded mode when the broker is down and keeps reconnecting
//! - Periodic queue health snapshots persisted for dashboards
//! - Prometheus metrics for connection state and job throughput
//! - Graceful shutdown on SIGINT/SIGTERM

use amqp_worker::{ConnectionManager, LapinConnector, ReconnectPolicy};
use axum::Router;
use core_config::{AmqpConfig, FromEnv, MongoConfig, ServerConfig, app_info, env_parse};
use domain_jobs::{AdminState, JobQueue, MongoJobRepository, queues};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

/// Monitor-specific settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// How often queue health is snapshotted
    pub snapshot_interval: Duration,
    /// Upper bound on consumer and connection cleanup at shutdown
    pub shutdown_timeout: Duration,
}

impl FromEnv for MonitorConfig {
    /// - HEALTH_SNAPSHOT_INTERVAL_SECS: defaults to 60
    /// - SHUTDOWN_TIMEOUT_SECS: defaults to 30
    fn from_env() -> Result<Self, core_config::ConfigError> {
        let interval: u64 = env_parse("HEALTH_SNAPSHOT_INTERVAL_SECS", 60)?;
        Ok(Self {
            snapshot_interval: Duration::from_secs(interval.max(1)),
            shutdown_timeout: Duration::from_secs(env_parse("SHUTDOWN_TIMEOUT_SECS", 30)?),
        })
    }
}

/// Build the broker connection manager from config
pub fn connection_manager(config: &AmqpConfig) -> ConnectionManager {
    let connector = LapinConnector::new(config.url.clone(), config.connection_name.clone());
    ConnectionManager::builder(Arc::new(connector))
        .with_policy(
            ReconnectPolicy::new()
                .with_base_delay(config.reconnect_base_delay)
                .with_max_attempts(config.max_reconnect_attempts),
        )
        .with_prefetch(config.prefetch)
        .with_topology(queues::topology())
        .build()
}

/// Admin router with request tracing
pub fn app(state: AdminState) -> Router {
    domain_jobs::router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

async fn connect_store(config: &MongoConfig) -> Result<MongoJobRepository> {
    let client = mongodb::Client::with_uri_str(&config.uri)
        .await
        .wrap_err("Failed to create MongoDB client")?;
    let repository = MongoJobRepository::new(&client.database(&config.database));
    repository
        .init_indexes()
        .await
        .wrap_err("Failed to create job store indexes")?;
    Ok(repository)
}

/// Run the jobs monitor
///
/// 1. Sets up color-eyre, tracing and the Prometheus recorder
/// 2. Connects to MongoDB and creates the job store indexes
/// 3. Connects to the broker and declares the topology (degraded mode on failure)
/// 4. Runs the health monitor and the admin server until a shutdown signal
///
/// # Errors
///
/// Returns an error if configuration is invalid, MongoDB is unreachable or
/// the admin server cannot bind. A broker outage is not an error.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = core_config::Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    amqp_worker::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting jobs monitor");
    info!("Environment: {:?}", environment);

    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    let amqp_config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    let mongo_config = MongoConfig::from_env().wrap_err("Failed to load MongoDB configuration")?;
    let monitor_config = MonitorConfig::from_env().wrap_err("Failed to load monitor configuration")?;

    info!(database = %mongo_config.database, "Connecting to MongoDB...");
    let repository = connect_store(&mongo_config).await?;
    info!("Job store ready");

    let queue = Arc::new(JobQueue::new(
        connection_manager(&amqp_config),
        Arc::new(repository),
    ));

    info!(url = %amqp_config.redacted_url(), "Connecting to broker...");
    if let Err(e) = queue.initialize().await {
        warn!(error = %e, "Broker unavailable at startup, serving in degraded mode");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let monitor = queue.health_monitor().clone();
    let monitor_shutdown = shutdown_rx.clone();
    let interval = monitor_config.snapshot_interval;
    let monitor_task = tokio::spawn(async move { monitor.run(interval, monitor_shutdown).await });

    let listener = TcpListener::bind(server_config.address())
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", server_config.address()))?;
    info!(address = %server_config.address(), "Admin server listening");

    let state = AdminState::new(queue.clone(), app_info.name, app_info.version);
    let mut server_shutdown = shutdown_rx.clone();
    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("Admin server failed");

    info!(timeout = ?monitor_config.shutdown_timeout, "Stopping consumers and broker connection");
    let cleanup = async {
        if let Err(e) = monitor_task.await {
            error!(error = %e, "Health monitor task failed");
        }
        queue.shutdown().await;
    };
    if tokio::time::timeout(monitor_config.shutdown_timeout, cleanup)
        .await
        .is_err()
    {
        warn!(timeout = ?monitor_config.shutdown_timeout, "Cleanup exceeded timeout, forcing shutdown");
    }

    served?;
    info!("Jobs monitor stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_config_defaults() {
        temp_env::with_vars_unset(["HEALTH_SNAPSHOT_INTERVAL_SECS", "SHUTDOWN_TIMEOUT_SECS"], || {
            let config = MonitorConfig::from_env().unwrap();
            assert_eq!(config.snapshot_interval, Duration::from_secs(60));
            assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        });
    }

    #[test]
    fn test_monitor_config_overrides() {
        temp_env::with_vars(
            [
                ("HEALTH_SNAPSHOT_INTERVAL_SECS", Some("0")),
                ("SHUTDOWN_TIMEOUT_SECS", Some("5")),
            ],
            || {
                let config = MonitorConfig::from_env().unwrap();
                assert_eq!(config.snapshot_interval, Duration::from_secs(1));
                assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
            },
        );
        temp_env::with_var("HEALTH_SNAPSHOT_INTERVAL_SECS", Some("soon"), || {
            assert!(MonitorConfig::from_env().is_err());
        });
    }

    #[tokio::test]
    async fn test_connection_manager_starts_disconnected() {
        let manager = connection_manager(&AmqpConfig::new("amqp://localhost:5672"));
        assert!(!manager.is_initialized());
        assert_eq!(manager.reconnect_attempts(), 0);
    }
}
