//! Broker connection manager
//!
//! Owns the single connection/channel for the process. A lost connection clears
//! the channel and starts a bounded exponential-backoff reconnect loop; running
//! out of attempts moves the manager to `Fatal` without taking the process down.

use crate::channel::BrokerChannel;
use crate::error::AmqpError;
use crate::metrics::ConnectionMetrics;
use crate::retry::{ReconnectPolicy, Sleeper, TokioSleeper};
use crate::topology::Topology;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// A live connection as handed out by a connector.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    /// Becomes `Some(reason)` when the connection errors or closes
    pub closed: watch::Receiver<Option<String>>,
}

/// Opens broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<BrokerSession, AmqpError>;

    /// Name used in logs
    fn describe(&self) -> String;
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Never connected, or lost and not yet retrying
    Disconnected,
    Connected,
    /// Waiting out a backoff delay
    Reconnecting,
    /// Reconnect attempts exhausted
    Fatal,
    Shutdown,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Fatal => "fatal",
            ConnectionStatus::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    policy: ReconnectPolicy,
    sleeper: Arc<dyn Sleeper>,
    prefetch: u16,
    topology: Topology,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    status: watch::Sender<ConnectionStatus>,
    generation: watch::Sender<u64>,
    reconnecting: AtomicBool,
    attempts: AtomicU32,
    init_lock: Mutex<()>,
    metrics: ConnectionMetrics,
}

/// Builder for [`ConnectionManager`]
pub struct ConnectionManagerBuilder {
    connector: Arc<dyn BrokerConnector>,
    policy: ReconnectPolicy,
    sleeper: Arc<dyn Sleeper>,
    prefetch: u16,
    topology: Topology,
}

impl ConnectionManagerBuilder {
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn build(self) -> ConnectionManager {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (generation, _) = watch::channel(0);
        let metrics = ConnectionMetrics::new(self.connector.describe());
        ConnectionManager {
            inner: Arc::new(Inner {
                connector: self.connector,
                policy: self.policy,
                sleeper: self.sleeper,
                prefetch: self.prefetch,
                topology: self.topology,
                channel: RwLock::new(None),
                status,
                generation,
                reconnecting: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                init_lock: Mutex::new(()),
                metrics,
            }),
        }
    }
}

/// Shared handle to the process-wide broker connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Start building a manager. Defaults: `ReconnectPolicy::default()`,
    /// real sleeps, prefetch 1, empty topology.
    pub fn builder(connector: Arc<dyn BrokerConnector>) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            connector,
            policy: ReconnectPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            prefetch: 1,
            topology: Topology::default(),
        }
    }

    /// Connect, apply prefetch and declare the topology.
    ///
    /// A second call while connected is a no-op. On failure the manager stays
    /// degraded, schedules background reconnection and returns the error for
    /// the caller to log.
    pub async fn initialize(&self) -> Result<(), AmqpError> {
        let _guard = self.inner.init_lock.lock().await;

        if self.is_initialized() {
            debug!("Broker connection already initialized");
            return Ok(());
        }
        if self.status() == ConnectionStatus::Shutdown {
            return Err(AmqpError::NotConnected);
        }

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    connection = %self.inner.connector.describe(),
                    error = %e,
                    "Broker unavailable, running in degraded mode"
                );
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(), AmqpError> {
        let session = self.inner.connector.connect().await?;
        let channel = session.channel;

        channel.set_prefetch(self.inner.prefetch).await?;
        self.inner.topology.declare(channel.as_ref()).await?;

        *self.inner.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.generation.send_modify(|g| *g += 1);
        let generation = *self.inner.generation.borrow();
        self.inner.status.send_replace(ConnectionStatus::Connected);
        self.inner.metrics.connected();

        info!(
            connection = %self.inner.connector.describe(),
            generation,
            prefetch = self.inner.prefetch,
            "Broker connection established"
        );

        self.watch_close(session.closed, generation);
        Ok(())
    }

    fn watch_close(&self, mut closed: watch::Receiver<Option<String>>, generation: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                if let Some(reason) = closed.borrow_and_update().clone() {
                    break reason;
                }
                if closed.changed().await.is_err() {
                    break "connection dropped".to_string();
                }
            };
            manager.connection_lost(generation, &reason);
        });
    }

    fn connection_lost(&self, generation: u64, reason: &str) {
        if *self.inner.generation.borrow() != generation {
            return;
        }
        if matches!(
            self.status(),
            ConnectionStatus::Shutdown | ConnectionStatus::Fatal
        ) {
            return;
        }

        *self.inner.channel.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.status.send_replace(ConnectionStatus::Disconnected);
        self.inner.metrics.disconnected();
        warn!(generation, reason = %reason, "Broker connection lost");

        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect_loop().await;
            manager.inner.reconnecting.store(false, Ordering::SeqCst);

            // Lost again between establishing and clearing the flag
            if !manager.is_initialized()
                && manager.status() == ConnectionStatus::Disconnected
            {
                manager.schedule_reconnect();
            }
        });
    }

    async fn reconnect_loop(&self) {
        let mut attempt = 0;
        loop {
            if self.status() == ConnectionStatus::Shutdown {
                return;
            }

            attempt += 1;
            let Some(delay) = self.inner.policy.next_delay(attempt) else {
                let attempts = attempt - 1;
                error!(
                    connection = %self.inner.connector.describe(),
                    attempts,
                    error = %AmqpError::ReconnectExhausted { attempts },
                    "Broker reconnection abandoned, operator intervention required"
                );
                self.inner.status.send_replace(ConnectionStatus::Fatal);
                self.inner.metrics.reconnect_exhausted();
                return;
            };

            self.inner.attempts.store(attempt, Ordering::SeqCst);
            self.inner.status.send_replace(ConnectionStatus::Reconnecting);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling broker reconnect"
            );
            self.inner.sleeper.sleep(delay).await;

            if self.status() == ConnectionStatus::Shutdown {
                return;
            }
            self.inner.metrics.reconnect_attempt();

            let _guard = self.inner.init_lock.lock().await;
            if self.is_initialized() {
                return;
            }
            match self.establish().await {
                Ok(()) => {
                    info!(attempt, "Broker reconnected");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Broker reconnect failed"),
            }
        }
    }

    /// The live channel, `None` in degraded mode.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner
            .channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.channel().is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn is_fatal(&self) -> bool {
        self.status() == ConnectionStatus::Fatal
    }

    /// Subscribe to status changes; fires with `Fatal` on exhaustion.
    pub fn status_signal(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Bumped on every successful (re)connect.
    pub fn generation_signal(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    /// Current reconnect attempt, 0 when connected.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Wait until a channel is available. `None` once fatal or shut down.
    pub async fn wait_ready(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut status = self.inner.status.subscribe();
        loop {
            if let Some(channel) = self.channel() {
                return Some(channel);
            }
            if matches!(
                *status.borrow_and_update(),
                ConnectionStatus::Fatal | ConnectionStatus::Shutdown
            ) {
                return None;
            }
            if status.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Stop reconnecting and close the live connection.
    pub async fn shutdown(&self) {
        self.inner.status.send_replace(ConnectionStatus::Shutdown);
        let channel = self
            .inner
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Error closing broker connection");
            }
        }
        info!("Broker connection shut down");
    }
}
