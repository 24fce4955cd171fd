//! AMQP Worker Framework
//!
//! Broker plumbing shared by every job queue in the workspace.
//!
//! ## Features
//!
//! - **Channel seam**: `BrokerChannel` trait with a lapin implementation and an in-memory broker
//! - **Connection manager**: one connection per process, exponential-backoff reconnection
//! - **Topology**: idempotent exchange/queue/binding declaration with dead-letter routing
//! - **Prometheus metrics**: connection health counters and the shared recorder
//!
//! ## Example
//!
//! ```ignore
//! use amqp_worker::{ConnectionManager, LapinConnector, Topology, ExchangeSpec, QueueSpec};
//!
//! let topology = Topology::new()
//!     .exchange(ExchangeSpec::topic("sync"))
//!     .queue(QueueSpec::durable("sync.marketplace").with_max_priority(10))
//!     .bind("sync.marketplace", "sync", "sync.marketplace.#");
//!
//! let manager = ConnectionManager::builder(Arc::new(LapinConnector::new(url, "jobs")))
//!     .with_topology(topology)
//!     .build();
//! manager.initialize().await?;
//! ```

mod channel;
mod connection;
mod error;
mod memory;
pub mod metrics;
mod rabbit;
mod retry;
mod topology;

pub use channel::{
    BindingSpec, BrokerChannel, DeadLetterSpec, Delivery, DeliveryAcker, DeliveryStream,
    ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};
pub use connection::{
    BrokerConnector, BrokerSession, ConnectionManager, ConnectionManagerBuilder, ConnectionStatus,
};
pub use error::{AmqpError, ErrorCategory};
pub use memory::{InMemoryBroker, InMemoryConnector, PublishedMessage, topic_matches};
pub use metrics::{ConnectionMetrics, init_metrics, render_metrics};
pub use rabbit::{LapinChannel, LapinConnector};
pub use retry::{InstantSleeper, ReconnectPolicy, Sleeper, TokioSleeper};
pub use topology::Topology;
