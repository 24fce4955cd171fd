//! Broker channel seam.
//!
//! `BrokerChannel` is the only surface the rest of the workspace uses to talk
//! to the broker. `LapinChannel` implements it on top of lapin and
//! `InMemoryBroker` implements it for tests.

use crate::error::AmqpError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Exchange routing kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Pattern routing (`*` = one word, `#` = zero or more words)
    Topic,
    /// Exact routing key match
    Direct,
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    /// Durable direct exchange
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

/// Dead-letter routing attached to a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSpec {
    pub exchange: String,
    pub routing_key: String,
}

/// Queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Broker-native priority ceiling (`x-max-priority`)
    pub max_priority: Option<u8>,
    /// `x-dead-letter-exchange` / `x-dead-letter-routing-key`
    pub dead_letter: Option<DeadLetterSpec>,
}

impl QueueSpec {
    /// Durable queue without priority or dead-lettering
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_priority: None,
            dead_letter: None,
        }
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter = Some(DeadLetterSpec {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }
}

/// Exchange → queue binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            pattern: pattern.into(),
        }
    }
}

/// Delivery metadata attached to a published message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// delivery_mode = 2
    pub persistent: bool,
    /// Broker-native priority (0-10 used)
    pub priority: Option<u8>,
    /// Message expiration in milliseconds
    pub expiration_ms: Option<u64>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
}

impl PublishProperties {
    /// Persistent JSON message
    pub fn persistent_json() -> Self {
        Self {
            persistent: true,
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration_ms = Some(expiration.as_millis() as u64);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Settles a single delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Positive acknowledgement (remove the message)
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negative acknowledgement; `requeue = false` dead-letters the message
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub priority: Option<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        redelivered: bool,
        priority: Option<u8>,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            payload,
            redelivered,
            priority,
            acker,
        }
    }

    /// Acknowledge the delivery (successful processing).
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Negative acknowledge, requesting redelivery.
    pub async fn requeue(self) -> Result<(), AmqpError> {
        self.acker.nack(true).await
    }

    /// Negative acknowledge without requeue (routes to the dead-letter exchange).
    pub async fn dead_letter(self) -> Result<(), AmqpError> {
        self.acker.nack(false).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Stream of deliveries for one consumer tag. Ends when the consumer is
/// cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Operations on a live broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries per consumer
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), AmqpError>;

    /// Publish a message; fails with `AmqpError::Publish` on rejection or back-pressure
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError>;

    /// Start a consumer on `queue` identified by `consumer_tag`
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Cancel a consumer; its stream ends, in-flight deliveries can still be settled
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Number of ready messages in `queue`
    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Close the underlying connection
    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}
