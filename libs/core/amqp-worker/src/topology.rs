//! Declarative exchange/queue/binding graph.
//!
//! A `Topology` is built once from compiled-in constants and declared on every
//! fresh channel. AMQP declarations are idempotent, so re-running `declare`
//! against an already configured broker is a no-op.

use crate::channel::{BindingSpec, BrokerChannel, ExchangeSpec, QueueSpec};
use crate::error::AmqpError;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        if !self.exchanges.iter().any(|e| e.name == spec.name) {
            self.exchanges.push(spec);
        }
        self
    }

    pub fn queue(mut self, spec: QueueSpec) -> Self {
        if !self.queues.iter().any(|q| q.name == spec.name) {
            self.queues.push(spec);
        }
        self
    }

    pub fn bind(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        let binding = BindingSpec::new(queue, exchange, pattern);
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Declare exchanges, then queues, then bindings.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            debug!(exchange = %exchange.name, kind = ?exchange.kind, "Declaring exchange");
            channel.declare_exchange(exchange).await?;
        }

        for queue in &self.queues {
            debug!(queue = %queue.name, "Declaring queue");
            channel.declare_queue(queue).await?;
        }

        for binding in &self.bindings {
            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                pattern = %binding.pattern,
                "Binding queue"
            );
            channel.bind_queue(binding).await?;
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "Topology declared"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn topology() -> Topology {
        Topology::new()
            .exchange(ExchangeSpec::topic("sync"))
            .exchange(ExchangeSpec::direct("dead-letter"))
            .queue(
                QueueSpec::durable("sync.marketplace")
                    .with_max_priority(10)
                    .with_dead_letter("dead-letter", "failed"),
            )
            .queue(QueueSpec::durable("jobs.dead-letter"))
            .bind("sync.marketplace", "sync", "sync.marketplace.#")
            .bind("jobs.dead-letter", "dead-letter", "failed")
    }

    #[test]
    fn test_builder_deduplicates() {
        let t = topology()
            .exchange(ExchangeSpec::topic("sync"))
            .bind("sync.marketplace", "sync", "sync.marketplace.#");
        assert_eq!(t.exchanges.len(), 2);
        assert_eq!(t.bindings.len(), 2);
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = InMemoryBroker::new();
        let t = topology();

        t.declare(&broker).await.unwrap();
        t.declare(&broker).await.unwrap();

        assert_eq!(broker.bindings("sync.marketplace").len(), 1);
        assert!(broker.has_queue("jobs.dead-letter"));
    }

    #[tokio::test]
    async fn test_conflicting_redeclaration_fails() {
        let broker = InMemoryBroker::new();
        topology().declare(&broker).await.unwrap();

        let conflicting = Topology::new().queue(QueueSpec::durable("sync.marketplace"));
        let err = conflicting.declare(&broker).await.unwrap_err();
        assert!(matches!(err, AmqpError::Topology(_)));
    }

    #[tokio::test]
    async fn test_binding_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        let t = Topology::new()
            .queue(QueueSpec::durable("q"))
            .bind("q", "missing", "q.#");
        assert!(t.declare(&broker).await.is_err());
    }
}
