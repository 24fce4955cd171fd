//! Static queue table and broker topology.
//!
//! | Alias              | Queue              | Exchange | Job type           |
//! |--------------------|--------------------|----------|--------------------|
//! | `sync-marketplace` | `sync.marketplace` | `sync`   | `MARKETPLACE_SYNC` |
//! | `sync-products`    | `sync.products`    | `sync`   | `PRODUCT_SYNC`     |
//! | `product-batch`    | `products.batch`   | `products` | `PRODUCT_BATCH`  |
//! | `ai-scan`          | `ai.scan`          | `ai`     | `AI_PRODUCT_SCAN`  |
//! | `ai-optimize`      | `ai.optimize`      | `ai`     | `AI_OPTIMIZATION`  |
//!
//! Every work queue is bound with `<queue>.#`, carries `x-max-priority = 10`
//! and dead-letters to `dead-letter` / `failed`, which feeds `jobs.dead-letter`.

use amqp_worker::{ExchangeSpec, QueueSpec, Topology};
use serde::Serialize;
use strum::{EnumIter, IntoEnumIterator};

use crate::error::{JobError, JobResult};
use crate::models::{JobType, Priority};

pub const DEAD_LETTER_EXCHANGE: &str = "dead-letter";
pub const DEAD_LETTER_QUEUE: &str = "jobs.dead-letter";
pub const DEAD_LETTER_ROUTING_KEY: &str = "failed";
pub const MAX_PRIORITY: u8 = 10;

/// A physical work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Serialize)]
pub enum QueueName {
    SyncMarketplace,
    SyncProducts,
    ProductBatch,
    AiScan,
    AiOptimize,
}

impl QueueName {
    /// Caller-facing alias
    pub const fn alias(self) -> &'static str {
        match self {
            QueueName::SyncMarketplace => "sync-marketplace",
            QueueName::SyncProducts => "sync-products",
            QueueName::ProductBatch => "product-batch",
            QueueName::AiScan => "ai-scan",
            QueueName::AiOptimize => "ai-optimize",
        }
    }

    /// Broker queue name
    pub const fn physical(self) -> &'static str {
        match self {
            QueueName::SyncMarketplace => "sync.marketplace",
            QueueName::SyncProducts => "sync.products",
            QueueName::ProductBatch => "products.batch",
            QueueName::AiScan => "ai.scan",
            QueueName::AiOptimize => "ai.optimize",
        }
    }

    pub const fn exchange(self) -> &'static str {
        match self {
            QueueName::SyncMarketplace | QueueName::SyncProducts => "sync",
            QueueName::ProductBatch => "products",
            QueueName::AiScan | QueueName::AiOptimize => "ai",
        }
    }

    /// The only job type this queue carries
    pub const fn job_type(self) -> JobType {
        match self {
            QueueName::SyncMarketplace => JobType::MarketplaceSync,
            QueueName::SyncProducts => JobType::ProductSync,
            QueueName::ProductBatch => JobType::ProductBatch,
            QueueName::AiScan => JobType::AiProductScan,
            QueueName::AiOptimize => JobType::AiOptimization,
        }
    }

    pub fn binding_pattern(self) -> String {
        format!("{}.#", self.physical())
    }

    /// `<queue>.<priority>`, e.g. `sync.marketplace.high`
    pub fn routing_key(self, priority: Priority) -> String {
        format!("{}.{}", self.physical(), priority.routing_name())
    }

    /// Look up by alias, falling back to the physical name
    pub fn lookup(name: &str) -> Option<Self> {
        Self::iter()
            .find(|q| q.alias() == name)
            .or_else(|| Self::iter().find(|q| q.physical() == name))
    }

    pub fn all() -> impl Iterator<Item = QueueName> {
        Self::iter()
    }
}

/// Map `(alias, job type)` to a queue, rejecting unknown aliases and
/// job types the queue does not carry.
pub fn resolve(alias: &str, job_type: JobType) -> JobResult<QueueName> {
    let queue = QueueName::lookup(alias).ok_or_else(|| JobError::UnknownQueue(alias.to_string()))?;
    if queue.job_type() != job_type {
        return Err(JobError::JobTypeMismatch {
            queue: queue.physical().to_string(),
            expected: queue.job_type(),
            actual: job_type,
        });
    }
    Ok(queue)
}

/// Exchanges, queues and bindings declared on every fresh channel
pub fn topology() -> Topology {
    let mut topology = Topology::new().exchange(ExchangeSpec::direct(DEAD_LETTER_EXCHANGE));

    for queue in QueueName::all() {
        topology = topology
            .exchange(ExchangeSpec::topic(queue.exchange()))
            .queue(
                QueueSpec::durable(queue.physical())
                    .with_max_priority(MAX_PRIORITY)
                    .with_dead_letter(DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY),
            )
            .bind(queue.physical(), queue.exchange(), queue.binding_pattern());
    }

    topology
        .queue(QueueSpec::durable(DEAD_LETTER_QUEUE))
        .bind(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_worker::{ExchangeKind, topic_matches};

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("sync-marketplace", JobType::MarketplaceSync).unwrap(),
            QueueName::SyncMarketplace
        );
        assert_eq!(
            resolve("ai.scan", JobType::AiProductScan).unwrap(),
            QueueName::AiScan
        );
        assert!(matches!(
            resolve("nope", JobType::ProductSync),
            Err(JobError::UnknownQueue(_))
        ));
        assert!(matches!(
            resolve("ai-scan", JobType::ProductSync),
            Err(JobError::JobTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_routing_keys_land_in_their_queue() {
        for queue in QueueName::all() {
            for priority in Priority::iter() {
                let key = queue.routing_key(priority);
                assert!(topic_matches(&queue.binding_pattern(), &key));
                for other in QueueName::all().filter(|o| *o != queue) {
                    assert!(!topic_matches(&other.binding_pattern(), &key));
                }
            }
        }
        assert_eq!(
            QueueName::SyncMarketplace.routing_key(Priority::High),
            "sync.marketplace.high"
        );
    }

    #[test]
    fn test_topology_shape() {
        let topology = topology();

        assert_eq!(topology.exchanges.len(), 4);
        let dlx = topology
            .exchanges
            .iter()
            .find(|e| e.name == DEAD_LETTER_EXCHANGE)
            .unwrap();
        assert_eq!(dlx.kind, ExchangeKind::Direct);

        assert_eq!(topology.queues.len(), 6);
        for queue in topology.queues.iter().filter(|q| q.name != DEAD_LETTER_QUEUE) {
            assert_eq!(queue.max_priority, Some(10));
            let dl = queue.dead_letter.as_ref().unwrap();
            assert_eq!(dl.exchange, "dead-letter");
            assert_eq!(dl.routing_key, "failed");
        }
        let dlq = topology
            .queues
            .iter()
            .find(|q| q.name == DEAD_LETTER_QUEUE)
            .unwrap();
        assert!(dlq.dead_letter.is_none());

        assert_eq!(topology.bindings.len(), 6);
    }
}
