use amqp_worker::{ConnectionManager, InMemoryBroker, InMemoryConnector, InstantSleeper};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::queues;

/// Manager connected to a fresh in-memory broker with the job topology declared
pub(crate) async fn connected() -> (ConnectionManager, InMemoryBroker) {
    let broker = InMemoryBroker::new();
    let manager = disconnected(&broker);
    manager.initialize().await.unwrap();
    (manager, broker)
}

/// Manager that has never been initialized
pub(crate) fn disconnected(broker: &InMemoryBroker) -> ConnectionManager {
    ConnectionManager::builder(Arc::new(InMemoryConnector::new(broker.clone())))
        .with_topology(queues::topology())
        .with_sleeper(Arc::new(InstantSleeper::new()))
        .build()
}

pub(crate) fn payload() -> Value {
    json!({"userId": "u1", "workspaceId": "w1"})
}
