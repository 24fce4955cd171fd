//! Tests against a real RabbitMQ broker (requires Docker).

use amqp_worker::{
    BrokerChannel, ConnectionManager, ConnectionStatus, ExchangeSpec, LapinConnector,
    PublishProperties, QueueSpec, Topology,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use test_utils::TestRabbitMq;

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

async fn connect(rabbit: &TestRabbitMq) -> ConnectionManager {
    let manager = ConnectionManager::builder(Arc::new(LapinConnector::new(
        rabbit.amqp_url(),
        "amqp-worker-tests",
    )))
    .with_topology(topology())
    .build();
    manager.initialize().await.expect("connect to test broker");
    manager
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_topology_redeclaration_is_noop() {
    let rabbit = TestRabbitMq::new().await;
    let manager = connect(&rabbit).await;
    let channel = manager.channel().unwrap();

    topology().declare(channel.as_ref()).await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(channel.message_count("sync.marketplace").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_priority_delivery_and_dead_letter() {
    let rabbit = TestRabbitMq::new().await;
    let manager = connect(&rabbit).await;
    let channel = manager.channel().unwrap();

    for (key, priority) in [("sync.marketplace.low", 2), ("sync.marketplace.critical", 10)] {
        channel
            .publish(
                "sync",
                key,
                key.as_bytes(),
                &PublishProperties::persistent_json().with_priority(priority),
            )
            .await
            .unwrap();
    }

    let mut deliveries = channel.consume("sync.marketplace", "it-1").await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.routing_key, "sync.marketplace.critical");
    first.dead_letter().await.unwrap();

    let second = deliveries.next().await.unwrap().unwrap();
    assert_eq!(second.routing_key, "sync.marketplace.low");
    second.ack().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.message_count("jobs.dead-letter").await.unwrap(), 1);

    channel.cancel("it-1").await.unwrap();
    manager.shutdown().await;
}
