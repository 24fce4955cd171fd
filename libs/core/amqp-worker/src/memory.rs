//! In-process broker used by tests across the workspace.
//!
//! Behaves like a single RabbitMQ vhost: topic/direct routing, `x-max-priority`
//! ordering (FIFO among equal priorities), per-consumer prefetch, requeue,
//! dead-lettering on reject and on message expiration. `sever` simulates a
//! dropped connection: unacked deliveries go back to their queues and every
//! consumer stream ends.

use crate::channel::{
    BindingSpec, BrokerChannel, Delivery, DeliveryAcker, DeliveryStream, ExchangeKind,
    ExchangeSpec, PublishProperties, QueueSpec,
};
use crate::connection::{BrokerConnector, BrokerSession};
use crate::error::AmqpError;
use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A message as it was handed to `publish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    routing_key: String,
    payload: Vec<u8>,
    properties: PublishProperties,
    redelivered: bool,
    expires_at: Option<Instant>,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: Vec<StoredMessage>,
}

impl MemoryQueue {
    fn effective_priority(&self, message: &StoredMessage) -> u8 {
        match self.spec.max_priority {
            Some(cap) => message.properties.priority.unwrap_or(0).min(cap),
            None => 0,
        }
    }
}

struct Unacked {
    consumer_tag: String,
    queue: String,
    message: StoredMessage,
}

enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

struct State {
    open: bool,
    epoch: u64,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<BindingSpec>,
    consumers: HashMap<String, String>,
    unacked: HashMap<u64, Unacked>,
    prefetch: u16,
    next_seq: u64,
    next_delivery_tag: u64,
    published: Vec<PublishedMessage>,
    fail_publishes: bool,
    acked: usize,
    requeued: usize,
    dead_lettered: usize,
    closed_tx: watch::Sender<Option<String>>,
}

impl State {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open {
            Ok(())
        } else {
            Err(AmqpError::connection("channel closed"))
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Route to every bound queue; unroutable messages are dropped.
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> usize {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let Some(kind) = self.exchanges.get(exchange).map(|e| e.kind) else {
                return 0;
            };
            let mut targets = Vec::new();
            for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
                let matched = match kind {
                    ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
                    ExchangeKind::Direct => binding.pattern == routing_key,
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        for queue in &targets {
            let seq = self.next_seq();
            if let Some(q) = self.queues.get_mut(queue) {
                let mut copy = message.clone();
                copy.seq = seq;
                q.ready.push(copy);
            }
        }
        targets.len()
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(dead_letter) = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter.clone())
        else {
            return;
        };
        message.properties.expiration_ms = None;
        message.expires_at = None;
        message.redelivered = false;
        message.routing_key = dead_letter.routing_key.clone();
        self.dead_lettered += 1;
        self.route(&dead_letter.exchange, &dead_letter.routing_key, message);
    }

    /// Dead-letter every expired message in `queue`. Returns true if any expired.
    fn expire(&mut self, queue: &str, now: Instant) -> bool {
        let expired: Vec<StoredMessage> = match self.queues.get_mut(queue) {
            Some(q) => {
                let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut q.ready)
                    .into_iter()
                    .partition(|m| m.expires_at.is_some_and(|at| at <= now));
                q.ready = keep;
                expired
            }
            None => return false,
        };
        let any = !expired.is_empty();
        for message in expired {
            self.dead_letter(queue, message);
        }
        any
    }

    fn earliest_expiry(&self, queue: &str) -> Option<Instant> {
        self.queues
            .get(queue)?
            .ready
            .iter()
            .filter_map(|m| m.expires_at)
            .min()
    }

    /// Highest priority first, FIFO among equals.
    fn take_next(&mut self, queue: &str) -> Option<StoredMessage> {
        let q = self.queues.get_mut(queue)?;
        let index = q
            .ready
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                q.effective_priority(a)
                    .cmp(&q.effective_priority(b))
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)?;
        Some(q.ready.remove(index))
    }

    fn unacked_for(&self, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer_tag == consumer_tag)
            .count()
    }
}

struct Shared {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

/// In-process stand-in for the broker.
///
/// Cloning shares the same broker. Implements `BrokerChannel` directly;
/// `InMemoryConnector` hands it out as a session.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(None);
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    open: true,
                    epoch: 0,
                    exchanges: HashMap::new(),
                    queues: HashMap::new(),
                    bindings: Vec::new(),
                    consumers: HashMap::new(),
                    unacked: HashMap::new(),
                    prefetch: 0,
                    next_seq: 0,
                    next_delivery_tag: 0,
                    published: Vec::new(),
                    fail_publishes: false,
                    acked: 0,
                    requeued: 0,
                    dead_lettered: 0,
                    closed_tx,
                }),
                changed,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.shared.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Drop the connection: unacked deliveries return to their queues
    /// (flagged redelivered), consumers are forgotten and their streams end.
    pub fn sever(&self, reason: impl Into<String>) {
        {
            let mut state = self.state();
            state.open = false;
            state.epoch += 1;
            state.consumers.clear();
            let mut unacked: Vec<Unacked> = state.unacked.drain().map(|(_, u)| u).collect();
            unacked.sort_by_key(|u| u.message.seq);
            for entry in unacked {
                if let Some(q) = state.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    q.ready.push(message);
                }
            }
            state.closed_tx.send_replace(Some(reason.into()));
        }
        self.notify();
    }

    /// Accept a new connection, returning its close signal.
    pub fn reopen(&self) -> watch::Receiver<Option<String>> {
        let (closed_tx, closed_rx) = watch::channel(None);
        {
            let mut state = self.state();
            state.closed_tx = closed_tx;
            state.open = true;
        }
        self.notify();
        closed_rx
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Make every subsequent publish fail until reset
    pub fn fail_publishes(&self, fail: bool) {
        self.state().fail_publishes = fail;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.state().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn bindings(&self, queue: &str) -> Vec<BindingSpec> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .cloned()
            .collect()
    }

    /// Ready (not in-flight) messages in `queue`, after applying expiration
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queue_payloads(queue).len()
    }

    /// Ready payloads in delivery order
    pub fn queue_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        let (payloads, expired) = {
            let mut state = self.state();
            let expired = state.expire(queue, Instant::now());
            let mut ready: Vec<(u8, u64, Vec<u8>)> = match state.queues.get(queue) {
                Some(q) => q
                    .ready
                    .iter()
                    .map(|m| (q.effective_priority(m), m.seq, m.payload.clone()))
                    .collect(),
                None => Vec::new(),
            };
            ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            (
                ready.into_iter().map(|(_, _, p)| p).collect::<Vec<_>>(),
                expired,
            )
        };
        if expired {
            self.notify();
        }
        payloads
    }

    pub fn prefetch(&self) -> u16 {
        self.state().prefetch
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        let mut tags: Vec<String> = self
            .state()
            .consumers
            .iter()
            .filter(|(_, q)| q.as_str() == queue)
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.sort();
        tags
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn acked_count(&self) -> usize {
        self.state().acked
    }

    pub fn requeued_count(&self) -> usize {
        self.state().requeued
    }

    pub fn dead_lettered_count(&self) -> usize {
        self.state().dead_lettered
    }

    fn settle(&self, delivery_tag: u64, epoch: u64, action: Settle) -> Result<(), AmqpError> {
        {
            let mut state = self.state();
            if !state.open || state.epoch != epoch {
                return Err(AmqpError::connection(
                    "channel closed before delivery was settled",
                ));
            }
            let Some(entry) = state.unacked.remove(&delivery_tag) else {
                return Err(AmqpError::consumer(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )));
            };
            match action {
                Settle::Ack => state.acked += 1,
                Settle::Requeue => {
                    state.requeued += 1;
                    let seq = state.next_seq();
                    let mut message = entry.message;
                    message.seq = seq;
                    message.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&entry.queue) {
                        q.ready.push(message);
                    }
                }
                Settle::DeadLetter => state.dead_letter(&entry.queue, entry.message),
            }
        }
        self.notify();
        Ok(())
    }

    fn poll_consumer(&self, consumer: &ConsumerCursor) -> Step {
        let mut state = self.state();
        if !state.open
            || state.epoch != consumer.epoch
            || !state.consumers.contains_key(&consumer.tag)
        {
            return Step::Closed;
        }

        let expired = state.expire(&consumer.queue, Instant::now());
        let prefetch = state.prefetch as usize;
        let can_take = prefetch == 0 || state.unacked_for(&consumer.tag) < prefetch;
        let next = if can_take {
            state.take_next(&consumer.queue)
        } else {
            None
        };

        match next {
            Some(message) => {
                state.next_delivery_tag += 1;
                let delivery_tag = state.next_delivery_tag;
                let delivery = Delivery::new(
                    delivery_tag,
                    message.routing_key.clone(),
                    message.payload.clone(),
                    message.redelivered,
                    message.properties.priority,
                    Box::new(MemoryAcker {
                        broker: self.clone(),
                        delivery_tag,
                        epoch: consumer.epoch,
                    }),
                );
                state.unacked.insert(
                    delivery_tag,
                    Unacked {
                        consumer_tag: consumer.tag.clone(),
                        queue: consumer.queue.clone(),
                        message,
                    },
                );
                Step::Deliver(delivery, expired)
            }
            None => Step::Wait(state.earliest_expiry(&consumer.queue), expired),
        }
    }
}

struct ConsumerCursor {
    broker: InMemoryBroker,
    queue: String,
    tag: String,
    epoch: u64,
    changed: watch::Receiver<u64>,
}

enum Step {
    Deliver(Delivery, bool),
    Wait(Option<Instant>, bool),
    Closed,
}

async fn next_delivery(cursor: &mut ConsumerCursor) -> Option<Delivery> {
    loop {
        cursor.changed.borrow_and_update();
        let wait_until = match cursor.broker.poll_consumer(cursor) {
            Step::Closed => return None,
            Step::Deliver(delivery, expired) => {
                if expired {
                    cursor.broker.notify();
                }
                return Some(delivery);
            }
            Step::Wait(wait_until, expired) => {
                if expired {
                    cursor.broker.notify();
                }
                wait_until
            }
        };

        match wait_until {
            Some(deadline) => {
                tokio::select! {
                    changed = cursor.changed.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => {
                if cursor.changed.changed().await.is_err() {
                    return None;
                }
            }
        }
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    delivery_tag: u64,
    epoch: u64,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker
            .settle(self.delivery_tag, self.epoch, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let action = if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        };
        self.broker.settle(self.delivery_tag, self.epoch, action)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        state.prefetch = count;
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(AmqpError::topology(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(AmqpError::topology(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    MemoryQueue {
                        spec: spec.clone(),
                        ready: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(AmqpError::topology(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(AmqpError::topology(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        {
            let mut state = self.state();
            state.ensure_open()?;
            if state.fail_publishes {
                return Err(AmqpError::publish("broker refused publish"));
            }
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(AmqpError::publish(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }

            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                properties: properties.clone(),
            });

            let message = StoredMessage {
                seq: 0,
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                properties: properties.clone(),
                redelivered: false,
                expires_at: properties
                    .expiration_ms
                    .map(|ms| Instant::now() + Duration::from_millis(ms)),
            };
            state.route(exchange, routing_key, message);
        }
        self.notify();
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let epoch = {
            let mut state = self.state();
            state.ensure_open()?;
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::consumer(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            if state.consumers.contains_key(consumer_tag) {
                return Err(AmqpError::consumer(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                    consumer_tag
                )));
            }
            state
                .consumers
                .insert(consumer_tag.to_string(), queue.to_string());
            state.epoch
        };

        let cursor = ConsumerCursor {
            broker: self.clone(),
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            epoch,
            changed: self.shared.changed.subscribe(),
        };

        let deliveries = stream::unfold(cursor, |mut cursor| async move {
            next_delivery(&mut cursor)
                .await
                .map(|delivery| (Ok(delivery), cursor))
        });

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        {
            let mut state = self.state();
            state.ensure_open()?;
            state.consumers.remove(consumer_tag);
        }
        self.notify();
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        {
            let state = self.state();
            state.ensure_open()?;
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::topology(format!("NOT_FOUND - no queue '{}'", queue)));
            }
        }
        Ok(self.queue_len(queue) as u32)
    }
}

/// Hands out sessions on an `InMemoryBroker`, optionally refusing the next
/// few connection attempts.
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            fail_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Total connection attempts, successful or not
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<BrokerSession, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::connection("connection refused"));
        }

        let closed = self.broker.reopen();
        Ok(BrokerSession {
            channel: Arc::new(self.broker.clone()),
            closed,
        })
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// AMQP topic pattern match: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;
    use futures::StreamExt;

    async fn broker_with_queue() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
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
            .declare(&broker)
            .await
            .unwrap();
        broker
    }

    async fn publish(broker: &InMemoryBroker, key: &str, body: &str, priority: u8) {
        broker
            .publish(
                "sync",
                key,
                body.as_bytes(),
                &PublishProperties::persistent_json().with_priority(priority),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("sync.marketplace.#", "sync.marketplace.high"));
        assert!(topic_matches("sync.marketplace.#", "sync.marketplace"));
        assert!(topic_matches("sync.*.low", "sync.products.low"));
        assert!(!topic_matches("sync.*.low", "sync.products.high"));
        assert!(!topic_matches("sync.marketplace.#", "sync.products.normal"));
        assert!(topic_matches("#", "anything.at.all"));
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let broker = broker_with_queue().await;
        publish(&broker, "sync.marketplace.low", "low", 2).await;
        publish(&broker, "sync.marketplace.normal", "normal-1", 5).await;
        publish(&broker, "sync.marketplace.critical", "critical", 10).await;
        publish(&broker, "sync.marketplace.normal", "normal-2", 5).await;

        let order: Vec<String> = broker
            .queue_payloads("sync.marketplace")
            .into_iter()
            .map(|p| String::from_utf8(p).unwrap())
            .collect();
        assert_eq!(order, vec!["critical", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_unroutable_message_is_dropped() {
        let broker = broker_with_queue().await;
        publish(&broker, "sync.products.high", "x", 8).await;
        assert_eq!(broker.queue_len("sync.marketplace"), 0);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = broker_with_queue().await;
        broker.set_prefetch(1).await.unwrap();
        publish(&broker, "sync.marketplace.normal", "a", 5).await;
        publish(&broker, "sync.marketplace.normal", "b", 5).await;

        let mut stream = broker.consume("sync.marketplace", "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"b");
        assert_eq!(broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let broker = broker_with_queue().await;
        publish(&broker, "sync.marketplace.normal", "a", 5).await;

        let mut stream = broker.consume("sync.marketplace", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        delivery.requeue().await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(broker.requeued_count(), 1);
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter() {
        let broker = broker_with_queue().await;
        publish(&broker, "sync.marketplace.normal", "a", 5).await;

        let mut stream = broker.consume("sync.marketplace", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.dead_letter().await.unwrap();

        assert_eq!(broker.queue_len("sync.marketplace"), 0);
        assert_eq!(broker.queue_payloads("jobs.dead-letter"), vec![b"a".to_vec()]);
        assert_eq!(broker.dead_lettered_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_dead_lettered() {
        let broker = broker_with_queue().await;
        broker
            .publish(
                "sync",
                "sync.marketplace.normal",
                b"later",
                &PublishProperties::persistent_json().with_expiration(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        assert_eq!(broker.queue_len("sync.marketplace"), 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(broker.queue_len("sync.marketplace"), 0);
        assert_eq!(broker.queue_len("jobs.dead-letter"), 1);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let broker = broker_with_queue().await;
        let mut stream = broker.consume("sync.marketplace", "c1").await.unwrap();
        assert_eq!(broker.consumer_tags("sync.marketplace"), vec!["c1"]);

        broker.cancel("c1").await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(broker.consumer_tags("sync.marketplace").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_consumer_tag_rejected() {
        let broker = broker_with_queue().await;
        let _stream = broker.consume("sync.marketplace", "c1").await.unwrap();
        assert!(broker.consume("sync.marketplace", "c1").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_failure_toggle() {
        let broker = broker_with_queue().await;
        broker.fail_publishes(true);
        let err = broker
            .publish("sync", "sync.marketplace.low", b"x", &PublishProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::Publish(_)));
    }

    #[tokio::test]
    async fn test_sever_requeues_unacked_and_closes_streams() {
        let broker = broker_with_queue().await;
        publish(&broker, "sync.marketplace.normal", "a", 5).await;

        let mut stream = broker.consume("sync.marketplace", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.sever("connection reset");
        assert!(stream.next().await.is_none());
        assert!(delivery.ack().await.is_err());
        assert!(broker.publish("sync", "sync.marketplace.low", b"x", &PublishProperties::default()).await.is_err());

        broker.reopen();
        let mut stream = broker.consume("sync.marketplace", "c1").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.payload, b"a");
    }

    #[tokio::test]
    async fn test_connector_refuses_then_connects() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        connector.fail_next(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
