//! lapin-backed `BrokerChannel` and `BrokerConnector`.

use crate::channel::{
    BindingSpec, BrokerChannel, Delivery, DeliveryAcker, DeliveryStream, ExchangeKind,
    ExchangeSpec, PublishProperties, QueueSpec,
};
use crate::connection::{BrokerConnector, BrokerSession};
use crate::error::AmqpError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// A single lapin connection + channel.
///
/// lapin channels are not meant for interleaved use from many tasks, so every
/// operation takes the channel lock first.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
    lock: Mutex<()>,
}

impl LapinChannel {
    pub fn new(connection: Connection, channel: Channel) -> Self {
        Self {
            connection,
            channel,
            lock: Mutex::new(()),
        }
    }

    fn queue_arguments(spec: &QueueSpec) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(max_priority) = spec.max_priority {
            arguments.insert(
                "x-max-priority".into(),
                AMQPValue::ShortShortUInt(max_priority),
            );
        }
        if let Some(dead_letter) = &spec.dead_letter {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dead_letter.exchange.clone().into()),
            );
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dead_letter.routing_key.clone().into()),
            );
        }
        arguments
    }

    fn basic_properties(properties: &PublishProperties) -> BasicProperties {
        let mut basic = BasicProperties::default();
        if properties.persistent {
            basic = basic.with_delivery_mode(2);
        }
        if let Some(priority) = properties.priority {
            basic = basic.with_priority(priority);
        }
        if let Some(expiration) = properties.expiration_ms {
            basic = basic.with_expiration(ShortString::from(expiration.to_string()));
        }
        if let Some(content_type) = &properties.content_type {
            basic = basic.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(message_id) = &properties.message_id {
            basic = basic.with_message_id(ShortString::from(message_id.clone()));
        }
        basic
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        let kind = match spec.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| AmqpError::topology(format!("exchange '{}': {}", spec.name, e)))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                Self::queue_arguments(spec),
            )
            .await
            .map_err(|e| AmqpError::topology(format!("queue '{}': {}", spec.name, e)))?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                AmqpError::topology(format!(
                    "binding '{}' -> '{}' ({}): {}",
                    binding.exchange, binding.queue, binding.pattern, e
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                Self::basic_properties(properties),
            )
            .await
            .map_err(|e| AmqpError::publish(e.to_string()))?;

        match confirm.await.map_err(|e| AmqpError::publish(e.to_string()))? {
            Confirmation::Nack(_) => Err(AmqpError::publish(format!(
                "broker rejected message for {}/{}",
                exchange, routing_key
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = {
            let _guard = self.lock.lock().await;
            self.channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| AmqpError::consumer(format!("consume '{}': {}", queue, e)))?
        };

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");

        let stream = consumer.map(|result| {
            result.map_err(AmqpError::from).map(|delivery| {
                let priority = *delivery.properties.priority();
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.routing_key.as_str(),
                    delivery.data,
                    delivery.redelivered,
                    priority,
                    Box::new(LapinAcker {
                        acker: delivery.acker,
                    }),
                )
            })
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| AmqpError::consumer(format!("cancel '{}': {}", consumer_tag, e)))
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        let _guard = self.lock.lock().await;
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(declared.message_count())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        if let Err(e) = self.channel.close(200, "shutdown").await {
            debug!(error = %e, "Channel close failed");
        }
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

/// Opens lapin connections with publisher confirms enabled.
pub struct LapinConnector {
    url: String,
    connection_name: String,
}

impl LapinConnector {
    pub fn new(url: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self) -> Result<BrokerSession, AmqpError> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());

        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|e| AmqpError::connection(e.to_string()))?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let name = self.connection_name.clone();
        connection.on_error(move |err| {
            error!(connection = %name, error = %err, "Broker connection error");
            closed_tx.send_replace(Some(err.to_string()));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AmqpError::connection(e.to_string()))?;

        if let Err(e) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            warn!(error = %e, "Publisher confirms unavailable");
        }

        info!(connection = %self.connection_name, "Connected to broker");

        Ok(BrokerSession {
            channel: std::sync::Arc::new(LapinChannel::new(connection, channel)),
            closed: closed_rx,
        })
    }

    fn describe(&self) -> String {
        self.connection_name.clone()
    }
}
