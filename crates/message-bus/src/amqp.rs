//! `Broker` backed by a real AMQP broker over `lapin`. Owns a single
//! connection with exponential-backoff reconnect; on reconnect it
//! re-declares the exchange and the caller re-declares its known queues
//! (spec §4.3).

use crate::{Broker, BrokerError, Payload};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub const DEFAULT_EXCHANGE: &str = "hub.routing";

#[derive(Debug, Clone)]
pub struct AmqpBrokerConfig {
    pub url: String,
    pub exchange: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_attempts: u32,
}

impl Default for AmqpBrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672/%2f".into(),
            exchange: DEFAULT_EXCHANGE.into(),
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_attempts: 5,
        }
    }
}

/// Owns the single broker connection. Guarded by its own mutex (spec §5);
/// no other part of the core touches `lapin` directly.
pub struct AmqpBroker {
    config: AmqpBrokerConfig,
    state: Mutex<Option<(Connection, Channel)>>,
}

impl AmqpBroker {
    pub async fn connect(config: AmqpBrokerConfig) -> Result<Self, BrokerError> {
        let broker = Self {
            config,
            state: Mutex::new(None),
        };
        broker.ensure_channel().await?;
        Ok(broker)
    }

    /// Returns a connected channel, reconnecting with exponential backoff if
    /// the current one is gone. Re-declares the exchange on every
    /// reconnect; callers are responsible for re-declaring their own queues.
    async fn ensure_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.state.lock().await;
        if let Some((_, ch)) = guard.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        let mut attempt = 0;
        let mut delay = self.config.reconnect_base_delay;
        loop {
            attempt += 1;
            match self.dial().await {
                Ok((conn, ch)) => {
                    let channel = ch.clone();
                    *guard = Some((conn, ch));
                    return Ok(channel);
                }
                Err(e) if attempt >= self.config.reconnect_max_attempts => {
                    return Err(BrokerError::Connection(format!(
                        "giving up after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "broker connection attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn dial(&self) -> Result<(Connection, Channel), BrokerError> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok((connection, channel))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str, binding_key: &str) -> Result<(), BrokerError> {
        let channel = self.ensure_channel().await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: queue.to_owned(),
                source: e.to_string(),
            })?;

        channel
            .queue_bind(
                queue,
                &self.config.exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: queue.to_owned(),
                source: e.to_string(),
            })?;

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
    ) -> Result<(String, mpsc::Receiver<Payload>), BrokerError> {
        let channel = self.ensure_channel().await?;
        let consumer_tag = uuid::Uuid::new_v4().to_string();

        let mut consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe {
                queue: queue.to_owned(),
                source: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(10);
        let queue_name = queue.to_owned();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let payload = delivery.data.clone();
                        if tx.send(payload).await.is_err() {
                            // Forwarder gave up on us; leave the message
                            // unacked so a future consumer can redeliver it.
                            break;
                        }
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            tracing::warn!(queue = %queue_name, error = %e, "failed to ack delivery");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue_name, error = %e, "consumer stream error");
                        break;
                    }
                }
            }
        });

        Ok((consumer_tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let channel = self.ensure_channel().await?;
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: Payload) -> Result<(), BrokerError> {
        let channel = self.ensure_channel().await?;
        channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| BrokerError::Publish {
                routing_key: routing_key.to_owned(),
                source: e.to_string(),
            })?
            .await
            .map_err(|e| BrokerError::Publish {
                routing_key: routing_key.to_owned(),
                source: e.to_string(),
            })?;
        Ok(())
    }
}
