//! The Message Broker abstraction (spec §4.3): durable queues, routing keys,
//! and cancellable subscriptions with broker-unique consumer tags, plus the
//! [`routing::RoutingBus`] logical layer on top of it.

pub mod amqp;
pub mod memory;
pub mod routing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub type Payload = Vec<u8>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("failed to declare queue {queue}: {source}")]
    Declare { queue: String, source: String },
    #[error("failed to publish to {routing_key}: {source}")]
    Publish { routing_key: String, source: String },
    #[error("failed to subscribe to {queue}: {source}")]
    Subscribe { queue: String, source: String },
}

/// One message routed between a user, the brain, and an agent (spec §3
/// `ConversationMessage`). This is the broker-agnostic shape `RoutingBus`
/// serializes onto queue payloads; `hub::grpc` translates to/from the wire
/// `api::v1::ConversationMessage` at the stream boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutedMessage {
    pub message_id: String,
    pub correlation_id: String,
    pub from_id: String,
    pub to_id: String,
    pub message_type: MessageKind,
    pub content: String,
    pub context: std::collections::HashMap<String, String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    Instruction,
    Completion,
    StatusUpdate,
    Error,
    Heartbeat,
}

/// The queueing/routing semantics the core relies on from an AMQP-style
/// broker. Implementations own reconnection; callers never see a dropped
/// connection, only a `BrokerError` if backoff is exhausted.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable queue bound to `binding_key` on the exchange.
    /// Idempotent: declaring an already-declared queue is a no-op.
    async fn declare_queue(&self, queue: &str, binding_key: &str) -> Result<(), BrokerError>;

    /// Starts consuming `queue` under a freshly generated consumer tag.
    /// Returns the tag and the receiving end of the handoff channel the
    /// caller reads deliveries from.
    async fn subscribe(&self, queue: &str) -> Result<(String, mpsc::Receiver<Payload>), BrokerError>;

    /// Cancels a previously returned consumer tag. Cancelling an unknown or
    /// already-cancelled tag is not an error.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Publishes to the exchange with the given routing key.
    async fn publish(&self, routing_key: &str, payload: Payload) -> Result<(), BrokerError>;
}
