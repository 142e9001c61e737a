//! The logical pub/sub layer over a [`Broker`] (spec §4.3): three channel
//! kinds (Brain↔Agent, Agent→Brain, Agent↔Agent), queue preparation
//! decoupled from subscription, and cancel-then-resubscribe semantics that
//! guarantee at most one live [`Subscription`] per participant.

use crate::{Broker, BrokerError, MessageKind, Payload, RoutedMessage};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const BRAIN_PARTICIPANT: &str = "brain";

/// A live consumer binding (spec §3 `Subscription`). Held internally by
/// `RoutingBus`; callers only ever see the handoff channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub participant_id: String,
    pub consumer_tag: String,
}

pub struct RoutingBus {
    broker: Arc<dyn Broker>,
    subscriptions: DashMap<String, Subscription>,
}

impl RoutingBus {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscriptions: DashMap::new(),
        }
    }

    /// The queue a participant's messages land in. Agent ids and the brain
    /// each get a durable queue; agent-to-agent traffic reuses the target
    /// agent's own queue (spec §4.3).
    fn queue_name(participant_id: &str) -> String {
        if participant_id == BRAIN_PARTICIPANT {
            "brain.inbox".to_owned()
        } else {
            format!("agent.{participant_id}")
        }
    }

    /// Declares the per-agent durable queue and binding. Idempotent, and
    /// independent of whether the agent's stream is open yet — this is what
    /// prevents messages published between registration and first stream
    /// attach from being lost.
    pub async fn prepare_agent_queue(&self, agent_id: &str) -> Result<(), BrokerError> {
        let queue = Self::queue_name(agent_id);
        self.broker.declare_queue(&queue, agent_id).await
    }

    /// Subscribes `participant_id`, generating a fresh consumer tag. Any
    /// prior subscription for the same participant is cancelled first, so
    /// at most one `Subscription` per participant_id exists at any instant.
    pub async fn subscribe(
        &self,
        participant_id: &str,
    ) -> Result<mpsc::Receiver<RoutedMessage>, BrokerError> {
        self.cancel(participant_id).await;

        let queue = Self::queue_name(participant_id);
        let (consumer_tag, mut raw_rx) = self.broker.subscribe(&queue).await?;

        self.subscriptions.insert(
            participant_id.to_owned(),
            Subscription {
                participant_id: participant_id.to_owned(),
                consumer_tag,
            },
        );

        let (tx, rx) = mpsc::channel(10);
        let participant = participant_id.to_owned();
        tokio::spawn(async move {
            while let Some(bytes) = raw_rx.recv().await {
                match decode(&bytes) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(participant = %participant, error = %e, "dropping malformed routed message");
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Publishes `message` to `target`'s queue.
    pub async fn publish(&self, target: &str, message: RoutedMessage) -> Result<(), BrokerError> {
        let queue = Self::queue_name(target);
        let payload = encode(&message);
        self.broker.publish(&queue, payload).await
    }

    /// Cancels the outstanding consumer for `participant_id`, if any, and
    /// drops its handoff channel registration.
    pub async fn cancel(&self, participant_id: &str) {
        if let Some((_, sub)) = self.subscriptions.remove(participant_id) {
            if let Err(e) = self.broker.cancel(&sub.consumer_tag).await {
                tracing::warn!(participant = %participant_id, error = %e, "failed to cancel prior consumer");
            }
        }
    }

    /// Brain → Agent, typed wrapper: publishes to `agent_id`'s queue.
    pub async fn send_to_agent(
        &self,
        agent_id: &str,
        message: RoutedMessage,
    ) -> Result<(), BrokerError> {
        self.publish(agent_id, message).await
    }

    /// Agent → Brain, typed wrapper: publishes to the shared brain inbox.
    pub async fn send_to_ai(&self, message: RoutedMessage) -> Result<(), BrokerError> {
        self.publish(BRAIN_PARTICIPANT, message).await
    }

    /// Agent → Agent, typed wrapper: publishes to the target agent's queue.
    pub async fn send_between_agents(
        &self,
        target_agent_id: &str,
        message: RoutedMessage,
    ) -> Result<(), BrokerError> {
        self.publish(target_agent_id, message).await
    }
}

fn encode(message: &RoutedMessage) -> Payload {
    serde_json::to_vec(message).expect("RoutedMessage always serializes")
}

fn decode(bytes: &[u8]) -> Result<RoutedMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}

impl RoutedMessage {
    pub fn heartbeat(from_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: String::new(),
            from_id: from_id.into(),
            to_id: BRAIN_PARTICIPANT.to_owned(),
            message_type: MessageKind::Heartbeat,
            content: String::new(),
            context: Default::default(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use std::collections::HashMap;

    fn sample(from: &str, to: &str, correlation_id: &str) -> RoutedMessage {
        RoutedMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_owned(),
            from_id: from.to_owned(),
            to_id: to.to_owned(),
            message_type: MessageKind::Instruction,
            content: "do the thing".to_owned(),
            context: HashMap::new(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn brain_to_agent_round_trips() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = RoutingBus::new(broker);

        bus.prepare_agent_queue("agent-1").await.unwrap();
        let mut rx = bus.subscribe("agent-1").await.unwrap();

        let msg = sample(BRAIN_PARTICIPANT, "agent-1", "c1");
        bus.send_to_agent("agent-1", msg.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn resubscribe_cancels_prior_subscription() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = RoutingBus::new(broker);
        bus.prepare_agent_queue("agent-1").await.unwrap();

        let mut first = bus.subscribe("agent-1").await.unwrap();
        let mut second = bus.subscribe("agent-1").await.unwrap();

        let msg = sample(BRAIN_PARTICIPANT, "agent-1", "c2");
        bus.send_to_agent("agent-1", msg.clone()).await.unwrap();

        assert_eq!(second.recv().await.unwrap(), msg);
        // The first subscriber's channel was torn down by the resubscribe;
        // its sender is gone so recv() resolves to None rather than hanging.
        assert!(first.recv().await.is_none());
    }
}
