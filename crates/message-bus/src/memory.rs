//! An in-process `Broker` used for local/dev runs and as the fixture every
//! `RoutingBus`/`hub` integration test runs against. Durable queue content
//! lives in a shared backlog rather than inside any one subscriber's
//! channel, so cancel-then-resubscribe (spec §4.3) doesn't lose messages
//! the way dropping an `mpsc::Receiver` would.

use crate::{Broker, BrokerError, Payload};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

struct Queue {
    backlog: Mutex<VecDeque<Payload>>,
    notify: Notify,
}

impl Queue {
    fn new() -> Self {
        Self {
            backlog: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<Queue>>,
    bindings: DashMap<String, String>,
    active_consumers: DashMap<String, CancellationToken>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_for_routing_key(&self, routing_key: &str) -> Option<Arc<Queue>> {
        let queue_name = self.bindings.get(routing_key)?;
        self.queues.get(queue_name.as_str()).map(|q| q.clone())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str, binding_key: &str) -> Result<(), BrokerError> {
        self.queues
            .entry(queue.to_owned())
            .or_insert_with(|| Arc::new(Queue::new()));
        self.bindings
            .insert(binding_key.to_owned(), queue.to_owned());
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
    ) -> Result<(String, mpsc::Receiver<Payload>), BrokerError> {
        let q = self
            .queues
            .get(queue)
            .map(|e| e.clone())
            .ok_or_else(|| BrokerError::Subscribe {
                queue: queue.to_owned(),
                source: "queue not declared".into(),
            })?;

        let consumer_tag = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        self.active_consumers
            .insert(consumer_tag.clone(), cancel.clone());

        tokio::spawn(async move {
            loop {
                let next = {
                    let mut backlog = q.backlog.lock().await;
                    backlog.pop_front()
                };
                match next {
                    Some(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = q.notify.notified() => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        });

        Ok((consumer_tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        if let Some((_, token)) = self.active_consumers.remove(consumer_tag) {
            token.cancel();
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: Payload) -> Result<(), BrokerError> {
        let queue = self
            .queue_for_routing_key(routing_key)
            .ok_or_else(|| BrokerError::Publish {
                routing_key: routing_key.to_owned(),
                source: "no queue bound to routing key".into(),
            })?;
        queue.backlog.lock().await.push_back(payload);
        queue.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_before_subscribe_is_not_lost() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "agent-1").await.unwrap();
        broker.publish("agent-1", b"hello".to_vec()).await.unwrap();

        let (_tag, mut rx) = broker.subscribe("q").await.unwrap();
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn resubscribe_after_cancel_continues_delivery() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "agent-1").await.unwrap();

        let (tag1, mut rx1) = broker.subscribe("q").await.unwrap();
        broker.publish("agent-1", b"first".to_vec()).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), b"first");

        broker.cancel(&tag1).await.unwrap();
        drop(rx1);

        let (_tag2, mut rx2) = broker.subscribe("q").await.unwrap();
        broker.publish("agent-1", b"second".to_vec()).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap(), b"second");
    }
}
