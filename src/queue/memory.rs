use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Broker, Deliveries, Delivery, OutboundMessage, QueueTopology};

/// A process-local broker implementing the full retry topology, for tests
/// and local runs.
///
/// Messages published to a retry queue are held by a tokio timer for the
/// topology's retry delay, then forwarded to the primary queue. Nothing
/// survives a restart. Every publish and ack is recorded for inspection.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    queues: Mutex<HashMap<String, Channel>>,
    /// retry queue -> (primary queue, delay)
    bounces: Mutex<HashMap<String, (String, Duration)>>,
    published: Mutex<Vec<(String, OutboundMessage)>>,
    acked: Mutex<Vec<(String, OutboundMessage)>>,
    ack_count: watch::Sender<usize>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            queues: Mutex::default(),
            bounces: Mutex::default(),
            published: Mutex::default(),
            acked: Mutex::default(),
            ack_count: watch::channel(0).0,
        }
    }
}

struct Channel {
    sender: mpsc::UnboundedSender<OutboundMessage>,
    /// Taken by the first consumer.
    receiver: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Channel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published to `queue`, oldest first, including those
    /// already consumed.
    pub fn published(&self, queue: &str) -> Vec<OutboundMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Messages acknowledged by consumers of `queue`, in ack order.
    pub fn acked(&self, queue: &str) -> Vec<OutboundMessage> {
        self.inner
            .acked
            .lock()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn ack_count(&self) -> usize {
        *self.inner.ack_count.borrow()
    }

    /// Waits until at least `count` messages have been acknowledged across
    /// all queues.
    pub async fn wait_for_acks(&self, count: usize) {
        let mut acks = self.inner.ack_count.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = acks.wait_for(|acked| *acked >= count).await;
    }

    /// Forgets every queue. Open consumer streams end once they drain, and
    /// pending retry bounces are dropped.
    pub fn shutdown(&self) {
        self.inner.queues.lock().clear();
        self.inner.bounces.lock().clear();
    }
}

impl Inner {
    fn deliver(&self, queue: &str, message: OutboundMessage) -> anyhow::Result<()> {
        let queues = self.queues.lock();
        let channel = queues
            .get(queue)
            .with_context(|| format!("queue `{queue}` is not declared"))?;
        if channel.sender.send(message).is_err() {
            bail!("queue `{queue}` is closed");
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &QueueTopology) -> anyhow::Result<()> {
        let mut queues = self.inner.queues.lock();
        for queue in [&topology.primary, &topology.retry, &topology.dead_letter] {
            queues.entry(queue.clone()).or_insert_with(Channel::new);
        }
        self.inner.bounces.lock().insert(
            topology.retry.clone(),
            (topology.primary.clone(), topology.retry_delay),
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> anyhow::Result<Deliveries> {
        let receiver = self
            .inner
            .queues
            .lock()
            .get_mut(queue)
            .with_context(|| format!("queue `{queue}` is not declared"))?
            .receiver
            .take()
            .with_context(|| format!("queue `{queue}` already has a consumer"))?;
        let inner = self.inner.clone();
        let queue = queue.to_string();
        let deliveries = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        })
        .map(move |message| {
            Ok(Box::new(MemoryDelivery {
                queue: queue.clone(),
                message,
                inner: inner.clone(),
            }) as Box<dyn Delivery>)
        });
        Ok(deliveries.boxed())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> anyhow::Result<()> {
        self.inner
            .published
            .lock()
            .push((queue.to_string(), message.clone()));
        let bounce = self.inner.bounces.lock().get(queue).cloned();
        match bounce {
            Some((primary, delay)) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = inner.deliver(&primary, message) {
                        tracing::debug!("Dropped retry bounce into `{primary}`: {e}");
                    }
                });
                Ok(())
            }
            None => self.inner.deliver(queue, message),
        }
    }
}

struct MemoryDelivery {
    queue: String,
    message: OutboundMessage,
    inner: Arc<Inner>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn attempt_count(&self) -> u32 {
        self.message.attempt_count
    }

    async fn ack(&self) -> anyhow::Result<()> {
        self.inner
            .acked
            .lock()
            .push((self.queue.clone(), self.message.clone()));
        self.inner.ack_count.send_modify(|count| *count += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::queue::JobClass;

    #[tokio::test]
    async fn retry_queue_bounces_back_to_primary_with_headers() {
        let broker = InMemoryBroker::new();
        let topology = JobClass::new("cache", "warm", 1)
            .with_retry_delay(Duration::from_millis(5))
            .topology();
        broker.declare(&topology).await.unwrap();
        let mut deliveries = broker.consume(&topology.primary, 1).await.unwrap();

        let message = OutboundMessage::new(b"{\"type\":\"warm_cache\"}".to_vec(), 1)
            .annotate("x-last-error", "cold");
        broker.publish(&topology.retry, message.clone()).await.unwrap();

        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(message.body, delivery.body());
        assert_eq!(1, delivery.attempt_count());
        delivery.ack().await.unwrap();

        assert_eq!(vec![message.clone()], broker.published(&topology.retry));
        assert_eq!(vec![message], broker.acked(&topology.primary));
        assert_eq!(1, broker.ack_count());
    }

    #[tokio::test]
    async fn undeclared_queues_and_second_consumers_are_errors() {
        let broker = InMemoryBroker::new();
        assert!(broker
            .publish("nowhere", OutboundMessage::new(vec![], 0))
            .await
            .is_err());

        let topology = JobClass::new("cache", "warm", 1).topology();
        broker.declare(&topology).await.unwrap();
        let _first = broker.consume(&topology.primary, 1).await.unwrap();
        assert!(broker.consume(&topology.primary, 1).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_ends_consumer_streams() {
        let broker = InMemoryBroker::new();
        let topology = JobClass::new("cache", "warm", 1).topology();
        broker.declare(&topology).await.unwrap();
        let mut deliveries = broker.consume(&topology.primary, 1).await.unwrap();
        broker
            .publish(&topology.primary, OutboundMessage::new(b"{}".to_vec(), 0))
            .await
            .unwrap();
        broker.shutdown();
        assert!(deliveries.next().await.is_some());
        assert!(deliveries.next().await.is_none());
    }
}
