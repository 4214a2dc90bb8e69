// Inter-node routing transport.
//
// Each node consumes three broker channels named after its own id:
// `chat.<nodeId>`, `receipt.<nodeId>` and `disconnect.<nodeId>`. A node
// that owns the recipient's presence record receives traffic on these; a
// frame that arrives for a user the node no longer owns is dropped, never
// rebroadcast. Push requests for offline users go to the shared
// `push.notify` channel consumed by the push service.
//
// Production uses Redis pub/sub; the `Memory` broker is a process-local
// hub with identical semantics for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use pulse_common::protocol::envelope::{DisconnectNotice, Envelope, PushNotification};

pub const PUSH_CHANNEL: &str = "push.notify";

pub fn chat_channel(node_id: &str) -> String {
    format!("chat.{node_id}")
}

pub fn receipt_channel(node_id: &str) -> String {
    format!("receipt.{node_id}")
}

pub fn disconnect_channel(node_id: &str) -> String {
    format!("disconnect.{node_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("broker operation failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type RouterResult<T> = Result<T, RouterError>;

/// What a message on one of this node's channels carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Chat,
    Receipt,
    Disconnect,
}

#[derive(Clone)]
pub enum Broker {
    Redis {
        client: redis::Client,
        publisher: redis::aio::ConnectionManager,
    },
    Memory(MemoryBroker),
}

impl Broker {
    pub async fn connect_redis(url: &str) -> RouterResult<Self> {
        let client = redis::Client::open(url)?;
        let publisher = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self::Redis { client, publisher })
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryBroker::default())
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> RouterResult<()> {
        match self {
            Self::Redis { publisher, .. } => {
                let mut conn = publisher.clone();
                redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(payload)
                    .query_async::<()>(&mut conn)
                    .await?;
                Ok(())
            }
            Self::Memory(hub) => {
                hub.publish(channel, payload);
                Ok(())
            }
        }
    }

    pub async fn subscribe(&self, channels: &[String]) -> RouterResult<Subscription> {
        match self {
            Self::Redis { client, .. } => {
                let mut pubsub = client.get_async_pubsub().await?;
                for channel in channels {
                    pubsub.subscribe(channel).await?;
                }
                Ok(Subscription::Redis(pubsub))
            }
            Self::Memory(hub) => Ok(Subscription::Memory(hub.subscribe(channels))),
        }
    }
}

pub enum Subscription {
    Redis(redis::aio::PubSub),
    Memory(mpsc::UnboundedReceiver<(String, String)>),
}

impl Subscription {
    /// Next `(channel, payload)` pair; `None` when the broker connection is
    /// gone.
    pub async fn next_message(&mut self) -> Option<(String, String)> {
        match self {
            Self::Redis(pubsub) => loop {
                let message = pubsub.on_message().next().await?;
                let channel = message.get_channel_name().to_string();
                match message.get_payload::<String>() {
                    Ok(payload) => return Some((channel, payload)),
                    Err(_) => {
                        debug!(channel, "dropping non-text broker payload");
                    }
                }
            },
            Self::Memory(rx) => rx.recv().await,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<(String, String)>>>>>,
}

impl MemoryBroker {
    fn publish(&self, channel: &str, payload: &str) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send((channel.to_string(), payload.to_string())).is_ok());
        }
    }

    fn subscribe(&self, channels: &[String]) -> mpsc::UnboundedReceiver<(String, String)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for channel in channels {
            subscribers.entry(channel.clone()).or_default().push(tx.clone());
        }
        rx
    }
}

/// Typed routing facade bound to this node's identity.
#[derive(Clone)]
pub struct InterNodeRouter {
    broker: Broker,
    node_id: String,
}

impl InterNodeRouter {
    pub fn new(broker: Broker, node_id: impl Into<String>) -> Self {
        Self { broker, node_id: node_id.into() }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Forward a chat frame to the node that owns the recipient.
    pub async fn forward_chat(&self, target_node: &str, frame: &Envelope) -> RouterResult<()> {
        let payload = serde_json::to_string(frame)?;
        self.broker.publish(&chat_channel(target_node), &payload).await
    }

    /// Forward a read receipt to the original sender's node.
    pub async fn forward_receipt(&self, target_node: &str, frame: &Envelope) -> RouterResult<()> {
        let payload = serde_json::to_string(frame)?;
        self.broker.publish(&receipt_channel(target_node), &payload).await
    }

    /// Ask another node to drop its session for a user this node is taking
    /// over.
    pub async fn request_disconnect(
        &self,
        target_node: &str,
        notice: &DisconnectNotice,
    ) -> RouterResult<()> {
        let payload = serde_json::to_string(notice)?;
        self.broker
            .publish(&disconnect_channel(target_node), &payload)
            .await
    }

    /// Hand an offline recipient to the push service.
    pub async fn publish_push(&self, notification: &PushNotification) -> RouterResult<()> {
        let payload = serde_json::to_string(notification)?;
        self.broker.publish(PUSH_CHANNEL, &payload).await
    }

    /// Subscribe to this node's three inbound channels.
    pub async fn subscribe_node_channels(&self) -> RouterResult<Subscription> {
        self.broker
            .subscribe(&[
                chat_channel(&self.node_id),
                receipt_channel(&self.node_id),
                disconnect_channel(&self.node_id),
            ])
            .await
    }

    /// Classify a channel name from this node's subscription.
    pub fn classify(&self, channel: &str) -> Option<InboundKind> {
        if channel == chat_channel(&self.node_id) {
            Some(InboundKind::Chat)
        } else if channel == receipt_channel(&self.node_id) {
            Some(InboundKind::Receipt)
        } else if channel == disconnect_channel(&self.node_id) {
            Some(InboundKind::Disconnect)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::protocol::envelope::FrameType;

    #[tokio::test]
    async fn memory_broker_delivers_to_subscribers() {
        let broker = Broker::memory();
        let mut sub = broker
            .subscribe(&["chat.node-a".to_string()])
            .await
            .expect("subscribe should succeed");

        broker
            .publish("chat.node-a", "hello")
            .await
            .expect("publish should succeed");
        broker
            .publish("chat.node-b", "other")
            .await
            .expect("publish should succeed");

        let (channel, payload) = sub.next_message().await.expect("message should arrive");
        assert_eq!(channel, "chat.node-a");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn frames_land_on_the_target_nodes_channels() {
        let broker = Broker::memory();
        let router_a = InterNodeRouter::new(broker.clone(), "node-a");
        let router_b = InterNodeRouter::new(broker, "node-b");
        let mut sub_b = router_b
            .subscribe_node_channels()
            .await
            .expect("subscribe should succeed");

        let frame = Envelope::system(FrameType::ChatMessage, "u2");
        router_a
            .forward_chat("node-b", &frame)
            .await
            .expect("forward should succeed");

        let (channel, payload) = sub_b.next_message().await.expect("message should arrive");
        assert_eq!(router_b.classify(&channel), Some(InboundKind::Chat));
        let decoded: Envelope =
            serde_json::from_str(&payload).expect("payload should decode");
        assert_eq!(decoded.receiver_id.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn disconnect_requests_reach_the_named_node_only() {
        let broker = Broker::memory();
        let router_a = InterNodeRouter::new(broker.clone(), "node-a");
        let router_b = InterNodeRouter::new(broker.clone(), "node-b");
        let router_c = InterNodeRouter::new(broker, "node-c");

        let mut sub_b = router_b
            .subscribe_node_channels()
            .await
            .expect("subscribe should succeed");
        let mut sub_c = router_c
            .subscribe_node_channels()
            .await
            .expect("subscribe should succeed");

        let notice = DisconnectNotice {
            user_id: "u1".to_string(),
            target_node_id: "node-b".to_string(),
            source_node_id: "node-a".to_string(),
            reason: None,
            timestamp: 1,
        };
        router_a
            .request_disconnect("node-b", &notice)
            .await
            .expect("request should succeed");

        let (channel, _) = sub_b.next_message().await.expect("node-b should receive");
        assert_eq!(router_b.classify(&channel), Some(InboundKind::Disconnect));

        // node-c saw nothing.
        router_a
            .forward_chat("node-c", &Envelope::system(FrameType::ChatMessage, "u9"))
            .await
            .expect("forward should succeed");
        let (channel, _) = sub_c.next_message().await.expect("node-c should receive");
        assert_eq!(router_c.classify(&channel), Some(InboundKind::Chat));
    }

    #[test]
    fn classify_rejects_foreign_channels() {
        let router = InterNodeRouter::new(Broker::memory(), "node-a");
        assert_eq!(router.classify("chat.node-b"), None);
        assert_eq!(router.classify("push.notify"), None);
        assert_eq!(router.classify("receipt.node-a"), Some(InboundKind::Receipt));
    }
}
