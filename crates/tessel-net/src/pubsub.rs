//! Best-effort topic broadcast.
//!
//! [`SwarmPubSub`] rides on the gossipsub swarm; [`MemoryPubSub`] wires
//! nodes of one process together for tests and single-host setups. Both
//! follow gossipsub semantics: a publisher never receives its own frames,
//! and publishing to a topic nobody is subscribed to fails with
//! [`NetError::NoSubscribers`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::NetError;
use crate::swarm::{SwarmCommand, SwarmNotification};

const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Start receiving frames on `topic`. Dropping the subscription leaves
    /// the topic once no other local subscriber holds it.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError>;
}

type Release = Arc<dyn Fn(&str) + Send + Sync>;

/// Frames arriving on one topic.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<PubSubMessage>,
    release: Release,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next frame on this topic, `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.topic == self.topic => return Some(msg.data),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagging, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        (self.release)(&self.topic);
    }
}

/// Local subscriber count per topic.
#[derive(Default)]
struct TopicCounts(Mutex<HashMap<String, usize>>);

impl TopicCounts {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if this is the first local subscriber.
    fn acquire(&self, topic: &str) -> bool {
        let mut counts = self.lock();
        let count = counts.entry(topic.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true if this was the last local subscriber.
    fn release(&self, topic: &str) -> bool {
        let mut counts = self.lock();
        match counts.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(topic);
                true
            }
            None => false,
        }
    }

    fn contains(&self, topic: &str) -> bool {
        self.lock().contains_key(topic)
    }
}

// ---------------------------------------------------------------------------
// Swarm
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SwarmPubSub {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    inbound: broadcast::Sender<PubSubMessage>,
    topics: Arc<TopicCounts>,
}

impl SwarmPubSub {
    /// Take over the swarm's notification stream. Gossipsub messages are
    /// routed to subscriptions; every other notification is forwarded on
    /// the returned receiver.
    pub fn new(
        cmd_tx: mpsc::Sender<SwarmCommand>,
        mut notif_rx: mpsc::Receiver<SwarmNotification>,
    ) -> (Self, mpsc::Receiver<SwarmNotification>) {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(256);

        let router = inbound.clone();
        tokio::spawn(async move {
            while let Some(notification) = notif_rx.recv().await {
                match notification {
                    SwarmNotification::MessageReceived { topic, data, .. } => {
                        // no receivers just means nobody listens right now
                        let _ = router.send(PubSubMessage { topic, data });
                    }
                    other => {
                        let _ = events_tx.send(other).await;
                    }
                }
            }
            debug!("swarm notification stream ended");
        });

        let pubsub = Self {
            cmd_tx,
            inbound,
            topics: Arc::new(TopicCounts::default()),
        };
        (pubsub, events_rx)
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, NetError>>) -> SwarmCommand,
    ) -> Result<T, NetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| NetError::ChannelClosed)?;
        reply_rx.await.map_err(|_| NetError::ChannelClosed)?
    }
}

#[async_trait]
impl PubSub for SwarmPubSub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError> {
        let rx = self.inbound.subscribe();
        if self.topics.acquire(topic) {
            let joined = self
                .command(|reply| SwarmCommand::Subscribe {
                    topic: topic.to_string(),
                    reply,
                })
                .await;
            if let Err(e) = joined {
                self.topics.release(topic);
                return Err(e);
            }
        }

        let topics = self.topics.clone();
        let cmd_tx = self.cmd_tx.clone();
        let release: Release = Arc::new(move |topic: &str| {
            if topics.release(topic) {
                let _ = cmd_tx.try_send(SwarmCommand::Unsubscribe(topic.to_string()));
            }
        });

        Ok(Subscription {
            topic: topic.to_string(),
            rx,
            release,
        })
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        self.command(|reply| SwarmCommand::Publish {
            topic: topic.to_string(),
            data,
            reply,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

struct MemoryNode {
    id: usize,
    tx: broadcast::Sender<PubSubMessage>,
    topics: Arc<TopicCounts>,
}

/// A set of in-process nodes that see each other's frames.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<Vec<Arc<MemoryNode>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>) -> MemoryPubSub {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let node = Arc::new(MemoryNode {
            id: nodes.len(),
            tx,
            topics: Arc::new(TopicCounts::default()),
        });
        nodes.push(node.clone());
        MemoryPubSub {
            network: self.clone(),
            node,
        }
    }
}

#[derive(Clone)]
pub struct MemoryPubSub {
    network: Arc<MemoryNetwork>,
    node: Arc<MemoryNode>,
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, NetError> {
        let rx = self.node.tx.subscribe();
        self.node.topics.acquire(topic);

        let topics = self.node.topics.clone();
        let release: Release = Arc::new(move |topic: &str| {
            topics.release(topic);
        });

        Ok(Subscription {
            topic: topic.to_string(),
            rx,
            release,
        })
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        let nodes = self
            .network
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = 0usize;
        for node in nodes.iter().filter(|n| n.id != self.node.id) {
            if node.topics.contains(topic) {
                let _ = node.tx.send(PubSubMessage {
                    topic: topic.to_string(),
                    data: data.clone(),
                });
                delivered += 1;
            }
        }

        if delivered == 0 {
            return Err(NetError::NoSubscribers(topic.to_string()));
        }
        Ok(())
    }
}
