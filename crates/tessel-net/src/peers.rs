//! Connected peers and the gossipsub topics they announced.
//!
//! The cafe consults topic membership to tell whether a client is online
//! (subscribed to its peer topic) before pushing mail to it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Direct,
    Relayed,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub address: Multiaddr,
    pub mode: ConnectionMode,
    pub connected_at: DateTime<Utc>,
    pub topics: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, ConnectionInfo>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr, relayed: bool) {
        let mode = if relayed {
            ConnectionMode::Relayed
        } else {
            ConnectionMode::Direct
        };
        debug!(peer = %peer_id, addr = %address, mode = ?mode, "tracking peer");

        self.peers
            .entry(peer_id)
            .and_modify(|info| {
                info.address = address.clone();
                info.mode = mode;
            })
            .or_insert_with(|| ConnectionInfo {
                peer_id,
                address,
                mode,
                connected_at: Utc::now(),
                topics: HashSet::new(),
            });
    }

    pub fn on_disconnected(&mut self, peer_id: &PeerId) {
        if self.peers.remove(peer_id).is_some() {
            debug!(peer = %peer_id, "peer gone");
        }
    }

    pub fn on_subscribed(&mut self, peer_id: &PeerId, topic: &str) {
        if let Some(info) = self.peers.get_mut(peer_id) {
            info.topics.insert(topic.to_string());
        }
    }

    pub fn on_unsubscribed(&mut self, peer_id: &PeerId, topic: &str) {
        if let Some(info) = self.peers.get_mut(peer_id) {
            info.topics.remove(topic);
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&ConnectionInfo> {
        self.peers.get(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Connected peers that announced `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|info| info.topics.contains(topic))
            .map(|info| info.peer_id)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn relayed_count(&self) -> usize {
        self.peers
            .values()
            .filter(|info| info.mode == ConnectionMode::Relayed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/udp/4001/quic-v1".parse().unwrap()
    }

    #[test]
    fn test_connect_disconnect() {
        let mut tracker = PeerTracker::new();
        let peer = PeerId::random();

        tracker.on_connected(peer, addr(), false);
        assert_eq!(tracker.peer_count(), 1);
        assert_eq!(tracker.get(&peer).unwrap().mode, ConnectionMode::Direct);

        tracker.on_disconnected(&peer);
        assert_eq!(tracker.peer_count(), 0);
        assert!(tracker.get(&peer).is_none());
    }

    #[test]
    fn test_topic_membership() {
        let mut tracker = PeerTracker::new();
        let a = PeerId::random();
        let b = PeerId::random();
        tracker.on_connected(a, addr(), false);
        tracker.on_connected(b, addr(), true);
        assert_eq!(tracker.relayed_count(), 1);

        tracker.on_subscribed(&a, "peer:aa");
        tracker.on_subscribed(&b, "thread:1");
        assert_eq!(tracker.subscribers("peer:aa"), vec![a]);

        // reconnecting over another path keeps announced topics
        tracker.on_connected(a, addr(), true);
        assert_eq!(tracker.subscribers("peer:aa"), vec![a]);

        tracker.on_unsubscribed(&a, "peer:aa");
        assert!(tracker.subscribers("peer:aa").is_empty());

        // unknown peers are ignored
        tracker.on_subscribed(&PeerId::random(), "peer:aa");
        assert!(tracker.subscribers("peer:aa").is_empty());
    }
}
