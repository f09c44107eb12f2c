//! libp2p behaviour of a tessel node.
//!
//! GossipSub carries every pubsub frame (thread topics, peer topics and the
//! cafe query topic). Kademlia and Identify keep the routing table filled,
//! the relay client and DCUtR let NATed peers stay reachable.

use libp2p::{
    dcutr, gossipsub, identify,
    kad::{self, store::MemoryStore},
    relay,
    swarm::NetworkBehaviour,
};

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NodeEvent")]
pub struct NodeBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
}

#[derive(Debug)]
pub enum NodeEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
    RelayClient(relay::client::Event),
    Dcutr(dcutr::Event),
}

macro_rules! node_event_from {
    ($($variant:ident => $event:ty),* $(,)?) => {
        $(
            impl From<$event> for NodeEvent {
                fn from(event: $event) -> Self {
                    NodeEvent::$variant(event)
                }
            }
        )*
    };
}

node_event_from! {
    Gossipsub => gossipsub::Event,
    Kademlia => kad::Event,
    Identify => identify::Event,
    RelayClient => relay::client::Event,
    Dcutr => dcutr::Event,
}
