//! Swarm task.
//!
//! The libp2p swarm runs in its own tokio task. The rest of the node talks
//! to it through [`SwarmCommand`]s, with a oneshot reply where the caller
//! needs the outcome, and receives [`SwarmNotification`]s back.

use std::path::PathBuf;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, kad, multiaddr::Protocol, relay, swarm::SwarmEvent, Multiaddr, PeerId,
    Swarm,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tessel_shared::constants::DEFAULT_QUIC_PORT;

use crate::behaviour::{NodeBehaviour, NodeEvent};
use crate::discovery::{load_bootstrap_peers, peer_id_of};
use crate::error::NetError;
use crate::peers::PeerTracker;
use crate::transport::build_swarm;

type Reply<T> = oneshot::Sender<Result<T, NetError>>;

#[derive(Debug)]
pub enum SwarmCommand {
    Dial(Multiaddr),
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Subscribe {
        topic: String,
        reply: Reply<()>,
    },
    Unsubscribe(String),
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    /// Connected peers subscribed to a topic.
    GetSubscribers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum SwarmNotification {
    PeerConnected {
        peer_id: PeerId,
        address: Multiaddr,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    MessageReceived {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
}

pub struct SwarmConfig {
    pub bootstrap_peers_path: Option<PathBuf>,
    pub listen_port: u16,
    pub extra_dials: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            listen_port: DEFAULT_QUIC_PORT,
            extra_dials: Vec::new(),
        }
    }
}

/// Build the swarm, start listening and bootstrapping, and spawn its task.
///
/// Returns `(command_tx, notification_rx, local_peer_id)`.
pub async fn spawn_swarm(
    keypair: libp2p::identity::Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    let port = config.listen_port;
    swarm.listen_on(format!("/ip4/0.0.0.0/udp/{port}/quic-v1").parse()?)?;
    swarm.listen_on(format!("/ip6/::/udp/{port}/quic-v1").parse()?)?;
    info!(peer_id = %local_peer_id, port, "swarm listening");

    let mut dials = config
        .bootstrap_peers_path
        .as_deref()
        .map(load_bootstrap_peers)
        .unwrap_or_default();
    let bootstrapping = !dials.is_empty();
    dials.extend(config.extra_dials);

    for addr in dials {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "dial failed");
            continue;
        }
        if let Some(peer_id) = peer_id_of(&addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
        }
    }
    if bootstrapping {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "kademlia bootstrap did not start");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(256);

    tokio::spawn(async move {
        let mut peers = PeerTracker::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SwarmCommand::Shutdown) | None => {
                        info!("swarm shutting down");
                        break;
                    }
                    Some(cmd) => handle_command(&mut swarm, &peers, cmd),
                },
                event = swarm.select_next_some() => {
                    handle_event(&mut swarm, &mut peers, &notif_tx, event).await;
                }
            }
        }

        info!("swarm task terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}

fn handle_command(swarm: &mut Swarm<NodeBehaviour>, peers: &PeerTracker, cmd: SwarmCommand) {
    match cmd {
        SwarmCommand::Dial(addr) => {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "dial failed");
            }
        }
        SwarmCommand::Publish { topic, data, reply } => {
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .publish(gossipsub::IdentTopic::new(&topic), data)
                .map(|_| ())
                .or_else(|e| match e {
                    gossipsub::PublishError::Duplicate => Ok(()),
                    gossipsub::PublishError::InsufficientPeers => {
                        Err(NetError::NoSubscribers(topic.clone()))
                    }
                    other => Err(NetError::Publish(other.to_string())),
                });
            if let Err(ref e) = result {
                debug!(topic = %topic, error = %e, "publish failed");
            }
            let _ = reply.send(result);
        }
        SwarmCommand::Subscribe { topic, reply } => {
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&gossipsub::IdentTopic::new(&topic))
                .map(|_| ())
                .map_err(|e| NetError::Subscribe(e.to_string()));
            debug!(topic = %topic, ok = result.is_ok(), "subscribe");
            let _ = reply.send(result);
        }
        SwarmCommand::Unsubscribe(topic) => {
            if let Err(e) = swarm
                .behaviour_mut()
                .gossipsub
                .unsubscribe(&gossipsub::IdentTopic::new(&topic))
            {
                warn!(topic = %topic, error = %e, "unsubscribe failed");
            }
        }
        SwarmCommand::GetPeers(reply) => {
            let _ = reply.send(peers.connected_peers());
        }
        SwarmCommand::GetSubscribers { topic, reply } => {
            let _ = reply.send(peers.subscribers(&topic));
        }
        SwarmCommand::Shutdown => {}
    }
}

async fn handle_event(
    swarm: &mut Swarm<NodeBehaviour>,
    peers: &mut PeerTracker,
    notif_tx: &mpsc::Sender<SwarmNotification>,
    event: SwarmEvent<NodeEvent>,
) {
    match event {
        SwarmEvent::Behaviour(NodeEvent::Gossipsub(gossipsub::Event::Message {
            message, ..
        })) => {
            let topic = message.topic.to_string();
            debug!(topic = %topic, len = message.data.len(), "gossipsub message");
            let _ = notif_tx
                .send(SwarmNotification::MessageReceived {
                    source: message.source,
                    topic,
                    data: message.data,
                })
                .await;
        }
        SwarmEvent::Behaviour(NodeEvent::Gossipsub(gossipsub::Event::Subscribed {
            peer_id,
            topic,
        })) => peers.on_subscribed(&peer_id, topic.as_str()),
        SwarmEvent::Behaviour(NodeEvent::Gossipsub(gossipsub::Event::Unsubscribed {
            peer_id,
            topic,
        })) => peers.on_unsubscribed(&peer_id, topic.as_str()),
        SwarmEvent::Behaviour(NodeEvent::Kademlia(kad::Event::OutboundQueryProgressed {
            result,
            ..
        })) => {
            debug!(result = ?result, "kademlia query progressed");
        }
        SwarmEvent::Behaviour(NodeEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            for addr in info.listen_addrs {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
            }
        }
        SwarmEvent::Behaviour(NodeEvent::RelayClient(
            relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
        )) => {
            info!(relay = %relay_peer_id, "relay reservation accepted");
        }
        SwarmEvent::ConnectionEstablished {
            peer_id, endpoint, ..
        } => {
            let address = endpoint.get_remote_address().clone();
            let relayed = address.iter().any(|p| matches!(p, Protocol::P2pCircuit));
            peers.on_connected(peer_id, address.clone(), relayed);
            info!(peer = %peer_id, addr = %address, relayed, "peer connected");
            let _ = notif_tx
                .send(SwarmNotification::PeerConnected { peer_id, address })
                .await;
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established: 0,
            ..
        } => {
            peers.on_disconnected(&peer_id);
            info!(peer = %peer_id, "peer disconnected");
            let _ = notif_tx
                .send(SwarmNotification::PeerDisconnected { peer_id })
                .await;
        }
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(addr = %address, "listening");
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            warn!(peer = ?peer_id, error = %error, "outgoing connection error");
        }
        _ => {}
    }
}
