use std::time::Duration;

use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::{dcutr, identify, noise, yamux, Swarm, SwarmBuilder};
use tracing::info;

use tessel_shared::constants::{GOSSIPSUB_HEARTBEAT_SECS, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use tessel_shared::Identity;

use crate::behaviour::NodeBehaviour;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The libp2p keypair of a node is its tessel identity, so the peer id and
/// the account address name the same ed25519 key.
pub fn keypair_from_identity(identity: &Identity) -> anyhow::Result<Keypair> {
    let mut secret = *identity.secret_bytes();
    Ok(Keypair::ed25519_from_bytes(&mut secret)?)
}

pub fn build_swarm(keypair: Keypair) -> anyhow::Result<Swarm<NodeBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| -> Result<NodeBehaviour, BoxError> {
            let local_peer_id = key.public().to_peer_id();

            // Frames are content addressed: identical bytes are one message.
            let message_id_fn = |message: &gossipsub::Message| {
                MessageId::from(blake3::hash(&message.data).to_hex().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> BoxError { format!("gossipsub config: {e}").into() })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| -> BoxError { format!("gossipsub init: {e}").into() })?;

            let mut kademlia = kad::Behaviour::new(local_peer_id, MemoryStore::new(local_peer_id));
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify = identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60)),
            );

            Ok(NodeBehaviour {
                gossipsub,
                kademlia,
                identify,
                relay_client,
                dcutr: dcutr::Behaviour::new(local_peer_id),
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "built tessel swarm");

    Ok(swarm)
}
