// P2P layer: libp2p swarm over QUIC, pubsub framing and network search.

pub mod behaviour;
pub mod discovery;
pub mod error;
pub mod messages;
pub mod peers;
pub mod pubsub;
pub mod query;
pub mod swarm;
pub mod transport;

pub use behaviour::{NodeBehaviour, NodeEvent};
pub use discovery::{load_bootstrap_peers, parse_multiaddrs};
pub use error::{NetError, QueryError};
pub use messages::{frame_message, open_frame, PubSubFrame, QUERY_TOPIC};
pub use peers::{ConnectionInfo, ConnectionMode, PeerTracker};
pub use pubsub::{MemoryNetwork, MemoryPubSub, PubSub, PubSubMessage, Subscription, SwarmPubSub};
pub use query::{query_defaults, QueryNode, QueryResultSet, QuerySource};
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::{build_swarm, keypair_from_identity};
