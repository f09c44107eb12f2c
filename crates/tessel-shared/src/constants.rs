/// Cafe service protocol id, also the pubsub topic queries are broadcast on
pub const CAFE_PROTOCOL: &str = "/tessel/cafe/1.0.0";

/// Thread service protocol id advertised over libp2p identify
pub const PROTOCOL_VERSION: &str = "/tessel/1.0.0";

/// Cafe HTTP API version segment (`/cafe/{api}/service`)
pub const CAFE_API_VERSION: &str = "v0";

/// HTTP header carrying the requesting peer's address
pub const PEER_HEADER: &str = "x-tessel-peer";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (thread keys, backup keys)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum pubsub frame size accepted from the swarm (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Maximum length-prefixed frame in a streamed cafe response (64 MiB)
pub const MAX_STREAM_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Number of inbox messages returned / deleted per cafe page
pub const INBOX_PAGE_SIZE: usize = 10;

/// Default number of results a query waits for
pub const DEFAULT_QUERY_LIMIT: i32 = 5;

/// Default seconds a query waits on the network
pub const DEFAULT_QUERY_WAIT_SECS: u32 = 5;

/// Upper bound on a query's network wait
pub const MAX_QUERY_WAIT_SECS: u32 = 10;

/// Relay delivery attempts before a queued message is dead-lettered
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Local inbox handle attempts before a downloaded message is discarded
pub const MAX_INBOX_ATTEMPTS: u32 = 5;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Default cafe HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 40601;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_THREAD_KEY: &str = "tessel-thread-key-v1";
pub const KDF_CONTEXT_BACKUP_KEY: &str = "tessel-backup-key-v1";
pub const KDF_CONTEXT_DB_KEY: &str = "tessel-db-key-v1";
