use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tessel_net::{keypair_from_identity, spawn_swarm, PubSub, SwarmConfig, SwarmNotification, SwarmPubSub};
use tessel_server::api::{self, AppState};
use tessel_server::config::ServerConfig;
use tessel_server::service::CafeService;
use tessel_shared::Identity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tessel_server=debug,tessel_net=info")),
        )
        .init();

    info!("Starting Tessel cafe v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and the cafe identity
    // -----------------------------------------------------------------------
    let config = Arc::new(ServerConfig::from_env());
    info!(?config, "Loaded configuration");

    std::fs::create_dir_all(&config.data_path)?;
    let identity = Identity::load_or_generate(&config.data_path.join("cafe.key"))?;
    info!(address = %identity.address(), "Cafe identity loaded");

    // -----------------------------------------------------------------------
    // 3. Join the swarm
    // -----------------------------------------------------------------------
    let keypair = keypair_from_identity(&identity)?;
    let (cmd_tx, notif_rx, peer_id) = spawn_swarm(
        keypair,
        SwarmConfig {
            bootstrap_peers_path: config.bootstrap_peers.clone(),
            listen_port: config.listen_port,
            extra_dials: Vec::new(),
        },
    )
    .await?;
    info!(peer_id = %peer_id, port = config.listen_port, "Swarm running in background");

    let (pubsub, mut events) = SwarmPubSub::new(cmd_tx, notif_rx);
    let pubsub: Arc<dyn PubSub> = Arc::new(pubsub);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SwarmNotification::PeerConnected { peer_id, address } => {
                    debug!(peer = %peer_id, addr = %address, "peer connected");
                }
                SwarmNotification::PeerDisconnected { peer_id } => {
                    debug!(peer = %peer_id, "peer disconnected");
                }
                SwarmNotification::MessageReceived { .. } => {}
            }
        }
    });

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let service = Arc::new(CafeService::open(config.clone(), identity, pubsub).await?);
    let app_state = AppState::new(service.clone(), config.clone());

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Inbox delivery worker
    tokio::spawn(service.relay().clone().run());

    // Answer network queries from our own directory
    let query_node = service.query_node().clone();
    tokio::spawn(async move {
        if let Err(e) = query_node.run_responder().await {
            warn!(error = %e, "query responder stopped");
        }
    });

    // Expired registration nonces (every minute)
    let nonce_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            nonce_service.registrar().purge_expired_nonces().await;
        }
    });

    // Rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_idle(Duration::from_secs(600)).await;
        }
    });

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
