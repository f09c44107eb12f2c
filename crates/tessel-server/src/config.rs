//! Cafe configuration loaded from environment variables.
//!
//! Every setting has a default so a cafe can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tessel_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_QUIC_PORT, INBOX_PAGE_SIZE, MAX_DELIVERY_ATTEMPTS,
};

/// Upper bound on the delay between two pushes of the same message.
pub const MAX_DELIVERY_BACKOFF: Duration = Duration::from_secs(60);

/// Cafe configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:40601`
    pub http_addr: SocketAddr,

    /// libp2p QUIC port.
    /// Env: `LISTEN_ADDR` (a `/udp/<port>/quic-v1` multiaddr or a bare port)
    /// Default: `4001`
    pub listen_port: u16,

    /// Directory holding the cafe key, database and objects.
    /// Env: `DATA_PATH`
    /// Default: `./cafe-data`
    pub data_path: PathBuf,

    /// Public URL advertised to clients in their sessions.
    /// Env: `CAFE_URL`
    /// Default: `http://127.0.0.1:40601`
    pub public_url: String,

    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Whether peers may register without a registration token.
    /// Env: `REGISTRATION_OPEN` (true/false)
    /// Default: `true`
    pub registration_open: bool,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Env: `ACCESS_TTL_SECS`, default 7 days.
    pub access_ttl: Duration,

    /// Env: `REFRESH_TTL_SECS`, default 28 days.
    pub refresh_ttl: Duration,

    /// Pushes attempted before a message is dead-lettered.
    /// Env: `MAX_DELIVERY_ATTEMPTS`
    pub max_delivery_attempts: u32,

    /// First retry delay, doubled per failed push up to
    /// [`MAX_DELIVERY_BACKOFF`].
    /// Env: `DELIVERY_BACKOFF_MS`
    /// Default: `1000`
    pub delivery_backoff: Duration,

    /// Messages per check/delete page.
    /// Env: `INBOX_PAGE_SIZE`
    pub inbox_page_size: usize,

    /// Maximum stored object size in bytes (50 MiB).
    /// Env: `MAX_OBJECT_SIZE`
    pub max_object_size: usize,

    /// File of bootstrap multiaddrs, one per line.
    /// Env: `BOOTSTRAP_PEERS`
    pub bootstrap_peers: Option<PathBuf>,

    /// Sustained requests per second allowed from one IP.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Requests one IP may burst before being throttled.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            listen_port: DEFAULT_QUIC_PORT,
            data_path: PathBuf::from("./cafe-data"),
            public_url: format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}"),
            instance_name: "Tessel Cafe".to_string(),
            registration_open: true,
            admin_token: None,
            access_ttl: Duration::from_secs(7 * 24 * 3600),
            refresh_ttl: Duration::from_secs(28 * 24 * 3600),
            max_delivery_attempts: MAX_DELIVERY_ATTEMPTS,
            delivery_backoff: Duration::from_millis(1000),
            inbox_page_size: INBOX_PAGE_SIZE,
            max_object_size: 50 * 1024 * 1024, // 50 MiB
            bootstrap_peers: None,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            match parse_listen_port(&addr) {
                Some(port) => config.listen_port = port,
                None => tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default"),
            }
        }

        if let Ok(path) = std::env::var("DATA_PATH") {
            config.data_path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("CAFE_URL") {
            config.public_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(val) = std::env::var("REGISTRATION_OPEN") {
            config.registration_open = val != "false" && val != "0";
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(secs) = env_number::<u64>("ACCESS_TTL_SECS") {
            config.access_ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = env_number::<u64>("REFRESH_TTL_SECS") {
            config.refresh_ttl = Duration::from_secs(secs);
        }

        if let Some(n) = env_number::<u32>("MAX_DELIVERY_ATTEMPTS") {
            config.max_delivery_attempts = n.max(1);
        }

        if let Some(ms) = env_number::<u64>("DELIVERY_BACKOFF_MS") {
            config.delivery_backoff = Duration::from_millis(ms).min(MAX_DELIVERY_BACKOFF);
        }

        if let Some(n) = env_number::<usize>("INBOX_PAGE_SIZE") {
            config.inbox_page_size = n.max(1);
        }

        if let Some(n) = env_number::<usize>("MAX_OBJECT_SIZE") {
            config.max_object_size = n;
        }

        if let Ok(path) = std::env::var("BOOTSTRAP_PEERS") {
            if !path.is_empty() {
                config.bootstrap_peers = Some(PathBuf::from(path));
            }
        }

        if let Some(n) = env_number::<f64>("RATE_LIMIT_PER_SEC") {
            if n > 0.0 {
                config.rate_limit_per_sec = n;
            }
        }

        if let Some(n) = env_number::<f64>("RATE_LIMIT_BURST") {
            config.rate_limit_burst = n.max(1.0);
        }

        config
    }

    /// Delay before retrying a push that has failed `attempts` times.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.delivery_backoff
            .saturating_mul(1u32 << exp)
            .min(MAX_DELIVERY_BACKOFF)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let val = std::env::var(key).ok()?;
    match val.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %val, "Invalid number, using default");
            None
        }
    }
}

/// Accepts `/ip4/0.0.0.0/udp/4001/quic-v1` style multiaddrs or a bare port.
fn parse_listen_port(value: &str) -> Option<u16> {
    let value = value.trim();
    if let Ok(port) = value.parse::<u16>() {
        return Some(port);
    }
    let mut parts = value.split('/');
    while let Some(part) = parts.next() {
        if part == "udp" {
            return parts.next()?.parse().ok();
        }
    }
    None
}
