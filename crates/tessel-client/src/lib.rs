//! # tessel-client
//!
//! The peer side of tessel: registering with cafes over their HTTP API,
//! keeping sessions fresh, sending blocks to offline peers through their
//! cafe inboxes, draining and handling our own inbox, searching local
//! state, cafes and the pubsub network, and following thread topics.

pub mod bridge;
pub mod cafe;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod inbox;
pub mod outbox;
pub mod search;
pub mod state;

pub use cafe::CafeClient;
pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::{ClientEvent, EventBus};
pub use inbox::CafeInbox;
pub use state::SessionStatus;
