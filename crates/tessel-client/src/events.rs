use serde::Serialize;
use tokio::sync::broadcast;

use tessel_shared::{Address, BlockId, ThreadId};

pub const EVENT_THREAD_UPDATED: &str = "thread-updated";
pub const EVENT_INBOX_DRAINED: &str = "inbox-drained";
pub const EVENT_MESSAGE_DROPPED: &str = "message-dropped";
pub const EVENT_SESSION_EXPIRED: &str = "session-expired";

const CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// A block from the network landed in a thread.
    ThreadUpdated { thread: ThreadId, head: Option<BlockId> },
    /// Messages fetched from one cafe's inbox.
    InboxDrained { cafe: Address, count: usize },
    /// An inbox message gave up after too many failed attempts.
    MessageDropped { id: String, from: Address },
    /// The cafe refused our refresh token; re-register to continue.
    SessionExpired { cafe: Address },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::ThreadUpdated { .. } => EVENT_THREAD_UPDATED,
            ClientEvent::InboxDrained { .. } => EVENT_INBOX_DRAINED,
            ClientEvent::MessageDropped { .. } => EVENT_MESSAGE_DROPPED,
            ClientEvent::SessionExpired { .. } => EVENT_SESSION_EXPIRED,
        }
    }
}

/// Fan-out of client events to whoever is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        // nobody listening is fine
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!(event = event.name(), "no event listeners");
        }
    }
}
