//! Store-and-forward relay.
//!
//! Any peer may queue a message for a registered client. Queued messages
//! stay in the client's inbox until the client deletes them page by page;
//! meanwhile a delivery worker pushes a `CafeYouHaveMail` notification on
//! the client's peer topic. Failed pushes back off exponentially, and a
//! message that runs out of attempts is dead-lettered: pushes stop, it is
//! reported, and it remains checkable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use tessel_net::{frame_message, NetError, PubSub};
use tessel_shared::models::{CafeClientMessage, CafeMessage};
use tessel_shared::protocol::{CafeDeliverMessage, Message, Payload};
use tessel_shared::{Address, Signer};
use tessel_store::{QueuedMessage, SharedDatabase};

use crate::config::ServerConfig;
use crate::error::{lock_db, ServerError};

/// Due messages handled per worker pass.
const PASS_SIZE: usize = 256;

/// Idle interval between worker passes.
const WORKER_TICK: Duration = Duration::from_secs(1);

/// Tells a client it has mail waiting.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, client: &Address) -> Result<(), NetError>;
}

/// Publishes `CafeYouHaveMail` on the client's peer topic.
pub struct PubSubNotifier {
    pubsub: Arc<dyn PubSub>,
    signer: Arc<dyn Signer>,
}

impl PubSubNotifier {
    pub fn new(pubsub: Arc<dyn PubSub>, signer: Arc<dyn Signer>) -> Self {
        Self { pubsub, signer }
    }
}

#[async_trait]
impl Notifier for PubSubNotifier {
    async fn notify(&self, client: &Address) -> Result<(), NetError> {
        // a fresh request id keeps gossip from deduplicating repeat pushes
        let message = Message::request(Payload::CafeYouHaveMail, rand::random::<i32>());
        let frame = frame_message(&message, self.signer.as_ref())?;
        self.pubsub.publish(&client.peer_topic(), frame).await
    }
}

pub struct Relay {
    db: SharedDatabase,
    notifier: Arc<dyn Notifier>,
    config: Arc<ServerConfig>,
    wake: Notify,
}

impl Relay {
    pub fn new(db: SharedDatabase, notifier: Arc<dyn Notifier>, config: Arc<ServerConfig>) -> Self {
        Self {
            db,
            notifier,
            config,
            wake: Notify::new(),
        }
    }

    /// Queue `deliver.id` for `deliver.client` on behalf of `from`.
    ///
    /// Returns `false` when the recipient is not registered here; the
    /// message is dropped and the sender is not told.
    pub fn deliver(&self, from: &Address, deliver: &CafeDeliverMessage) -> Result<bool, ServerError> {
        let now = Utc::now();
        {
            let db = lock_db(&self.db)?;
            if db.get_cafe_client(&deliver.client)?.is_none() {
                warn!(
                    client = %deliver.client.short(),
                    from = %from.short(),
                    "delivery for unknown client dropped"
                );
                return Ok(false);
            }
            db.enqueue_client_message(
                &CafeClientMessage {
                    id: deliver.id.clone(),
                    peer: *from,
                    client: deliver.client,
                    date: now,
                },
                now.timestamp_millis(),
            )?;
        }

        debug!(id = %deliver.id, client = %deliver.client.short(), "message queued");
        self.wake.notify_one();
        Ok(true)
    }

    /// The oldest page of `client`'s queue.
    pub fn check(&self, client: &Address) -> Result<Vec<CafeMessage>, ServerError> {
        let db = lock_db(&self.db)?;
        db.touch_cafe_client(client, Utc::now())?;
        Ok(db.list_client_messages(client, self.config.inbox_page_size)?)
    }

    /// Delete the page [`check`](Self::check) returns. `true` means more
    /// messages remain.
    pub fn delete(&self, client: &Address) -> Result<bool, ServerError> {
        let remaining = lock_db(&self.db)?.delete_client_messages(client, self.config.inbox_page_size)?;
        Ok(remaining > 0)
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedMessage>, ServerError> {
        Ok(lock_db(&self.db)?.list_dead_letters(limit)?)
    }

    /// Push every due notification once. Returns how many pushes failed.
    pub async fn run_pass(&self) -> Result<usize, ServerError> {
        let now_ms = Utc::now().timestamp_millis();
        let due = lock_db(&self.db)?.due_client_messages(now_ms, PASS_SIZE)?;

        let mut by_client: BTreeMap<Address, Vec<QueuedMessage>> = BTreeMap::new();
        for queued in due {
            by_client.entry(queued.message.client).or_default().push(queued);
        }

        let mut failed = 0;
        for (client, messages) in by_client {
            let pushed = self.notifier.notify(&client).await;

            let db = lock_db(&self.db)?;
            match pushed {
                Ok(()) => {
                    for queued in &messages {
                        db.mark_client_message_notified(&client, &queued.message.id)?;
                    }
                    debug!(client = %client.short(), count = messages.len(), "client notified");
                }
                Err(e) => {
                    debug!(client = %client.short(), error = %e, "notification failed");
                    failed += messages.len();
                    for queued in &messages {
                        let backoff = self.config.backoff_for(queued.attempts + 1);
                        let next = now_ms + backoff.as_millis() as i64;
                        let attempts = db.retry_client_message(&client, &queued.message.id, next)?;
                        if attempts >= self.config.max_delivery_attempts {
                            db.dead_letter_client_message(&client, &queued.message.id)?;
                            warn!(
                                id = %queued.message.id,
                                client = %client.short(),
                                from = %queued.message.peer.short(),
                                attempts,
                                "message dead-lettered"
                            );
                        }
                    }
                }
            }
        }
        Ok(failed)
    }

    /// Deliver until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        info!("delivery worker started");
        loop {
            if let Err(e) = self.run_pass().await {
                warn!(error = %e, "delivery pass failed");
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(WORKER_TICK) => {}
            }
        }
    }
}
