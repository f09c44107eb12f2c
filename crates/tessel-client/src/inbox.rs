//! Fetching and handling messages cafes hold for us.
//!
//! Draining copies every queued message id from a cafe into the local
//! inbox table, deleting pages on the cafe as it goes. Processing then
//! works the local table: each message's object is located, opened against
//! its sender and handed to the thread registry. Failures are counted and a
//! message is dropped once it has failed too often.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tessel_shared::models::CafeMessage;
use tessel_shared::protocol::Payload;
use tessel_shared::{open_bytes, Address, Cid};
use tessel_store::SharedDatabase;
use tessel_thread::{BlockStore, ThreadRegistry};

use crate::cafe::CafeClient;
use crate::error::{lock_db, ClientError, Result};
use crate::events::{ClientEvent, EventBus};

pub struct CafeInbox<S: BlockStore> {
    db: SharedDatabase,
    cafes: Arc<CafeClient>,
    registry: Arc<ThreadRegistry<S>>,
    events: EventBus,
    processing: Mutex<()>,
}

impl<S: BlockStore> CafeInbox<S> {
    pub fn new(
        db: SharedDatabase,
        cafes: Arc<CafeClient>,
        registry: Arc<ThreadRegistry<S>>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            cafes,
            registry,
            events,
            processing: Mutex::new(()),
        }
    }

    /// Pull every message `cafe` holds for us. Returns how many were new.
    pub async fn drain(&self, cafe: &Address) -> Result<usize> {
        let mut count = 0;
        loop {
            let page = match self.cafes.check_messages(cafe).await {
                Err(ClientError::SessionExpired(cafe)) => {
                    self.events.emit(ClientEvent::SessionExpired { cafe });
                    return Err(ClientError::SessionExpired(cafe));
                }
                other => other?,
            };
            if page.is_empty() {
                break;
            }
            {
                let db = lock_db(&self.db)?;
                for message in &page {
                    if db.add_inbox_message(cafe, message)? {
                        count += 1;
                    }
                }
            }
            if !self.cafes.delete_messages(cafe).await? {
                break;
            }
        }

        debug!(cafe = %cafe.short(), count, "inbox drained");
        self.events.emit(ClientEvent::InboxDrained { cafe: *cafe, count });
        Ok(count)
    }

    /// Drain every cafe we hold a session with.
    pub async fn drain_all(&self) -> Result<usize> {
        let mut total = 0;
        for session in self.cafes.sessions()? {
            match self.drain(&session.cafe.peer).await {
                Ok(n) => total += n,
                Err(e) => warn!(cafe = %session.cafe.peer.short(), error = %e, "inbox drain failed"),
            }
        }
        Ok(total)
    }

    /// Work through locally queued messages. Returns how many were handled.
    pub async fn process(&self) -> Result<usize> {
        let _guard = self.processing.lock().await;
        let batch = self.cafes.config().inbox_batch;
        let max_attempts = self.cafes.config().inbox_max_attempts;

        let pending = lock_db(&self.db)?.list_inbox_messages(batch)?;
        let mut handled = 0;
        for message in pending {
            match self.handle(&message).await {
                Ok(()) => {
                    lock_db(&self.db)?.delete_inbox_message(&message.id)?;
                    handled += 1;
                }
                Err(e) => {
                    let attempts = lock_db(&self.db)?.add_inbox_attempt(&message.id)?;
                    if attempts >= max_attempts {
                        lock_db(&self.db)?.delete_inbox_message(&message.id)?;
                        warn!(id = %message.id, from = %message.peer.short(), attempts, error = %e, "inbox message dropped");
                        self.events.emit(ClientEvent::MessageDropped {
                            id: message.id.clone(),
                            from: message.peer,
                        });
                    } else {
                        debug!(id = %message.id, attempts, error = %e, "inbox message failed, will retry");
                    }
                }
            }
        }
        if handled > 0 {
            info!(handled, "inbox processed");
        }
        Ok(handled)
    }

    async fn handle(&self, message: &CafeMessage) -> Result<()> {
        let cid = Cid(message.id.clone());
        let data = self.locate(message, &cid).await?;
        let opened = open_bytes(&data, &message.peer)?;

        match opened.payload {
            Payload::ThreadEnvelope(envelope) => {
                let added = self.registry.handle_envelope(&envelope).await?;
                if added {
                    let head = match self.registry.get(&envelope.thread).await {
                        Some(log) => log.lock().await.thread().head.clone(),
                        None => None,
                    };
                    self.events.emit(ClientEvent::ThreadUpdated {
                        thread: envelope.thread,
                        head,
                    });
                }
                Ok(())
            }
            other => Err(ClientError::UnexpectedResponse(format!(
                "{:?} in inbox",
                other.message_type()
            ))),
        }
    }

    /// The message object from the local store, else the cafe that queued
    /// it, else the sender's own inboxes.
    async fn locate(&self, message: &CafeMessage, cid: &Cid) -> Result<Vec<u8>> {
        let (local, via, sender) = {
            let db = lock_db(&self.db)?;
            (
                db.get_object(cid)?,
                db.inbox_message_cafe(&message.id)?,
                db.get_contact(&message.peer)?,
            )
        };
        if let Some(data) = local {
            return Ok(data);
        }

        let mut urls = Vec::new();
        if let Some(via) = via.and_then(|cafe| self.cafes.session(&cafe).ok().flatten()) {
            urls.push(via.cafe.url);
        }
        if let Some(sender) = sender {
            urls.extend(sender.inboxes.into_iter().map(|cafe| cafe.url));
        }
        urls.dedup();

        for url in urls {
            match self.cafes.fetch_object(&url, cid).await {
                Ok(Some(data)) => {
                    lock_db(&self.db)?.put_object(&data)?;
                    return Ok(data);
                }
                Ok(None) => continue,
                Err(e) => debug!(url = %url, cid = %cid, error = %e, "object fetch failed"),
            }
        }
        Err(ClientError::ObjectNotFound(cid.clone()))
    }
}
