//! Store-and-forward sending.
//!
//! A message for an offline peer is sealed, kept locally, pinned on every
//! cafe we hold a session with, then announced to each cafe the recipient
//! lists as an inbox. The recipient fetches the object by cid from the
//! announcing cafe or from our cafes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tessel_shared::models::Contact;
use tessel_shared::protocol::{Message, Payload, ThreadEnvelope};
use tessel_shared::{seal, Cid, Identity};
use tessel_store::SharedDatabase;

use crate::cafe::CafeClient;
use crate::error::{lock_db, ClientError, Result};

pub struct Outbox {
    identity: Arc<Identity>,
    db: SharedDatabase,
    cafes: Arc<CafeClient>,
}

impl Outbox {
    pub fn new(identity: Arc<Identity>, db: SharedDatabase, cafes: Arc<CafeClient>) -> Self {
        Self { identity, db, cafes }
    }

    pub async fn send_envelope(&self, recipient: &Contact, envelope: ThreadEnvelope) -> Result<Cid> {
        self.send(recipient, Payload::ThreadEnvelope(envelope)).await
    }

    /// Seal `payload` for `recipient` and queue it in their inboxes.
    pub async fn send(&self, recipient: &Contact, payload: Payload) -> Result<Cid> {
        if recipient.inboxes.is_empty() {
            return Err(ClientError::Undeliverable(format!(
                "{} lists no inbox",
                recipient.id.short()
            )));
        }

        let data = seal(&Message::new(payload), self.identity.as_ref())?.encode()?;
        let cid = lock_db(&self.db)?.put_object(&data)?;

        let mut pinned = 0;
        for session in self.cafes.sessions()? {
            match self.cafes.store_all(&session.cafe.peer, std::slice::from_ref(&data)).await {
                Ok(_) => pinned += 1,
                Err(e) => warn!(cafe = %session.cafe.peer.short(), error = %e, "pin failed"),
            }
        }
        if pinned == 0 {
            return Err(ClientError::Undeliverable(format!("no cafe holds {cid}")));
        }

        let mut announced = 0;
        for inbox in &recipient.inboxes {
            match self.cafes.deliver(inbox, recipient.id, &cid).await {
                Ok(()) => {
                    debug!(cafe = %inbox.peer.short(), to = %recipient.id.short(), "delivered");
                    announced += 1;
                }
                Err(e) => warn!(cafe = %inbox.url, error = %e, "delivery failed"),
            }
        }
        if announced == 0 {
            return Err(ClientError::Undeliverable(format!(
                "no inbox of {} accepted {cid}",
                recipient.id.short()
            )));
        }

        info!(to = %recipient.id.short(), cid = %cid, pinned, announced, "message sent");
        Ok(cid)
    }
}
