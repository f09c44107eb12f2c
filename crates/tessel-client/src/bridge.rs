//! Pubsub traffic into the node.
//!
//! Our peer topic carries `CafeYouHaveMail` pushes from cafes and blocks
//! sent to us directly; each followed thread's topic carries that thread's
//! blocks. Frames are opened against their claimed sender before anything
//! is acted on.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessel_net::{frame_message, open_frame, NetError, PubSub};
use tessel_shared::protocol::{Message, Payload, ThreadEnvelope};
use tessel_shared::{Address, ThreadId};
use tessel_thread::{BlockStore, ThreadError};

use crate::client::Client;
use crate::error::Result;
use crate::events::ClientEvent;

impl<S: BlockStore + 'static, P: PubSub + ?Sized + 'static> Client<S, P> {
    /// Follow our peer topic until the transport goes away.
    pub async fn watch_mail(self: Arc<Self>) -> Result<()> {
        let topic = self.address().peer_topic();
        let mut frames = self.pubsub.subscribe(&topic).await?;
        info!(topic = %topic, "watching for cafe mail");

        while let Some(data) = frames.recv().await {
            let (from, message) = match open_frame(&data) {
                Ok(opened) => opened,
                Err(e) => {
                    debug!(error = %e, "dropping bad frame on peer topic");
                    continue;
                }
            };
            match message.payload {
                Payload::CafeYouHaveMail => self.on_mail(from).await,
                Payload::ThreadEnvelope(envelope) => self.on_envelope(from, envelope).await,
                other => debug!(kind = ?other.message_type(), from = %from.short(), "ignoring frame on peer topic"),
            }
        }

        warn!("peer topic closed");
        Ok(())
    }

    /// Receive `thread`'s blocks from its topic in the background.
    pub async fn follow_thread(self: &Arc<Self>, thread: ThreadId) -> Result<JoinHandle<()>> {
        let mut frames = self.pubsub.subscribe(&thread.to_topic()).await?;
        let me = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(data) = frames.recv().await {
                match open_frame(&data) {
                    Ok((from, Message { payload: Payload::ThreadEnvelope(envelope), .. }))
                        if envelope.thread == thread =>
                    {
                        me.on_envelope(from, envelope).await
                    }
                    Ok(_) => continue,
                    Err(e) => debug!(thread = %thread, error = %e, "dropping bad thread frame"),
                }
            }
            debug!(thread = %thread, "thread topic closed");
        }))
    }

    /// Broadcast a block to the thread's followers. Returns false when no
    /// one is listening.
    pub async fn publish_block(&self, envelope: ThreadEnvelope) -> Result<bool> {
        let topic = envelope.thread.to_topic();
        let frame = frame_message(&Message::new(Payload::ThreadEnvelope(envelope)), self.identity.as_ref())?;
        match self.pubsub.publish(&topic, frame).await {
            Ok(()) => Ok(true),
            Err(NetError::NoSubscribers(_)) => {
                debug!(topic = %topic, "no followers online");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_mail(&self, from: Address) {
        // only cafes we registered with may wake us
        match self.cafes.session(&from) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(from = %from.short(), "mail notice from unknown cafe");
                return;
            }
            Err(e) => {
                warn!(error = %e, "session lookup failed");
                return;
            }
        }

        if let Err(e) = self.inbox.drain(&from).await {
            warn!(cafe = %from.short(), error = %e, "inbox drain failed");
        }
        if let Err(e) = self.inbox.process().await {
            warn!(error = %e, "inbox processing failed");
        }
    }

    async fn on_envelope(&self, from: Address, envelope: ThreadEnvelope) {
        let thread = envelope.thread.clone();
        match self.registry.handle_envelope(&envelope).await {
            Ok(true) => {
                let head = match self.registry.get(&thread).await {
                    Some(log) => log.lock().await.thread().head.clone(),
                    None => None,
                };
                self.events.emit(ClientEvent::ThreadUpdated { thread, head });
            }
            Ok(false) => {}
            Err(ThreadError::UnknownThread(_)) => {
                debug!(thread = %thread, from = %from.short(), "block for a thread we do not follow");
            }
            Err(e) => warn!(thread = %thread, from = %from.short(), error = %e, "rejected block"),
        }
    }
}
