//! Cafe request dispatch.
//!
//! Requests arrive as envelopes already opened against the requesting
//! peer. Every request gets a sealed response, an ERROR frame when it
//! fails, except `CafeDeliverMessage`, which is answered with nothing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use tessel_net::{query_defaults, PubSub, QueryNode, QueryResultSet};
use tessel_shared::constants::{CAFE_API_VERSION, CAFE_PROTOCOL};
use tessel_shared::models::{Cafe, CafeClientThread};
use tessel_shared::protocol::{
    CafeDeleteMessagesAck, CafeMessages, CafeObject, CafeObjectList, CafePublishContactAck,
    CafeStored, Message, Payload,
};
use tessel_shared::query::{Query, QueryResult, QueryResults, ResponseType};
use tessel_shared::{seal, Address, Cid, Envelope, Identity, Signer};
use tessel_store::{Database, SharedDatabase};

use crate::config::ServerConfig;
use crate::directory::Directory;
use crate::error::{lock_db, ServerError};
use crate::objects::ObjectStore;
use crate::relay::{Notifier, PubSubNotifier, Relay};
use crate::sessions::Registrar;

pub struct CafeService {
    signer: Arc<dyn Signer>,
    db: SharedDatabase,
    registrar: Registrar,
    relay: Arc<Relay>,
    objects: ObjectStore,
    directory: Arc<Directory>,
    query: Arc<QueryNode<dyn PubSub>>,
}

impl CafeService {
    /// Open the cafe's database and object store under `config.data_path`
    /// and wire the subsystems together. Mail notifications go out over
    /// `pubsub`.
    pub async fn open(
        config: Arc<ServerConfig>,
        identity: Identity,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Self, ServerError> {
        let signer: Arc<dyn Signer> = Arc::new(identity);
        let notifier = Arc::new(PubSubNotifier::new(pubsub.clone(), signer.clone()));
        Self::with_notifier(config, signer, pubsub, notifier).await
    }

    pub async fn with_notifier(
        config: Arc<ServerConfig>,
        signer: Arc<dyn Signer>,
        pubsub: Arc<dyn PubSub>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ServerError> {
        std::fs::create_dir_all(&config.data_path)
            .map_err(|e| ServerError::Internal(format!("Failed to create data path: {e}")))?;
        let db = Database::open_at(&config.data_path.join("cafe.db"))?.shared();
        let objects =
            ObjectStore::new(config.data_path.join("objects"), config.max_object_size).await?;

        let cafe = Cafe {
            peer: signer.address(),
            address: signer.address(),
            api: CAFE_API_VERSION.to_string(),
            protocol: CAFE_PROTOCOL.to_string(),
            node: env!("CARGO_PKG_VERSION").to_string(),
            url: config.public_url.clone(),
            swarm: Vec::new(),
        };

        let directory = Arc::new(Directory::new(db.clone()));
        Ok(Self {
            registrar: Registrar::new(db.clone(), signer.clone(), cafe, &config),
            relay: Arc::new(Relay::new(db.clone(), notifier, config)),
            query: Arc::new(QueryNode::new(signer.clone(), pubsub, directory.clone())),
            signer,
            db,
            objects,
            directory,
        })
    }

    pub fn cafe(&self) -> &Cafe {
        self.registrar.cafe()
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn query_node(&self) -> &Arc<QueryNode<dyn PubSub>> {
        &self.query
    }

    pub fn db(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn seal(&self, message: &Message) -> Result<Envelope, ServerError> {
        Ok(seal(message, self.signer.as_ref())?)
    }

    /// Answer one request from `peer`.
    pub async fn handle(&self, peer: &Address, message: Message) -> Option<Message> {
        let request_id = message.request_id;
        let kind = message.msg_type;
        match self.dispatch(peer, message).await {
            Ok(Some(payload)) => Some(Message::response(payload, request_id)),
            Ok(None) => None,
            Err(e) => {
                debug!(peer = %peer.short(), request = ?kind, error = %e, "request failed");
                Some(e.to_message(request_id))
            }
        }
    }

    async fn dispatch(&self, peer: &Address, message: Message) -> Result<Option<Payload>, ServerError> {
        if message.is_response {
            return Err(ServerError::BadRequest("expected a request".into()));
        }

        let payload = match message.payload {
            Payload::Ping => Payload::Pong,

            Payload::CafeChallenge(challenge) => {
                Payload::CafeNonce(self.registrar.challenge(challenge.address).await)
            }

            Payload::CafeRegistration(reg) => {
                Payload::CafeSession(self.registrar.register(peer, &reg).await?)
            }

            Payload::CafeRefreshSession(req) => {
                Payload::CafeSession(self.registrar.refresh(peer, &req).await?)
            }

            Payload::CafeStore(store) => {
                self.registrar.authenticate(peer, &store.token)?;
                let cids = self.objects.missing(&store.cids).await;
                Payload::CafeObjectList(CafeObjectList { cids })
            }

            Payload::CafeObject(object) => {
                self.registrar.authenticate(peer, &object.token)?;
                Payload::CafeStored(self.store_object(object).await?)
            }

            Payload::CafeStoreThread(thread) => {
                let client = self.registrar.authenticate(peer, &thread.token)?;
                lock_db(&self.db)?.upsert_client_thread(&CafeClientThread {
                    id: thread.id.clone(),
                    client: client.id,
                    ciphertext: thread.ciphertext,
                })?;
                debug!(thread = %thread.id, client = %client.id.short(), "thread backup stored");
                Payload::CafeStored(CafeStored { id: thread.id })
            }

            Payload::CafeDeliverMessage(deliver) => {
                self.relay.deliver(peer, &deliver)?;
                return Ok(None);
            }

            Payload::CafeCheckMessages(check) => {
                let client = self.registrar.authenticate(peer, &check.token)?;
                let messages = self.relay.check(&client.id)?;
                Payload::CafeMessages(CafeMessages { messages })
            }

            Payload::CafeDeleteMessages(delete) => {
                let client = self.registrar.authenticate(peer, &delete.token)?;
                let more = self.relay.delete(&client.id)?;
                Payload::CafeDeleteMessagesAck(CafeDeleteMessagesAck { more })
            }

            Payload::CafePublishContact(publish) => {
                let client = self.registrar.authenticate(peer, &publish.token)?;
                let id = self.directory.publish_contact(&client, &publish.contact)?;
                Payload::CafePublishContactAck(CafePublishContactAck { id })
            }

            Payload::CafeQuery(_) => {
                return Err(ServerError::BadRequest(format!(
                    "queries are served on /cafe/{CAFE_API_VERSION}/query"
                )));
            }

            other => {
                return Err(ServerError::BadRequest(format!(
                    "unexpected {:?} request",
                    other.message_type()
                )));
            }
        };
        Ok(Some(payload))
    }

    async fn store_object(&self, object: CafeObject) -> Result<CafeStored, ServerError> {
        let data = if object.data.is_empty() {
            object.node
        } else {
            object.data
        };
        let cid = Cid(object.cid);
        self.objects.put(&cid, &data).await?;
        Ok(CafeStored { id: cid.0 })
    }

    /// Run `query` for `peer`: this cafe's own matches first, then, unless
    /// the caller wants local results only, whatever the network answers
    /// within the query's wait. Each batch of new results arrives on the
    /// returned channel as a `CafeQueryRes` response; the channel closes
    /// when the query is done.
    pub fn query(
        &self,
        peer: &Address,
        request_id: i32,
        mut query: Query,
    ) -> Result<mpsc::UnboundedReceiver<Message>, ServerError> {
        self.registrar.authenticate(peer, &query.token)?;
        query.options = query_defaults(query.options);

        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.query.clone();
        let peer = *peer;

        tokio::spawn(async move {
            let query_type = query.query_type;
            let mut results = QueryResultSet::new(query.options.clone());

            // returns true once nothing more should be sent
            let mut reply = |items: Vec<QueryResult>| -> bool {
                let added = results.add(items);
                if added.is_empty() {
                    return results.full();
                }
                let message = Message::response(
                    Payload::CafeQueryRes(QueryResults {
                        query_type,
                        items: added,
                    }),
                    request_id,
                );
                tx.send(message).is_err() || results.full()
            };

            if !query.options.remote_only {
                match node.search_local(&query.payload, &query.options, false) {
                    Ok(local) => {
                        if reply(local.list()) {
                            return;
                        }
                    }
                    Err(e) => warn!(query = %query.id, error = %e, "local search failed"),
                }
            }
            if query.options.local_only {
                return;
            }

            if let Err(e) = node
                .search_pubsub(&query, ResponseType::P2p, |res| reply(res.items))
                .await
            {
                warn!(query = %query.id, error = %e, "network search failed");
            }
            debug!(query = %query.id, peer = %peer.short(), "query done");
        });

        Ok(rx)
    }
}
