//! A peer node: identity, threads, cafes and the network wired together.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tessel_net::{PubSub, QueryNode};
use tessel_shared::models::{CafeSession, Contact};
use tessel_shared::protocol::ThreadEnvelope;
use tessel_shared::query::{Query, QueryEvent};
use tessel_shared::{Address, Cid, Identity};
use tessel_store::SharedDatabase;
use tessel_thread::{BlockStore, ThreadRegistry};

use crate::cafe::CafeClient;
use crate::config::ClientConfig;
use crate::directory::LocalDirectory;
use crate::error::{lock_db, Result};
use crate::events::EventBus;
use crate::inbox::CafeInbox;
use crate::outbox::Outbox;
use crate::search::Search;

pub struct Client<S: BlockStore + 'static, P: PubSub + ?Sized + 'static> {
    pub(crate) identity: Arc<Identity>,
    pub(crate) db: SharedDatabase,
    pub(crate) registry: Arc<ThreadRegistry<S>>,
    pub(crate) pubsub: Arc<P>,
    pub(crate) cafes: Arc<CafeClient>,
    pub(crate) inbox: Arc<CafeInbox<S>>,
    pub(crate) events: EventBus,
    outbox: Outbox,
    search: Arc<Search<P>>,
    query_node: Arc<QueryNode<P>>,
}

impl<S: BlockStore + 'static, P: PubSub + ?Sized + 'static> Client<S, P> {
    pub fn new(
        identity: Identity,
        db: SharedDatabase,
        registry: Arc<ThreadRegistry<S>>,
        pubsub: Arc<P>,
        config: ClientConfig,
    ) -> Result<Self> {
        let identity = Arc::new(identity);
        let events = EventBus::new();
        let cafes = Arc::new(CafeClient::new(identity.clone(), db.clone(), config)?);
        let inbox = Arc::new(CafeInbox::new(
            db.clone(),
            cafes.clone(),
            registry.clone(),
            events.clone(),
        ));
        let query_node = Arc::new(QueryNode::new(
            identity.clone(),
            pubsub.clone(),
            Arc::new(LocalDirectory::new(db.clone())),
        ));

        Ok(Self {
            outbox: Outbox::new(identity.clone(), db.clone(), cafes.clone()),
            search: Arc::new(Search::new(cafes.clone(), query_node.clone())),
            identity,
            db,
            registry,
            pubsub,
            cafes,
            inbox,
            events,
            query_node,
        })
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn cafes(&self) -> &Arc<CafeClient> {
        &self.cafes
    }

    pub fn inbox(&self) -> &Arc<CafeInbox<S>> {
        &self.inbox
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry<S>> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register with the cafe at `url` and advertise it as one of our
    /// inboxes.
    pub async fn add_cafe(&self, url: &str, token: &str, username: &str) -> Result<CafeSession> {
        let session = self.cafes.register(url, token).await?;
        self.publish_contact(username).await?;
        Ok(session)
    }

    /// Our own contact card, listing every cafe we hold a session with.
    pub fn contact(&self, username: &str) -> Result<Contact> {
        let mut contact = Contact::new(self.address(), username);
        if let Some(existing) = lock_db(&self.db)?.get_contact(&contact.id)? {
            contact.created = existing.created;
            contact.avatar = existing.avatar;
            contact.threads = existing.threads;
        }
        contact.inboxes = self
            .cafes
            .sessions()?
            .into_iter()
            .map(|s| s.cafe)
            .collect();
        contact.updated = Utc::now();
        Ok(contact)
    }

    /// Publish our contact card on every cafe. Returns how many took it.
    pub async fn publish_contact(&self, username: &str) -> Result<usize> {
        let contact = self.contact(username)?;
        lock_db(&self.db)?.add_or_update_contact(&contact)?;

        let mut published = 0;
        for cafe in &contact.inboxes {
            match self.cafes.publish_contact(&cafe.peer, &contact).await {
                Ok(_) => published += 1,
                Err(e) => warn!(cafe = %cafe.peer.short(), error = %e, "contact publish failed"),
            }
        }
        Ok(published)
    }

    /// Queue a thread block in `recipient`'s cafe inboxes.
    pub async fn send(&self, recipient: &Contact, envelope: ThreadEnvelope) -> Result<Cid> {
        self.outbox.send_envelope(recipient, envelope).await
    }

    pub fn search(&self, query: Query) -> mpsc::UnboundedReceiver<QueryEvent> {
        self.search.search(query)
    }

    /// Start the background work: mail notifications, answering broadcast
    /// queries and periodic inbox sweeps.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = me.watch_mail().await {
                warn!(error = %e, "mail watcher stopped");
            }
        }));

        let node = Arc::clone(&self.query_node);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = node.run_responder().await {
                warn!(error = %e, "query responder stopped");
            }
        }));

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(me.cafes.config().inbox_sweep);
            loop {
                interval.tick().await;
                me.sweep_inbox().await;
            }
        }));

        info!(peer = %self.address().short(), "client started");
        tasks
    }

    /// Drain every cafe and handle what arrived.
    pub async fn sweep_inbox(&self) {
        if let Err(e) = self.inbox.drain_all().await {
            warn!(error = %e, "inbox sweep failed");
        }
        if let Err(e) = self.inbox.process().await {
            warn!(error = %e, "inbox processing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tessel_net::{MemoryNetwork, MemoryPubSub};
    use tessel_server::config::ServerConfig;
    use tessel_shared::block::BlockType;
    use tessel_shared::query::{ContactQuery, QueryOptions, QueryPayload, QueryValue};
    use tessel_shared::thread::{Thread, ThreadSharing, ThreadType};
    use tessel_store::Database;
    use tessel_thread::MemoryBlockStore;

    use crate::cafe::tests::spawn_cafe;
    use crate::events::ClientEvent;

    type TestClient = Client<MemoryBlockStore, MemoryPubSub>;

    fn peer(net: &Arc<MemoryNetwork>) -> (Arc<TestClient>, Identity) {
        let identity = Identity::generate();
        let client = Client::new(
            identity.clone(),
            Database::open_in_memory().unwrap().shared(),
            Arc::new(ThreadRegistry::new(Arc::new(MemoryBlockStore::new()))),
            Arc::new(net.join()),
            ClientConfig::default(),
        )
        .unwrap();
        (Arc::new(client), identity)
    }

    /// Alice writes a block into a thread both peers follow and sends it
    /// to Bob's inbox.
    async fn send_hello(alice: &TestClient, alice_id: &Identity, bob: &TestClient) -> Thread {
        let thread = Thread::new("t", alice.address(), ThreadType::Open, ThreadSharing::Shared, vec![]);
        bob.registry().open(thread.clone()).await.unwrap();
        let log = alice.registry().open(thread.clone()).await.unwrap();
        let envelope = {
            let mut log = log.lock().await;
            let block = log.add(alice_id, BlockType::Message, None, b"hello".to_vec()).unwrap();
            log.seal_block(&block).unwrap()
        };
        alice.send(&bob.contact("bob").unwrap(), envelope).await.unwrap();
        thread
    }

    #[tokio::test]
    async fn test_offline_peer_receives_through_inbox() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let (url, _cafe) = spawn_cafe(&dir, &net, ServerConfig::default()).await;
        let (alice, alice_id) = peer(&net);
        let (bob, _) = peer(&net);
        alice.add_cafe(&url, "", "alice").await.unwrap();
        bob.add_cafe(&url, "", "bob").await.unwrap();

        let thread = send_hello(&alice, &alice_id, &bob).await;

        bob.sweep_inbox().await;
        let log = bob.registry().get(&thread.id).await.unwrap();
        let log = log.lock().await;
        assert_eq!(log.thread().block_count, 1);
        assert_eq!(log.history().unwrap()[0].body_text(), "hello");

        // the cafe queue and the local inbox are both empty again
        let cafe = bob.cafes().sessions().unwrap()[0].cafe.peer;
        assert!(bob.cafes().check_messages(&cafe).await.unwrap().is_empty());
        assert_eq!(bob.inbox().process().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mail_notice_triggers_fetch() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let config = ServerConfig {
            delivery_backoff: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let (url, cafe) = spawn_cafe(&dir, &net, config).await;
        tokio::spawn(cafe.relay().clone().run());

        let (alice, alice_id) = peer(&net);
        let (bob, _) = peer(&net);
        alice.add_cafe(&url, "", "alice").await.unwrap();
        bob.add_cafe(&url, "", "bob").await.unwrap();

        let mut events = bob.events().subscribe();
        tokio::spawn(bob.clone().watch_mail());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let thread = send_hello(&alice, &alice_id, &bob).await;

        let updated = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ClientEvent::ThreadUpdated { thread: id, .. }) = events.recv().await {
                    return id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(updated, thread.id);
    }

    #[tokio::test]
    async fn test_search_finds_contacts_on_cafe() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let (url, _cafe) = spawn_cafe(&dir, &net, ServerConfig::default()).await;
        let (alice, _) = peer(&net);
        let (bob, _) = peer(&net);
        alice.add_cafe(&url, "", "alice").await.unwrap();
        bob.add_cafe(&url, "", "bob").await.unwrap();

        let query = Query::new(
            QueryPayload::Contact(ContactQuery {
                id: None,
                username: Some("ali".into()),
            }),
            QueryOptions {
                remote_only: true,
                wait: 1,
                ..QueryOptions::default()
            },
        );
        let mut rx = bob.search(query);

        let mut found = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                QueryEvent::Data(result) => found.push(result),
                QueryEvent::Done => break,
            }
        }
        assert_eq!(found.len(), 1);
        let QueryValue::Contact(contact) = &found[0].value else {
            panic!("expected a contact");
        };
        assert_eq!(contact.id, alice.address());
        assert_eq!(contact.inboxes.len(), 1);
        assert!(rx.recv().await.is_none());
    }

    /// A cafe that accepts queries but never finishes answering.
    async fn spawn_stalled_cafe() -> String {
        use axum::body::Body;
        use axum::routing::post;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = axum::Router::new().route(
            "/cafe/v0/query",
            post(|| async {
                Body::from_stream(futures::stream::pending::<std::result::Result<Vec<u8>, std::io::Error>>())
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn test_search_ends_within_wait() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let (url, _cafe) = spawn_cafe(&dir, &net, ServerConfig::default()).await;
        let (bob, _) = peer(&net);
        let mut session = bob.cafes().register(&url, "").await.unwrap();
        session.cafe.url = spawn_stalled_cafe().await;
        bob.db.lock().unwrap().upsert_cafe_session(&session).unwrap();

        let query = Query::new(
            QueryPayload::Contact(ContactQuery {
                id: None,
                username: Some("nobody".into()),
            }),
            QueryOptions {
                remote_only: true,
                wait: 1,
                ..QueryOptions::default()
            },
        );
        let started = std::time::Instant::now();
        let mut rx = bob.search(query);
        assert!(matches!(rx.recv().await, Some(QueryEvent::Done)));
        assert!(started.elapsed() < Duration::from_millis(1_800));
    }

    #[tokio::test]
    async fn test_contact_lists_cafe_inboxes() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let (url, cafe) = spawn_cafe(&dir, &net, ServerConfig::default()).await;
        let (alice, _) = peer(&net);

        assert!(alice.contact("alice").unwrap().inboxes.is_empty());
        alice.add_cafe(&url, "", "alice").await.unwrap();
        let contact = alice.contact("alice").unwrap();
        assert_eq!(contact.inboxes.len(), 1);
        assert_eq!(contact.inboxes[0].peer, cafe.cafe().peer);
        assert_eq!(contact.inboxes[0].url, url);
    }
}
