//! Network search.
//!
//! A query is answered from local state first and then, unless the caller
//! asked for local results only, broadcast as a `CafePubSubQuery` on
//! [`QUERY_TOPIC`]. Every node that hears the broadcast answers from its
//! own local state and never forwards it, so fan-out is exactly one hop.
//! Answers come back either on the querier's peer topic (P2P) or on a
//! topic named after the query id (PUBSUB).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use tessel_shared::constants::{DEFAULT_QUERY_WAIT_SECS, MAX_QUERY_WAIT_SECS};
use tessel_shared::protocol::{Message, Payload};
use tessel_shared::query::{
    PubSubQuery, PubSubQueryResults, Query, QueryFilter, QueryOptions, QueryPayload, QueryResult,
    QueryResults, ResponseType,
};
use tessel_shared::{Address, Signer};

use crate::error::{NetError, QueryError};
use crate::messages::{frame_message, open_frame, QUERY_TOPIC};
use crate::pubsub::PubSub;

/// Clamp options to the bounds every node enforces.
pub fn query_defaults(mut options: QueryOptions) -> QueryOptions {
    if options.limit <= 0 {
        options.limit = i32::MAX;
    }
    if options.wait == 0 {
        options.wait = DEFAULT_QUERY_WAIT_SECS;
    } else if options.wait > MAX_QUERY_WAIT_SECS {
        options.wait = MAX_QUERY_WAIT_SECS;
    }
    options
}

/// Results collected for one query, unique by id.
#[derive(Debug, Clone)]
pub struct QueryResultSet {
    options: QueryOptions,
    items: HashMap<String, QueryResult>,
    order: Vec<String>,
}

impl QueryResultSet {
    pub fn new(options: QueryOptions) -> Self {
        Self {
            options,
            items: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Merge `items` in and return the ones that are new to this set.
    ///
    /// Excluded ids are never admitted, and no new id is admitted once the
    /// set holds `limit` results. An id already present is only replaced
    /// under [`QueryFilter::HideOlder`], and only by a strictly newer result.
    pub fn add(&mut self, items: impl IntoIterator<Item = QueryResult>) -> Vec<QueryResult> {
        let mut added = Vec::new();
        for item in items {
            if self.options.exclude.contains(&item.id) {
                continue;
            }
            match self.items.get(&item.id) {
                None if self.full() => continue,
                None => self.order.push(item.id.clone()),
                Some(last) => match self.options.filter {
                    QueryFilter::HideOlder if item.date > last.date => {}
                    _ => continue,
                },
            }
            self.items.insert(item.id.clone(), item.clone());
            added.push(item);
        }
        added
    }

    pub fn full(&self) -> bool {
        self.options.limit > 0 && self.items.len() >= self.options.limit as usize
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Results in arrival order.
    pub fn list(&self) -> Vec<QueryResult> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id).cloned())
            .collect()
    }
}

/// This node's own searchable state.
pub trait QuerySource: Send + Sync {
    /// Matches for `payload` from local state, skipping `exclude`d ids.
    /// `local` is stamped on every result.
    fn search(
        &self,
        payload: &QueryPayload,
        exclude: &[String],
        local: bool,
    ) -> Result<Vec<QueryResult>, QueryError>;
}

/// Ids of queries this node is currently broadcasting.
#[derive(Default)]
struct InFlight(Mutex<HashSet<String>>);

impl InFlight {
    fn contains(&self, id: &str) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).contains(id)
    }
}

struct InFlightGuard<'a> {
    set: &'a InFlight,
    id: String,
}

impl<'a> InFlightGuard<'a> {
    fn new(set: &'a InFlight, id: &str) -> Self {
        set.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
        Self {
            set,
            id: id.to_string(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct QueryNode<P: ?Sized> {
    signer: Arc<dyn Signer>,
    pubsub: Arc<P>,
    source: Arc<dyn QuerySource>,
    in_flight: InFlight,
}

impl<P: PubSub + ?Sized> QueryNode<P> {
    pub fn new(signer: Arc<dyn Signer>, pubsub: Arc<P>, source: Arc<dyn QuerySource>) -> Self {
        Self {
            signer,
            pubsub,
            source,
            in_flight: InFlight::default(),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn pubsub(&self) -> &Arc<P> {
        &self.pubsub
    }

    /// Search local state only.
    pub fn search_local(
        &self,
        payload: &QueryPayload,
        options: &QueryOptions,
        local: bool,
    ) -> Result<QueryResultSet, QueryError> {
        let mut results = QueryResultSet::new(options.clone());
        results.add(self.source.search(payload, &options.exclude, local)?);
        Ok(results)
    }

    /// Broadcast `query` and pass every matching answer to `reply` until it
    /// returns true, `query.options.wait` elapses, or the future is dropped.
    pub async fn search_pubsub<F>(
        &self,
        query: &Query,
        response_type: ResponseType,
        mut reply: F,
    ) -> Result<(), QueryError>
    where
        F: FnMut(QueryResults) -> bool + Send,
    {
        let _in_flight = InFlightGuard::new(&self.in_flight, &query.id);

        let results_topic = match response_type {
            ResponseType::P2p => self.address().peer_topic(),
            ResponseType::PubSub => query.id.clone(),
        };
        let mut answers = self.pubsub.subscribe(&results_topic).await?;

        let request = Message::new(Payload::CafePubSubQuery(PubSubQuery {
            id: query.id.clone(),
            query_type: query.query_type,
            payload: query.payload.clone(),
            response_type,
        }));
        let frame = frame_message(&request, self.signer.as_ref())?;
        debug!(query = %query.id, topic = QUERY_TOPIC, "broadcasting query");
        match self.pubsub.publish(QUERY_TOPIC, frame).await {
            Ok(()) => {}
            Err(NetError::NoSubscribers(_)) => {
                debug!(query = %query.id, "no peers to ask");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let wait = Duration::from_secs(u64::from(query.options.wait));
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                data = answers.recv() => {
                    let Some(data) = data else { break };
                    let results = match open_frame(&data) {
                        Ok((_, Message { payload: Payload::CafePubSubQueryRes(res), .. })) => res,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "dropping bad query answer");
                            continue;
                        }
                    };
                    if results.id != query.id || results.results.query_type != query.query_type {
                        continue;
                    }
                    if reply(results.results) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Answer a broadcast query from local state.
    ///
    /// Queries this node is itself broadcasting are ignored, as are queries
    /// with no local matches. Returns whether an answer was sent.
    pub async fn handle_pubsub_query(
        &self,
        from: Address,
        query: PubSubQuery,
    ) -> Result<bool, QueryError> {
        if self.in_flight.contains(&query.id) || from == self.address() {
            return Ok(false);
        }

        let options = QueryOptions {
            filter: QueryFilter::NoFilter,
            limit: 0,
            ..QueryOptions::default()
        };
        let results = self.search_local(&query.payload, &options, false)?;
        if results.is_empty() {
            return Ok(false);
        }

        let answer = Message::new(Payload::CafePubSubQueryRes(PubSubQueryResults {
            id: query.id.clone(),
            results: QueryResults {
                query_type: query.query_type,
                items: results.list(),
            },
        }));
        let topic = match query.response_type {
            ResponseType::P2p => from.peer_topic(),
            ResponseType::PubSub => query.id.clone(),
        };
        debug!(query = %query.id, topic = %topic, count = results.len(), "answering query");

        self.pubsub
            .publish(&topic, frame_message(&answer, self.signer.as_ref())?)
            .await?;
        Ok(true)
    }

    /// Serve broadcast queries until the transport goes away.
    pub async fn run_responder(self: Arc<Self>) -> Result<(), QueryError> {
        let mut queries = self.pubsub.subscribe(QUERY_TOPIC).await?;
        while let Some(data) = queries.recv().await {
            let (from, message) = match open_frame(&data) {
                Ok(opened) => opened,
                Err(e) => {
                    debug!(error = %e, "dropping bad query frame");
                    continue;
                }
            };
            let Payload::CafePubSubQuery(query) = message.payload else {
                continue;
            };
            let id = query.id.clone();
            if let Err(e) = self.handle_pubsub_query(from, query).await {
                warn!(query = %id, peer = %from.short(), error = %e, "query answer failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tessel_shared::models::Contact;
    use tessel_shared::query::{ContactQuery, QueryType, QueryValue};
    use tessel_shared::Identity;

    use crate::pubsub::{MemoryNetwork, MemoryPubSub};

    fn contact_result(id: &str, secs: i64) -> QueryResult {
        let contact = Contact::new(Address([1u8; 32]), id);
        QueryResult {
            id: id.to_string(),
            date: Utc::now() + ChronoDuration::seconds(secs),
            local: false,
            value: QueryValue::Contact(contact),
        }
    }

    struct Directory(Vec<Contact>);

    impl QuerySource for Directory {
        fn search(
            &self,
            payload: &QueryPayload,
            exclude: &[String],
            local: bool,
        ) -> Result<Vec<QueryResult>, QueryError> {
            let QueryPayload::Contact(q) = payload else {
                return Ok(Vec::new());
            };
            Ok(self
                .0
                .iter()
                .filter(|c| q.username.as_deref().map_or(true, |u| c.username.contains(u)))
                .filter(|c| !exclude.contains(&c.id.to_hex()))
                .map(|c| QueryResult {
                    id: c.id.to_hex(),
                    date: c.updated,
                    local,
                    value: QueryValue::Contact(c.clone()),
                })
                .collect())
        }
    }

    #[test]
    fn test_defaults_clamp() {
        let opts = query_defaults(QueryOptions {
            limit: 0,
            wait: 60,
            ..QueryOptions::default()
        });
        assert_eq!(opts.limit, i32::MAX);
        assert_eq!(opts.wait, MAX_QUERY_WAIT_SECS);

        let opts = query_defaults(QueryOptions {
            wait: 0,
            ..QueryOptions::default()
        });
        assert_eq!(opts.wait, DEFAULT_QUERY_WAIT_SECS);
        assert_eq!(opts.limit, 5);
    }

    #[test]
    fn test_result_set_dedup_exclude_and_limit() {
        let mut set = QueryResultSet::new(QueryOptions {
            limit: 2,
            exclude: vec!["seen".into()],
            ..QueryOptions::default()
        });

        let added = set.add(vec![contact_result("a", 0), contact_result("seen", 0)]);
        assert_eq!(added.len(), 1);
        assert!(!set.full());

        assert!(set.add(vec![contact_result("a", 10)]).is_empty());
        assert_eq!(set.add(vec![contact_result("b", 0)]).len(), 1);
        assert!(set.full());
        assert_eq!(
            set.list().iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_oversized_batch_is_cut_at_limit() {
        let mut set = QueryResultSet::new(query_defaults(QueryOptions {
            limit: 2,
            filter: QueryFilter::HideOlder,
            ..QueryOptions::default()
        }));
        let batch = ["a", "b", "c", "d", "e"].map(|id| contact_result(id, 0));

        let added = set.add(batch);
        assert_eq!(added.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(set.full());
        assert!(set.add(vec![contact_result("f", 0)]).is_empty());

        // a newer copy of an admitted result still replaces it
        assert_eq!(set.add(vec![contact_result("b", 30)]).len(), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_hide_older_keeps_newest() {
        let mut set = QueryResultSet::new(QueryOptions {
            filter: QueryFilter::HideOlder,
            ..QueryOptions::default()
        });
        set.add(vec![contact_result("a", 10)]);
        assert!(set.add(vec![contact_result("a", 0)]).is_empty());
        assert_eq!(set.add(vec![contact_result("a", 20)]).len(), 1);
        assert_eq!(set.len(), 1);
    }

    fn node(net: &Arc<MemoryNetwork>, contacts: Vec<Contact>) -> Arc<QueryNode<MemoryPubSub>> {
        Arc::new(QueryNode::new(
            Arc::new(Identity::generate()),
            Arc::new(net.join()),
            Arc::new(Directory(contacts)),
        ))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_pubsub_search_collects_remote_answers() {
        let net = MemoryNetwork::new();
        let querier = node(&net, vec![]);
        let alice = Contact::new(Identity::generate().address(), "alice");
        let bob = Contact::new(Identity::generate().address(), "bob");
        let r1 = node(&net, vec![alice.clone()]);
        let r2 = node(&net, vec![bob]);
        tokio::spawn(r1.clone().run_responder());
        tokio::spawn(r2.clone().run_responder());
        settle().await;

        for response_type in [ResponseType::P2p, ResponseType::PubSub] {
            let query = Query::new(
                QueryPayload::Contact(ContactQuery {
                    id: None,
                    username: Some("ali".into()),
                }),
                QueryOptions {
                    wait: 1,
                    ..QueryOptions::default()
                },
            );
            let mut got = Vec::new();
            querier
                .search_pubsub(&query, response_type, |res| {
                    got.extend(res.items);
                    true
                })
                .await
                .unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].id, alice.id.to_hex());
            assert!(!got[0].local);
        }
    }

    #[tokio::test]
    async fn test_in_flight_queries_are_not_answered() {
        let net = MemoryNetwork::new();
        let me = Contact::new(Identity::generate().address(), "alice");
        let a = node(&net, vec![me]);
        let b = node(&net, vec![]);

        let query = PubSubQuery {
            id: "q1".into(),
            query_type: QueryType::Contacts,
            payload: QueryPayload::Contact(ContactQuery::default()),
            response_type: ResponseType::PubSub,
        };

        let guard = InFlightGuard::new(&a.in_flight, "q1");
        assert!(!a.handle_pubsub_query(b.address(), query.clone()).await.unwrap());
        drop(guard);

        // no one listens on "q1" yet
        assert!(a.handle_pubsub_query(b.address(), query.clone()).await.is_err());

        let _listener = b.pubsub().subscribe("q1").await.unwrap();
        assert!(a.handle_pubsub_query(b.address(), query).await.unwrap());
    }

    #[tokio::test]
    async fn test_search_without_peers_returns_immediately() {
        let net = MemoryNetwork::new();
        let lonely = node(&net, vec![]);
        let query = Query::new(
            QueryPayload::Contact(ContactQuery::default()),
            QueryOptions::default(),
        );
        let started = tokio::time::Instant::now();
        lonely
            .search_pubsub(&query, ResponseType::PubSub, |_| false)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
