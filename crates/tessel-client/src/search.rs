//! Client-side search.
//!
//! Local matches come first. Remote matches come from every cafe we hold a
//! session with, or, with no cafes, from a one-hop pubsub broadcast.
//! Results are deduplicated across sources, `options.wait` bounds the whole
//! search, and the stream always ends with a single [`QueryEvent::Done`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use tessel_net::{query_defaults, PubSub, QueryNode, QueryResultSet};
use tessel_shared::query::{Query, QueryEvent, QueryResult, ResponseType};

use crate::cafe::CafeClient;

pub struct Search<P: PubSub + ?Sized> {
    cafes: Arc<CafeClient>,
    node: Arc<QueryNode<P>>,
}

/// Forward the new items and report whether the search should stop.
fn emit(
    results: &mut QueryResultSet,
    tx: &mpsc::UnboundedSender<QueryEvent>,
    items: Vec<QueryResult>,
) -> bool {
    for item in results.add(items) {
        if tx.send(QueryEvent::Data(item)).is_err() {
            return true;
        }
    }
    results.full()
}

impl<P: PubSub + ?Sized + 'static> Search<P> {
    pub fn new(cafes: Arc<CafeClient>, node: Arc<QueryNode<P>>) -> Self {
        Self { cafes, node }
    }

    pub fn search(self: &Arc<Self>, mut query: Query) -> mpsc::UnboundedReceiver<QueryEvent> {
        query.options = query_defaults(query.options);
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(query, &tx).await;
            let _ = tx.send(QueryEvent::Done);
        });
        rx
    }

    async fn run(&self, query: Query, tx: &mpsc::UnboundedSender<QueryEvent>) {
        let options = query.options.clone();
        let deadline = Instant::now() + Duration::from_secs(u64::from(options.wait));
        let mut results = QueryResultSet::new(options.clone());

        if !options.remote_only {
            match self.node.search_local(&query.payload, &options, true) {
                Ok(local) => {
                    if emit(&mut results, tx, local.list()) {
                        return;
                    }
                }
                Err(e) => warn!(query = %query.id, error = %e, "local search failed"),
            }
        }
        if options.local_only {
            return;
        }

        let sessions = match self.cafes.sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "could not list cafe sessions");
                Vec::new()
            }
        };

        if sessions.is_empty() {
            let search = self
                .node
                .search_pubsub(&query, ResponseType::P2p, |res| emit(&mut results, tx, res.items));
            match tokio::time::timeout_at(deadline, search).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(query = %query.id, error = %e, "pubsub search failed"),
                Err(_) => debug!(query = %query.id, "search timed out"),
            }
            return;
        }

        let (merged_tx, mut merged) = mpsc::unbounded_channel();
        for session in sessions {
            let cafe = session.cafe.peer;
            let mut stream = match tokio::time::timeout_at(deadline, self.cafes.query(&cafe, query.clone())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(cafe = %cafe.short(), error = %e, "cafe query failed");
                    continue;
                }
                Err(_) => {
                    debug!(cafe = %cafe.short(), "cafe query timed out");
                    continue;
                }
            };
            let merged_tx = merged_tx.clone();
            tokio::spawn(async move {
                while let Some(batch) = stream.recv().await {
                    if merged_tx.send(batch).is_err() {
                        break;
                    }
                }
            });
        }
        drop(merged_tx);

        let deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!(query = %query.id, "search timed out");
                    break;
                }
                batch = merged.recv() => {
                    let Some(batch) = batch else { break };
                    if batch.query_type != query.query_type {
                        continue;
                    }
                    if emit(&mut results, tx, batch.items) {
                        break;
                    }
                }
            }
        }
    }
}
