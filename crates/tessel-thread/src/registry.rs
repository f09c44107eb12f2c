use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use tessel_shared::protocol::ThreadEnvelope;
use tessel_shared::thread::Thread;
use tessel_shared::ThreadId;

use crate::error::{Result, ThreadError};
use crate::log::BlockLog;
use crate::store::BlockStore;

pub type SharedLog<S> = Arc<Mutex<BlockLog<S>>>;

/// All threads open on this node.
///
/// Each log sits behind its own mutex: writes to one thread are serialized,
/// different threads proceed in parallel.
pub struct ThreadRegistry<S: BlockStore> {
    store: Arc<S>,
    logs: RwLock<HashMap<ThreadId, SharedLog<S>>>,
}

impl<S: BlockStore> ThreadRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            logs: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Open (or return the already open) log for `thread`.
    pub async fn open(&self, thread: Thread) -> Result<SharedLog<S>> {
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get(&thread.id) {
            return Ok(Arc::clone(log));
        }
        let id = thread.id.clone();
        let log = Arc::new(Mutex::new(BlockLog::open(thread, Arc::clone(&self.store))?));
        logs.insert(id.clone(), Arc::clone(&log));
        info!(thread = %id, "opened thread");
        Ok(log)
    }

    pub async fn get(&self, id: &ThreadId) -> Option<SharedLog<S>> {
        self.logs.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<ThreadId> {
        self.logs.read().await.keys().cloned().collect()
    }

    pub async fn close(&self, id: &ThreadId) -> bool {
        self.logs.write().await.remove(id).is_some()
    }

    /// Ingest a received thread envelope and merge any heads it creates.
    /// Returns `true` if the envelope carried a new block.
    pub async fn handle_envelope(&self, envelope: &ThreadEnvelope) -> Result<bool> {
        let log = self
            .get(&envelope.thread)
            .await
            .ok_or_else(|| ThreadError::UnknownThread(envelope.thread.clone()))?;
        let mut log = log.lock().await;
        let added = log.ingest_envelope(envelope)?;
        if added {
            if let Some(merge) = log.merge()? {
                debug!(thread = %envelope.thread, block = %merge.id, "merged after ingest");
            }
        }
        Ok(added)
    }
}
