use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use tessel_shared::block::Block;
use tessel_shared::thread::Thread;
use tessel_shared::{BlockId, ThreadId};

use crate::error::{Result, ThreadError};

/// Persistence seam for block logs.
///
/// Blocks are addressed by id within a thread. `commit` must apply the
/// block, the new head set and the updated thread record together or not
/// at all.
pub trait BlockStore: Send + Sync {
    fn load_thread(&self, id: &ThreadId) -> Result<Option<Thread>>;

    fn save_thread(&self, thread: &Thread) -> Result<()>;

    fn get(&self, thread: &ThreadId, id: &BlockId) -> Result<Option<Block>>;

    fn contains(&self, thread: &ThreadId, id: &BlockId) -> Result<bool> {
        Ok(self.get(thread, id)?.is_some())
    }

    fn heads(&self, thread: &ThreadId) -> Result<BTreeSet<BlockId>>;

    fn list(&self, thread: &ThreadId) -> Result<Vec<Block>>;

    fn commit(&self, thread: &Thread, block: &Block, heads: &BTreeSet<BlockId>) -> Result<()>;
}

#[derive(Default)]
struct ThreadEntry {
    thread: Option<Thread>,
    blocks: HashMap<BlockId, Block>,
    heads: BTreeSet<BlockId>,
}

/// Volatile block store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryBlockStore {
    threads: RwLock<HashMap<ThreadId, ThreadEntry>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> ThreadError {
    ThreadError::Store("block store lock poisoned".into())
}

impl BlockStore for MemoryBlockStore {
    fn load_thread(&self, id: &ThreadId) -> Result<Option<Thread>> {
        let threads = self.threads.read().map_err(poisoned)?;
        Ok(threads.get(id).and_then(|e| e.thread.clone()))
    }

    fn save_thread(&self, thread: &Thread) -> Result<()> {
        let mut threads = self.threads.write().map_err(poisoned)?;
        threads.entry(thread.id.clone()).or_default().thread = Some(thread.clone());
        Ok(())
    }

    fn get(&self, thread: &ThreadId, id: &BlockId) -> Result<Option<Block>> {
        let threads = self.threads.read().map_err(poisoned)?;
        Ok(threads.get(thread).and_then(|e| e.blocks.get(id).cloned()))
    }

    fn heads(&self, thread: &ThreadId) -> Result<BTreeSet<BlockId>> {
        let threads = self.threads.read().map_err(poisoned)?;
        Ok(threads.get(thread).map(|e| e.heads.clone()).unwrap_or_default())
    }

    fn list(&self, thread: &ThreadId) -> Result<Vec<Block>> {
        let threads = self.threads.read().map_err(poisoned)?;
        Ok(threads
            .get(thread)
            .map(|e| e.blocks.values().cloned().collect())
            .unwrap_or_default())
    }

    fn commit(&self, thread: &Thread, block: &Block, heads: &BTreeSet<BlockId>) -> Result<()> {
        let mut threads = self.threads.write().map_err(poisoned)?;
        let entry = threads.entry(thread.id.clone()).or_default();
        entry.blocks.insert(block.id.clone(), block.clone());
        entry.heads = heads.clone();
        entry.thread = Some(thread.clone());
        Ok(())
    }
}
