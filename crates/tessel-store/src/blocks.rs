use std::collections::BTreeSet;
use std::sync::MutexGuard;

use tessel_shared::block::Block;
use tessel_shared::thread::Thread;
use tessel_shared::{BlockId, ThreadId};
use tessel_thread::{BlockStore, ThreadError};

use crate::database::{Database, SharedDatabase};
use crate::error::StoreError;

/// [`BlockStore`] over the node's SQLite database.
#[derive(Clone)]
pub struct SqliteBlockStore {
    db: SharedDatabase,
}

impl SqliteBlockStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>, ThreadError> {
        self.db
            .lock()
            .map_err(|_| ThreadError::Store(StoreError::Poisoned.to_string()))
    }
}

fn store_err(e: StoreError) -> ThreadError {
    ThreadError::Store(e.to_string())
}

impl BlockStore for SqliteBlockStore {
    fn load_thread(&self, id: &ThreadId) -> Result<Option<Thread>, ThreadError> {
        self.lock()?.get_thread(id).map_err(store_err)
    }

    fn save_thread(&self, thread: &Thread) -> Result<(), ThreadError> {
        self.lock()?.upsert_thread(thread).map_err(store_err)
    }

    fn get(&self, thread: &ThreadId, id: &BlockId) -> Result<Option<Block>, ThreadError> {
        self.lock()?.get_block(thread, id).map_err(store_err)
    }

    fn contains(&self, thread: &ThreadId, id: &BlockId) -> Result<bool, ThreadError> {
        self.lock()?.has_block(thread, id).map_err(store_err)
    }

    fn heads(&self, thread: &ThreadId) -> Result<BTreeSet<BlockId>, ThreadError> {
        self.lock()?.get_heads(thread).map_err(store_err)
    }

    fn list(&self, thread: &ThreadId) -> Result<Vec<Block>, ThreadError> {
        self.lock()?.list_blocks(thread).map_err(store_err)
    }

    fn commit(
        &self,
        thread: &Thread,
        block: &Block,
        heads: &BTreeSet<BlockId>,
    ) -> Result<(), ThreadError> {
        self.lock()?
            .commit_block(thread, block, heads)
            .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessel_shared::block::BlockType;
    use tessel_shared::thread::{ThreadSharing, ThreadType};
    use tessel_shared::Identity;
    use tessel_thread::BlockLog;

    #[test]
    fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let me = Identity::generate();
        let other = Identity::generate();
        let thread = Thread::new("t", me.address(), ThreadType::Open, ThreadSharing::Shared, vec![]);

        let (merge_id, count) = {
            let store = Arc::new(SqliteBlockStore::new(Database::open_at(&path).unwrap().shared()));
            let mut log = BlockLog::open(thread.clone(), store).unwrap();
            let a = log.append(&me, BlockType::Join, vec![], None, vec![]).unwrap();
            log.append(&me, BlockType::Message, vec![a.id.clone()], None, b"x".to_vec())
                .unwrap();
            log.append(&other, BlockType::Message, vec![a.id.clone()], None, b"y".to_vec())
                .unwrap();
            let m = log.merge().unwrap().unwrap();
            (m.id, log.thread().block_count)
        };

        let store = Arc::new(SqliteBlockStore::new(Database::open_at(&path).unwrap().shared()));
        let log = BlockLog::open(thread, store).unwrap();
        assert_eq!(log.thread().block_count, count);
        assert_eq!(log.thread().head.as_ref(), Some(&merge_id));
        assert_eq!(log.heads().unwrap(), BTreeSet::from([merge_id.clone()]));
        assert_eq!(log.walk(&merge_id).count(), 4);
        log.check_integrity().unwrap();
    }
}
