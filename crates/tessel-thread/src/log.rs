use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use tessel_shared::block::{Block, BlockHeader, BlockType};
use tessel_shared::protocol::ThreadEnvelope;
use tessel_shared::thread::Thread;
use tessel_shared::{verify, BlockId, CodecError, Signer, ThreadId};

use crate::error::{Result, ThreadError};
use crate::permissions;
use crate::store::BlockStore;

/// A thread's append-only block DAG.
///
/// Every mutation validates first and then hands the block, the new head
/// set and the updated thread record to [`BlockStore::commit`] in one call,
/// so a failed append leaves nothing behind.
pub struct BlockLog<S: BlockStore> {
    thread: Thread,
    store: Arc<S>,
}

impl<S: BlockStore> BlockLog<S> {
    /// Open the log for `thread`, preferring the stored record when the
    /// thread is already known locally.
    pub fn open(thread: Thread, store: Arc<S>) -> Result<Self> {
        let thread = match store.load_thread(&thread.id)? {
            Some(stored) => stored,
            None => {
                store.save_thread(&thread)?;
                thread
            }
        };
        Ok(Self { thread, store })
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn id(&self) -> &ThreadId {
        &self.thread.id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn heads(&self) -> Result<BTreeSet<BlockId>> {
        self.store.heads(&self.thread.id)
    }

    pub fn get(&self, id: &BlockId) -> Result<Option<Block>> {
        self.store.get(&self.thread.id, id)
    }

    /// Construct, sign and commit a new block authored by `signer`.
    pub fn append(
        &mut self,
        signer: &dyn Signer,
        block_type: BlockType,
        parents: Vec<BlockId>,
        target: Option<String>,
        body: Vec<u8>,
    ) -> Result<Block> {
        if block_type == BlockType::Merge {
            return Err(ThreadError::MalformedBlock(
                "MERGE blocks are produced by merge()".into(),
            ));
        }
        let author = signer.address();
        permissions::check(&self.thread, &author, block_type, target.as_deref())?;
        self.check_parents(&parents)?;

        let header = BlockHeader {
            thread: self.thread.id.clone(),
            author: Some(author),
            block_type,
            date: Utc::now(),
            parents,
            target,
            body,
        };
        let sig = signer
            .sign(&header.to_bytes()?)
            .map_err(CodecError::SigningError)?;
        let block = Block::new(header, Some(sig))?;

        self.commit(&block)?;
        debug!(thread = %self.thread.id, block = %block.id, kind = %block_type, "appended block");
        Ok(block)
    }

    /// Append on top of the current heads.
    pub fn add(
        &mut self,
        signer: &dyn Signer,
        block_type: BlockType,
        target: Option<String>,
        body: Vec<u8>,
    ) -> Result<Block> {
        let parents = self.heads()?.into_iter().collect();
        self.append(signer, block_type, parents, target, body)
    }

    /// Collapse concurrent heads into one MERGE block.
    ///
    /// Parents are the heads in ascending id order, the author is empty and
    /// the date is one millisecond past the newest parent, so every replica
    /// holding the same heads builds a byte-identical block.
    pub fn merge(&mut self) -> Result<Option<Block>> {
        let heads = self.heads()?;
        if heads.len() < 2 {
            return Ok(None);
        }
        let parents: Vec<BlockId> = heads.into_iter().collect();
        let date = self.merge_date(&parents)?;

        let block = Block::new(
            BlockHeader {
                thread: self.thread.id.clone(),
                author: None,
                block_type: BlockType::Merge,
                date,
                parents,
                target: None,
                body: Vec::new(),
            },
            None,
        )?;

        if self.store.contains(&self.thread.id, &block.id)? {
            return Ok(None);
        }
        self.commit(&block)?;
        debug!(thread = %self.thread.id, block = %block.id, parents = block.parents().len(), "merged heads");
        Ok(Some(block))
    }

    /// Accept a block produced elsewhere. Returns `false` when the block
    /// was already known.
    pub fn ingest(&mut self, block: Block) -> Result<bool> {
        if block.header.thread != self.thread.id {
            return Err(ThreadError::MalformedBlock(format!(
                "block {} belongs to thread {}",
                block.id, block.header.thread
            )));
        }
        if Block::compute_id(&block.header, block.sig.as_deref())? != block.id {
            return Err(ThreadError::MalformedBlock(format!(
                "block {} does not match its content",
                block.id
            )));
        }
        if self.store.contains(&self.thread.id, &block.id)? {
            return Ok(false);
        }

        if block.block_type() == BlockType::Merge {
            self.validate_merge(&block)?;
        } else {
            let author = block
                .header
                .author
                .ok_or_else(|| ThreadError::MalformedBlock("block has no author".into()))?;
            let sig = block
                .sig
                .as_deref()
                .ok_or_else(|| ThreadError::MalformedBlock("block is unsigned".into()))?;
            if !verify(&author, &block.header.to_bytes()?, sig) {
                return Err(CodecError::InvalidSignature.into());
            }
            self.check_parents(block.parents())?;
            permissions::check(
                &self.thread,
                &author,
                block.block_type(),
                block.header.target.as_deref(),
            )?;
        }

        self.commit(&block)?;
        debug!(thread = %self.thread.id, block = %block.id, kind = %block.block_type(), "ingested block");
        Ok(true)
    }

    /// Ancestors of `from`, starting with `from` itself.
    ///
    /// A block is yielded only after every one of its descendants in the
    /// walk, whatever the blocks' clocks say; among the blocks ready at a
    /// given step the newest comes first. Blocks reachable along several
    /// paths are yielded once. The ancestry is loaded when the walk starts.
    pub fn walk(&self, from: &BlockId) -> Walk {
        let mut walk = Walk {
            queue: BinaryHeap::new(),
            pending: HashMap::new(),
            children: HashMap::new(),
            failed: None,
        };
        walk.load(self.store.as_ref(), &self.thread.id, from);
        walk
    }

    /// Every block reachable from the current heads, newest first.
    pub fn history(&self) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for head in self.heads()? {
            for block in self.walk(&head) {
                let block = block?;
                if seen.insert(block.id.clone()) {
                    out.push(block);
                }
            }
        }
        out.sort_by(|a, b| b.date().cmp(&a.date()).then_with(|| b.id.cmp(&a.id)));
        Ok(out)
    }

    /// Verify that every parent reference resolves inside this thread and
    /// that the stored heads are exactly the blocks nobody points at.
    pub fn check_integrity(&self) -> Result<()> {
        let blocks = self.store.list(&self.thread.id)?;
        let ids: HashSet<&BlockId> = blocks.iter().map(|b| &b.id).collect();
        let mut referenced = HashSet::new();
        for block in &blocks {
            for parent in block.parents() {
                if !ids.contains(parent) {
                    return Err(ThreadError::UnknownParent(parent.clone()));
                }
                referenced.insert(parent);
            }
        }
        let computed: BTreeSet<BlockId> = ids
            .into_iter()
            .filter(|id| !referenced.contains(id))
            .cloned()
            .collect();
        if computed != self.heads()? {
            return Err(ThreadError::MalformedBlock(
                "stored heads disagree with the block graph".into(),
            ));
        }
        Ok(())
    }

    /// Encrypt `block` with the thread key for transport.
    pub fn seal_block(&self, block: &Block) -> Result<ThreadEnvelope> {
        Ok(ThreadEnvelope {
            thread: self.thread.id.clone(),
            hash: block.id.to_string(),
            ciphertext: self.thread.encrypt(&block.to_bytes()?)?,
        })
    }

    /// Decrypt and ingest a block received in a thread envelope.
    pub fn ingest_envelope(&mut self, envelope: &ThreadEnvelope) -> Result<bool> {
        if envelope.thread != self.thread.id {
            return Err(ThreadError::MalformedBlock("envelope for another thread".into()));
        }
        let block = Block::from_bytes(&self.thread.decrypt(&envelope.ciphertext)?)?;
        if block.id.as_str() != envelope.hash {
            return Err(ThreadError::MalformedBlock("envelope hash mismatch".into()));
        }
        self.ingest(block)
    }

    fn check_parents(&self, parents: &[BlockId]) -> Result<()> {
        let mut unique = HashSet::new();
        for parent in parents {
            if !unique.insert(parent) {
                return Err(ThreadError::MalformedBlock(format!("duplicate parent {parent}")));
            }
            if !self.store.contains(&self.thread.id, parent)? {
                return Err(ThreadError::UnknownParent(parent.clone()));
            }
        }
        Ok(())
    }

    fn merge_date(&self, parents: &[BlockId]) -> Result<DateTime<Utc>> {
        let mut newest: Option<DateTime<Utc>> = None;
        for id in parents {
            let parent = self
                .get(id)?
                .ok_or_else(|| ThreadError::UnknownParent(id.clone()))?;
            newest = Some(newest.map_or(parent.date(), |d| d.max(parent.date())));
        }
        let newest = newest.ok_or_else(|| ThreadError::MalformedBlock("merge without parents".into()))?;
        Ok(newest + Duration::milliseconds(1))
    }

    fn validate_merge(&self, block: &Block) -> Result<()> {
        let header = &block.header;
        if header.author.is_some() || block.sig.is_some() {
            return Err(ThreadError::MalformedBlock("MERGE blocks are unauthored".into()));
        }
        if header.parents.len() < 2 || !header.parents.windows(2).all(|w| w[0] < w[1]) {
            return Err(ThreadError::MalformedBlock(
                "MERGE parents must be 2+ ids in ascending order".into(),
            ));
        }
        if header.target.is_some() || !header.body.is_empty() {
            return Err(ThreadError::MalformedBlock("MERGE blocks carry no content".into()));
        }
        self.check_parents(&header.parents)?;
        if header.date != self.merge_date(&header.parents)? {
            return Err(ThreadError::MalformedBlock("MERGE date is not derived from its parents".into()));
        }
        Ok(())
    }

    fn commit(&mut self, block: &Block) -> Result<()> {
        let mut heads = self.heads()?;
        for parent in block.parents() {
            heads.remove(parent);
        }
        heads.insert(block.id.clone());

        let mut thread = self.thread.clone();
        thread.block_count += 1;
        if heads.len() == 1 {
            thread.head = Some(block.id.clone());
            thread.head_block = Some(Box::new(block.clone()));
        } else {
            thread.head = None;
            thread.head_block = None;
        }

        self.store.commit(&thread, block, &heads)?;
        self.thread = thread;
        Ok(())
    }
}

/// Descendants-first traversal produced by [`BlockLog::walk`].
pub struct Walk {
    /// Blocks whose descendants in the walk have all been yielded.
    queue: BinaryHeap<(DateTime<Utc>, BlockId)>,
    pending: HashMap<BlockId, Block>,
    /// Children not yet yielded, per block.
    children: HashMap<BlockId, usize>,
    failed: Option<ThreadError>,
}

impl Walk {
    fn load<S: BlockStore>(&mut self, store: &S, thread: &ThreadId, from: &BlockId) {
        let mut stack = vec![from.clone()];
        let mut seen = HashSet::from([from.clone()]);
        while let Some(id) = stack.pop() {
            let block = match store.get(thread, &id) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    self.failed = Some(ThreadError::NotFound(id));
                    return;
                }
                Err(e) => {
                    self.failed = Some(e);
                    return;
                }
            };
            for parent in block.parents() {
                *self.children.entry(parent.clone()).or_default() += 1;
                if seen.insert(parent.clone()) {
                    stack.push(parent.clone());
                }
            }
            self.pending.insert(id, block);
        }
        if let Some(block) = self.pending.get(from) {
            self.queue.push((block.date(), from.clone()));
        }
    }
}

impl Iterator for Walk {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            self.queue.clear();
            return Some(Err(e));
        }
        let (_, id) = self.queue.pop()?;
        let block = self.pending.remove(&id)?;
        for parent in block.parents() {
            let Some(left) = self.children.get_mut(parent) else {
                continue;
            };
            *left -= 1;
            if *left == 0 {
                if let Some(ready) = self.pending.get(parent) {
                    self.queue.push((ready.date(), parent.clone()));
                }
            }
        }
        Some(Ok(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockStore;
    use tessel_shared::thread::{ThreadSharing, ThreadType};
    use tessel_shared::{Cid, Identity};

    fn open_thread(initiator: &Identity) -> Thread {
        Thread::new(
            "shared",
            initiator.address(),
            ThreadType::Open,
            ThreadSharing::Shared,
            vec![],
        )
    }

    fn replica(thread: &Thread) -> BlockLog<MemoryBlockStore> {
        BlockLog::open(thread.clone(), Arc::new(MemoryBlockStore::new())).unwrap()
    }

    #[test]
    fn test_unknown_parent_rejected_without_mutation() {
        let x = Identity::generate();
        let mut log = replica(&open_thread(&x));
        let missing = Cid::of(b"missing");
        let err = log
            .append(&x, BlockType::Message, vec![missing.clone()], None, b"hi".to_vec())
            .unwrap_err();
        assert!(matches!(err, ThreadError::UnknownParent(id) if id == missing));
        assert!(log.heads().unwrap().is_empty());
        assert_eq!(log.thread().block_count, 0);
    }

    #[test]
    fn test_permission_denied_without_mutation() {
        let owner = Identity::generate();
        let thread = Thread::new(
            "private",
            owner.address(),
            ThreadType::Private,
            ThreadSharing::NotShared,
            vec![],
        );
        let mut log = replica(&thread);
        let outsider = Identity::generate();
        let err = log
            .append(&outsider, BlockType::Message, vec![], None, vec![])
            .unwrap_err();
        assert!(matches!(err, ThreadError::PermissionDenied(_)));
        assert_eq!(log.thread().block_count, 0);
    }

    #[test]
    fn test_single_author_chain_has_one_head() {
        let x = Identity::generate();
        let mut log = replica(&open_thread(&x));
        let a = log.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        let b = log
            .append(&x, BlockType::Message, vec![a.id.clone()], None, b"b".to_vec())
            .unwrap();
        assert_eq!(log.heads().unwrap(), BTreeSet::from([b.id.clone()]));
        assert_eq!(log.thread().head, Some(b.id));
        assert_eq!(log.thread().block_count, 2);
        assert!(log.merge().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_appends_merge_identically() {
        let x = Identity::generate();
        let y = Identity::generate();
        let thread = open_thread(&x);
        let mut rx = replica(&thread);
        let mut ry = replica(&thread);

        let a = rx.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        assert!(ry.ingest(a.clone()).unwrap());

        let b = rx
            .append(&x, BlockType::Message, vec![a.id.clone()], None, b"from x".to_vec())
            .unwrap();
        let c = ry
            .append(&y, BlockType::Message, vec![a.id.clone()], None, b"from y".to_vec())
            .unwrap();

        rx.ingest(c.clone()).unwrap();
        ry.ingest(b.clone()).unwrap();
        assert_eq!(rx.heads().unwrap().len(), 2);
        assert!(rx.thread().head.is_none());

        let mx = rx.merge().unwrap().unwrap();
        let my = ry.merge().unwrap().unwrap();
        assert_eq!(mx, my);

        let mut expected = vec![b.id.clone(), c.id.clone()];
        expected.sort();
        assert_eq!(mx.parents(), expected.as_slice());
        assert!(mx.header.author.is_none());
        assert_eq!(mx.date(), b.date().max(c.date()) + Duration::milliseconds(1));

        // the merge arriving from the other replica is already known
        assert!(!rx.ingest(my).unwrap());
        assert_eq!(rx.heads().unwrap(), ry.heads().unwrap());
        assert_eq!(rx.thread().head, Some(mx.id));
        rx.check_integrity().unwrap();
        ry.check_integrity().unwrap();
    }

    #[test]
    fn test_three_authors_converge() {
        let authors: Vec<Identity> = (0..3).map(|_| Identity::generate()).collect();
        let thread = open_thread(&authors[0]);
        let mut replicas: Vec<_> = (0..3).map(|_| replica(&thread)).collect();

        let genesis = replicas[0]
            .append(&authors[0], BlockType::Join, vec![], None, vec![])
            .unwrap();
        for r in replicas.iter_mut().skip(1) {
            r.ingest(genesis.clone()).unwrap();
        }

        let mut written = Vec::new();
        for (i, r) in replicas.iter_mut().enumerate() {
            written.push(
                r.append(&authors[i], BlockType::Message, vec![genesis.id.clone()], None, vec![i as u8])
                    .unwrap(),
            );
        }
        for r in replicas.iter_mut() {
            for block in &written {
                r.ingest(block.clone()).unwrap();
            }
        }

        let merges: Vec<Block> = replicas
            .iter_mut()
            .map(|r| r.merge().unwrap().unwrap())
            .collect();
        assert!(merges.windows(2).all(|w| w[0] == w[1]));
        for r in &replicas {
            assert_eq!(r.heads().unwrap(), BTreeSet::from([merges[0].id.clone()]));
            r.check_integrity().unwrap();
        }
    }

    #[test]
    fn test_walk_visits_diamond_once() {
        let x = Identity::generate();
        let y = Identity::generate();
        let thread = open_thread(&x);
        let mut log = replica(&thread);

        let a = log.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        let b = log
            .append(&x, BlockType::Message, vec![a.id.clone()], None, b"b".to_vec())
            .unwrap();
        let c = log
            .append(&y, BlockType::Message, vec![a.id.clone()], None, b"c".to_vec())
            .unwrap();
        let m = log.merge().unwrap().unwrap();

        let walked: Vec<Block> = log.walk(&m.id).map(|b| b.unwrap()).collect();
        let ids: Vec<&BlockId> = walked.iter().map(|b| &b.id).collect();
        assert_eq!(walked.len(), 4);
        assert_eq!(ids[0], &m.id);
        assert_eq!(ids[3], &a.id);
        assert!(ids.contains(&&b.id) && ids.contains(&&c.id));
        assert_eq!(log.history().unwrap().len(), 4);
    }

    fn signed_at(signer: &Identity, thread: &Thread, parents: Vec<BlockId>, date: DateTime<Utc>) -> Block {
        let header = BlockHeader {
            thread: thread.id.clone(),
            author: Some(signer.address()),
            block_type: BlockType::Message,
            date,
            parents,
            target: None,
            body: b"skewed".to_vec(),
        };
        let sig = signer.sign(&header.to_bytes().unwrap()).unwrap();
        Block::new(header, Some(sig)).unwrap()
    }

    #[test]
    fn test_walk_yields_children_before_parents_despite_clock_skew() {
        let x = Identity::generate();
        let y = Identity::generate();
        let thread = open_thread(&x);
        let mut log = replica(&thread);

        let a = log.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        let b = log
            .append(&x, BlockType::Message, vec![a.id.clone()], None, b"b".to_vec())
            .unwrap();
        // y's clock runs an hour behind
        let s = signed_at(&y, &thread, vec![a.id.clone()], a.date() - Duration::hours(1));
        assert!(log.ingest(s.clone()).unwrap());
        let m = log.merge().unwrap().unwrap();

        let ids: Vec<BlockId> = log.walk(&m.id).map(|b| b.unwrap().id).collect();
        assert_eq!(ids, vec![m.id.clone(), b.id.clone(), s.id.clone(), a.id.clone()]);
    }

    #[test]
    fn test_ingest_rejects_forged_signature() {
        let x = Identity::generate();
        let thread = open_thread(&x);
        let mut source = replica(&thread);
        let mut target = replica(&thread);

        let mut block = source.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        block.header.body = b"tampered".to_vec();
        block.id = Block::compute_id(&block.header, block.sig.as_deref()).unwrap();
        assert!(matches!(
            target.ingest(block),
            Err(ThreadError::Codec(CodecError::InvalidSignature))
        ));
        assert!(target.heads().unwrap().is_empty());
    }

    #[test]
    fn test_ingest_requires_parents() {
        let x = Identity::generate();
        let thread = open_thread(&x);
        let mut source = replica(&thread);
        let mut target = replica(&thread);

        let a = source.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        let b = source
            .append(&x, BlockType::Message, vec![a.id.clone()], None, vec![])
            .unwrap();
        assert!(matches!(target.ingest(b.clone()), Err(ThreadError::UnknownParent(_))));
        target.ingest(a).unwrap();
        assert!(target.ingest(b).unwrap());
    }

    #[test]
    fn test_ingest_rejects_unsorted_merge() {
        let x = Identity::generate();
        let y = Identity::generate();
        let thread = open_thread(&x);
        let mut log = replica(&thread);
        let a = log.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        let b = log.append(&y, BlockType::Join, vec![], None, vec![]).unwrap();

        let mut parents = vec![a.id.clone(), b.id.clone()];
        parents.sort();
        parents.reverse();
        let forged = Block::new(
            BlockHeader {
                thread: thread.id.clone(),
                author: None,
                block_type: BlockType::Merge,
                date: a.date().max(b.date()) + Duration::milliseconds(1),
                parents,
                target: None,
                body: vec![],
            },
            None,
        )
        .unwrap();
        assert!(matches!(log.ingest(forged), Err(ThreadError::MalformedBlock(_))));
    }

    #[test]
    fn test_envelope_roundtrip_between_replicas() {
        let x = Identity::generate();
        let thread = open_thread(&x);
        let mut source = replica(&thread);
        let mut target = replica(&thread);

        let a = source.append(&x, BlockType::Join, vec![], None, vec![]).unwrap();
        let env = source.seal_block(&a).unwrap();
        assert!(target.ingest_envelope(&env).unwrap());
        assert_eq!(target.thread().head, Some(a.id));
    }
}
