//! Read-side projection of a block log into feed items.
//!
//! Nothing here writes to the log. Blocks targeted by an IGNORE block are
//! hidden from every mode.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessel_shared::block::{Block, BlockType};
use tessel_shared::{Address, BlockId, ThreadId};

use crate::error::{Result, ThreadError};
use crate::log::BlockLog;
use crate::store::BlockStore;

const FLAT_TYPES: &[BlockType] = &[
    BlockType::Join,
    BlockType::Leave,
    BlockType::Files,
    BlockType::Message,
    BlockType::Comment,
    BlockType::Like,
];

const ANNOTATED_TYPES: &[BlockType] = &[
    BlockType::Join,
    BlockType::Leave,
    BlockType::Files,
    BlockType::Message,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FeedMode {
    /// Every block, newest first
    #[default]
    Chrono,
    /// Content blocks with their comments and likes attached
    Annotated,
    /// Runs of blocks sharing a target collapse into one item
    Stacks,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FeedRequest {
    /// Continue after this block (the previous page's `next`)
    pub offset: Option<BlockId>,
    /// 0 means no limit
    pub limit: usize,
    pub mode: FeedMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Annotation {
    pub id: BlockId,
    pub author: Option<Address>,
    pub date: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub block: BlockId,
    pub thread: ThreadId,
    pub block_type: BlockType,
    pub author: Option<Address>,
    pub date: DateTime<Utc>,
    pub body: Vec<u8>,
    pub comments: Vec<Annotation>,
    pub likes: Vec<Annotation>,
    /// The annotated block, when this item is an annotation whose target
    /// fell outside the page
    pub target: Option<Box<FeedItem>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItemList {
    pub items: Vec<FeedItem>,
    /// Number of blocks the items cover
    pub count: usize,
    pub next: Option<BlockId>,
}

/// The id a block is grouped under: its target for annotations, else itself.
pub fn target_id(block: &Block) -> String {
    match (block.block_type().is_annotation(), &block.header.target) {
        (true, Some(target)) => target.clone(),
        _ => block.id.to_string(),
    }
}

pub fn feed<S: BlockStore>(log: &BlockLog<S>, req: &FeedRequest) -> Result<FeedItemList> {
    let history = log.history()?;
    let ignored: HashSet<String> = history
        .iter()
        .filter(|b| b.block_type() == BlockType::Ignore)
        .filter_map(|b| b.header.target.clone())
        .collect();
    let visible: Vec<&Block> = history
        .iter()
        .filter(|b| !ignored.contains(b.id.as_str()))
        .collect();

    let types = match req.mode {
        FeedMode::Chrono | FeedMode::Stacks => FLAT_TYPES,
        FeedMode::Annotated => ANNOTATED_TYPES,
    };
    let selected: Vec<&Block> = visible
        .iter()
        .copied()
        .filter(|b| types.contains(&b.block_type()))
        .collect();

    let start = match &req.offset {
        Some(offset) => {
            selected
                .iter()
                .position(|b| &b.id == offset)
                .ok_or_else(|| ThreadError::NotFound(offset.clone()))?
                + 1
        }
        None => 0,
    };
    let end = if req.limit == 0 {
        selected.len()
    } else {
        (start + req.limit).min(selected.len())
    };
    let page = &selected[start.min(end)..end];

    let mut items = Vec::new();
    let mut count = 0;
    match req.mode {
        FeedMode::Chrono => {
            for block in page {
                items.push(item(block, &[]));
                count += 1;
            }
        }
        FeedMode::Annotated => {
            for block in page {
                items.push(item(block, &visible));
                count += 1;
            }
        }
        FeedMode::Stacks => {
            for stack in stacks(page) {
                let covered = stack.children.len() + 1;
                if let Some(item) = stack_item(log, &stack, &ignored)? {
                    items.push(item);
                    count += covered;
                }
            }
        }
    }

    let next = match page.last() {
        Some(last) if end < selected.len() => Some(last.id.clone()),
        _ => None,
    };
    Ok(FeedItemList { items, count, next })
}

struct Stack<'a> {
    id: String,
    top: &'a Block,
    children: Vec<&'a Block>,
}

fn stacks<'a>(page: &[&'a Block]) -> Vec<Stack<'a>> {
    let mut out: Vec<Stack<'a>> = Vec::new();
    for &block in page {
        let id = target_id(block);
        match out.last_mut() {
            Some(last) if last.id == id => last.children.push(block),
            _ => out.push(Stack {
                id,
                top: block,
                children: Vec::new(),
            }),
        }
    }
    out
}

fn stack_item<S: BlockStore>(
    log: &BlockLog<S>,
    stack: &Stack<'_>,
    ignored: &HashSet<String>,
) -> Result<Option<FeedItem>> {
    let mut comments = Vec::new();
    let mut likes = Vec::new();
    let mut target: Option<Block> = None;

    let mut handle = |block: &Block, target: &mut Option<Block>| match block.block_type() {
        BlockType::Comment => comments.push(annotation(block)),
        BlockType::Like => likes.push(annotation(block)),
        _ => *target = Some(block.clone()),
    };
    for child in &stack.children {
        handle(child, &mut target);
    }

    // the target is in this stack: top is the newest annotation or the target
    let initial = if target.is_some() {
        handle(stack.top, &mut target);
        true
    } else if !stack.top.block_type().is_annotation() {
        target = Some(stack.top.clone());
        true
    } else {
        // only annotations here; load the target from the log
        if ignored.contains(&stack.id) {
            return Ok(None);
        }
        match log.get(&BlockId::from(stack.id.as_str()))? {
            Some(block) => target = Some(block),
            None => return Ok(None),
        }
        false
    };

    let Some(target) = target else {
        return Ok(None);
    };
    let mut target_item = item(&target, &[]);
    target_item.comments = comments;
    target_item.likes = likes;

    if initial {
        return Ok(Some(target_item));
    }
    let mut top = item(stack.top, &[]);
    top.target = Some(Box::new(target_item));
    Ok(Some(top))
}

fn annotation(block: &Block) -> Annotation {
    Annotation {
        id: block.id.clone(),
        author: block.header.author,
        date: block.date(),
        body: block.header.body.clone(),
    }
}

/// Build an item for `block`, attaching annotations found in `pool`.
fn item(block: &Block, pool: &[&Block]) -> FeedItem {
    let id = block.id.as_str();
    let targeting = |kind: BlockType| {
        pool.iter()
            .filter(|b| b.block_type() == kind && b.header.target.as_deref() == Some(id))
            .map(|b| annotation(b))
            .collect::<Vec<_>>()
    };
    FeedItem {
        block: block.id.clone(),
        thread: block.header.thread.clone(),
        block_type: block.block_type(),
        author: block.header.author,
        date: block.date(),
        body: block.header.body.clone(),
        comments: targeting(BlockType::Comment),
        likes: targeting(BlockType::Like),
        target: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockStore;
    use std::sync::Arc;
    use tessel_shared::thread::{Thread, ThreadSharing, ThreadType};
    use tessel_shared::Identity;

    fn log_with(me: &Identity) -> BlockLog<MemoryBlockStore> {
        let thread = Thread::new("feed", me.address(), ThreadType::Open, ThreadSharing::Shared, vec![]);
        BlockLog::open(thread, Arc::new(MemoryBlockStore::new())).unwrap()
    }

    #[test]
    fn test_chrono_pagination() {
        let me = Identity::generate();
        let mut log = log_with(&me);
        for i in 0..5u8 {
            log.add(&me, BlockType::Message, None, vec![i]).unwrap();
        }

        let first = feed(&log, &FeedRequest { offset: None, limit: 3, mode: FeedMode::Chrono }).unwrap();
        assert_eq!(first.items.len(), 3);
        assert_eq!(first.items[0].body, vec![4]);
        let next = first.next.clone().unwrap();

        let second = feed(&log, &FeedRequest { offset: Some(next), limit: 3, mode: FeedMode::Chrono }).unwrap();
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.items[1].body, vec![0]);
        assert!(second.next.is_none());
    }

    #[test]
    fn test_ignored_blocks_hidden() {
        let me = Identity::generate();
        let mut log = log_with(&me);
        let spam = log.add(&me, BlockType::Message, None, b"spam".to_vec()).unwrap();
        log.add(&me, BlockType::Message, None, b"ok".to_vec()).unwrap();
        log.add(&me, BlockType::Ignore, Some(spam.id.to_string()), vec![]).unwrap();

        let list = feed(&log, &FeedRequest::default()).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].body, b"ok".to_vec());
    }

    #[test]
    fn test_annotated_attaches_comments() {
        let me = Identity::generate();
        let mut log = log_with(&me);
        let post = log.add(&me, BlockType::Message, None, b"post".to_vec()).unwrap();
        log.add(&me, BlockType::Comment, Some(post.id.to_string()), b"nice".to_vec()).unwrap();
        log.add(&me, BlockType::Like, Some(post.id.to_string()), vec![]).unwrap();

        let list = feed(&log, &FeedRequest { mode: FeedMode::Annotated, ..Default::default() }).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].comments.len(), 1);
        assert_eq!(list.items[0].likes.len(), 1);
    }

    #[test]
    fn test_stacks_group_annotations() {
        let me = Identity::generate();
        let mut log = log_with(&me);
        let post = log.add(&me, BlockType::Message, None, b"post".to_vec()).unwrap();
        log.add(&me, BlockType::Comment, Some(post.id.to_string()), b"a".to_vec()).unwrap();
        log.add(&me, BlockType::Comment, Some(post.id.to_string()), b"b".to_vec()).unwrap();

        let list = feed(&log, &FeedRequest { mode: FeedMode::Stacks, ..Default::default() }).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].block, post.id);
        assert_eq!(list.items[0].comments.len(), 2);
        assert_eq!(list.count, 3);
    }

    #[test]
    fn test_stack_loads_target_outside_page() {
        let me = Identity::generate();
        let mut log = log_with(&me);
        let post = log.add(&me, BlockType::Message, None, b"post".to_vec()).unwrap();
        log.add(&me, BlockType::Like, Some(post.id.to_string()), vec![]).unwrap();

        let list = feed(&log, &FeedRequest { offset: None, limit: 1, mode: FeedMode::Stacks }).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].block_type, BlockType::Like);
        let target = list.items[0].target.as_ref().unwrap();
        assert_eq!(target.block, post.id);
        assert!(target.likes.is_empty());
        assert!(list.next.is_some());
    }
}
