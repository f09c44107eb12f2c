//! Who may append which block kinds to a thread.
//!
//! A thread's `members` list is fixed at creation. An empty list makes
//! every peer a member. The initiator may always read, annotate and write.

use tessel_shared::block::BlockType;
use tessel_shared::thread::{Thread, ThreadSharing, ThreadType};
use tessel_shared::Address;

use crate::error::{Result, ThreadError};

pub fn member(thread: &Thread, addr: &Address) -> bool {
    thread.members.is_empty() || thread.members.contains(addr)
}

pub fn readable(thread: &Thread, addr: &Address) -> bool {
    if *addr == thread.initiator {
        return true;
    }
    match thread.thread_type {
        ThreadType::Private => false,
        ThreadType::ReadOnly | ThreadType::Public | ThreadType::Open => member(thread, addr),
    }
}

pub fn annotatable(thread: &Thread, addr: &Address) -> bool {
    if *addr == thread.initiator {
        return true;
    }
    match thread.thread_type {
        ThreadType::Private | ThreadType::ReadOnly => false,
        ThreadType::Public | ThreadType::Open => member(thread, addr),
    }
}

pub fn writable(thread: &Thread, addr: &Address) -> bool {
    if *addr == thread.initiator {
        return true;
    }
    match thread.thread_type {
        ThreadType::Open => member(thread, addr),
        _ => false,
    }
}

pub fn shareable(thread: &Thread, from: &Address, to: &Address) -> bool {
    match thread.sharing {
        ThreadSharing::NotShared => false,
        ThreadSharing::InviteOnly => *from == thread.initiator && member(thread, to),
        ThreadSharing::Shared => member(thread, from) && member(thread, to),
    }
}

/// Check that `author` may append a block of `block_type`.
///
/// INVITE blocks name the invitee as a hex address in `target`.
pub fn check(
    thread: &Thread,
    author: &Address,
    block_type: BlockType,
    target: Option<&str>,
) -> Result<()> {
    let allowed = match block_type {
        BlockType::Merge | BlockType::Join | BlockType::Leave | BlockType::Announce => {
            readable(thread, author)
        }
        BlockType::Message
        | BlockType::Comment
        | BlockType::Like
        | BlockType::Flag
        | BlockType::Ignore => annotatable(thread, author),
        BlockType::Files => writable(thread, author),
        BlockType::Invite => {
            let invitee = target
                .ok_or_else(|| ThreadError::MalformedBlock("INVITE without invitee".into()))?
                .parse::<Address>()
                .map_err(|_| ThreadError::MalformedBlock("INVITE target is not an address".into()))?;
            shareable(thread, author, &invitee)
        }
    };

    if allowed {
        Ok(())
    } else {
        Err(ThreadError::PermissionDenied(format!(
            "{} may not append {} to {}",
            author.short(),
            block_type,
            thread.id
        )))
    }
}
