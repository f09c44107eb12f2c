use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

use tessel_shared::block::{Block, BlockType};
use tessel_shared::models::Contact;
use tessel_shared::thread::{Thread, ThreadState};
use tessel_shared::{verify, Address, Signer};

use crate::error::{Result, ThreadError};
use crate::log::BlockLog;
use crate::store::BlockStore;

/// An offer to join a thread: who is inviting, a snapshot of the thread,
/// and the signed INVITE block naming the invitee.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadInvite {
    pub inviter: Contact,
    pub thread: Thread,
    pub block: Block,
}

impl ThreadInvite {
    /// Encode as a copiable base64url code.
    pub fn encode(&self) -> Result<String> {
        let bytes = bincode::serialize(self).map_err(|e| ThreadError::Invite(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(code: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(code.trim())
            .map_err(|_| ThreadError::Invite("not base64url".into()))?;
        bincode::deserialize(&bytes).map_err(|_| ThreadError::Invite("invalid format".into()))
    }

    /// Check the INVITE block: signed by the inviter, for this thread,
    /// naming `invitee`.
    pub fn verify_for(&self, invitee: &Address) -> Result<()> {
        let header = &self.block.header;
        if header.block_type != BlockType::Invite || header.thread != self.thread.id {
            return Err(ThreadError::Invite("not an invite for this thread".into()));
        }
        if header.author != Some(self.inviter.id) {
            return Err(ThreadError::Invite("invite not authored by inviter".into()));
        }
        let sig = self
            .block
            .sig
            .as_deref()
            .ok_or_else(|| ThreadError::Invite("unsigned invite".into()))?;
        if !verify(&self.inviter.id, &header.to_bytes()?, sig) {
            return Err(ThreadError::Invite("bad invite signature".into()));
        }
        if header.target.as_deref() != Some(invitee.to_hex().as_str()) {
            return Err(ThreadError::Invite("invite is for another peer".into()));
        }
        Ok(())
    }
}

/// Append an INVITE for `invitee` and package it with a thread snapshot.
pub fn create_invite<S: BlockStore>(
    log: &mut BlockLog<S>,
    signer: &dyn Signer,
    inviter: Contact,
    invitee: &Address,
) -> Result<ThreadInvite> {
    let block = log.add(signer, BlockType::Invite, Some(invitee.to_hex()), Vec::new())?;
    let mut snapshot = log.thread().clone();
    snapshot.head_block = None;
    Ok(ThreadInvite {
        inviter,
        thread: snapshot,
        block,
    })
}

/// Join the thread described by `invite`.
///
/// The invitee's log starts empty and behind; its JOIN block references the
/// INVITE through `target` and becomes a head the inviter merges once it
/// receives it.
pub fn accept_invite<S: BlockStore>(
    invite: &ThreadInvite,
    signer: &dyn Signer,
    store: Arc<S>,
) -> Result<(BlockLog<S>, Block)> {
    invite.verify_for(&signer.address())?;

    let mut thread = invite.thread.clone();
    thread.head = None;
    thread.head_block = None;
    thread.block_count = 0;
    thread.state = ThreadState::LoadingBehind;

    let mut log = BlockLog::open(thread, store)?;
    let join = log.append(
        signer,
        BlockType::Join,
        Vec::new(),
        Some(invite.block.id.to_string()),
        Vec::new(),
    )?;
    info!(thread = %log.id(), inviter = %invite.inviter.id.short(), "accepted thread invite");
    Ok((log, join))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockStore;
    use tessel_shared::thread::{ThreadSharing, ThreadType};
    use tessel_shared::Identity;

    fn setup() -> (Identity, BlockLog<MemoryBlockStore>) {
        let owner = Identity::generate();
        let thread = Thread::new(
            "club",
            owner.address(),
            ThreadType::Open,
            ThreadSharing::InviteOnly,
            vec![],
        );
        let mut log = BlockLog::open(thread, Arc::new(MemoryBlockStore::new())).unwrap();
        log.add(&owner, BlockType::Join, None, vec![]).unwrap();
        (owner, log)
    }

    #[test]
    fn test_invite_accept_and_merge_back() {
        let (owner, mut log) = setup();
        let guest = Identity::generate();
        let invite = create_invite(
            &mut log,
            &owner,
            Contact::new(owner.address(), "owner"),
            &guest.address(),
        )
        .unwrap();

        let code = invite.encode().unwrap();
        let decoded = ThreadInvite::decode(&code).unwrap();
        let (guest_log, join) =
            accept_invite(&decoded, &guest, Arc::new(MemoryBlockStore::new())).unwrap();
        assert_eq!(guest_log.thread().state, ThreadState::LoadingBehind);
        assert_eq!(join.header.target.as_deref(), Some(invite.block.id.as_str()));

        assert!(log.ingest(join).unwrap());
        assert!(log.merge().unwrap().is_some());
        log.check_integrity().unwrap();
    }

    #[test]
    fn test_invite_for_someone_else_rejected() {
        let (owner, mut log) = setup();
        let guest = Identity::generate();
        let invite = create_invite(
            &mut log,
            &owner,
            Contact::new(owner.address(), "owner"),
            &guest.address(),
        )
        .unwrap();

        let stranger = Identity::generate();
        assert!(matches!(
            accept_invite(&invite, &stranger, Arc::new(MemoryBlockStore::new())),
            Err(ThreadError::Invite(_))
        ));
    }

    #[test]
    fn test_tampered_invite_rejected() {
        let (owner, mut log) = setup();
        let guest = Identity::generate();
        let mut invite = create_invite(
            &mut log,
            &owner,
            Contact::new(owner.address(), "owner"),
            &guest.address(),
        )
        .unwrap();
        invite.inviter.id = Identity::generate().address();
        assert!(invite.verify_for(&guest.address()).is_err());
    }
}
