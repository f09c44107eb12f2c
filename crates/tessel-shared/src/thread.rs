use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::crypto::{self, SymmetricKey};
use crate::error::CryptoError;
use crate::types::{Address, BlockId, ThreadId};

/// Who may write to a thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ThreadType {
    Private,
    ReadOnly,
    Public,
    Open,
}

/// Whether members may re-share a thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ThreadSharing {
    NotShared,
    InviteOnly,
    Shared,
}

/// Sync cursor position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ThreadState {
    LoadingBehind,
    Loaded,
    LoadingAhead,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thread {
    pub id: ThreadId,
    /// Human-facing key name, unique per node
    pub key: String,
    /// Raw symmetric secret for thread content
    pub sk: Vec<u8>,
    pub name: String,
    /// Cid of the schema definition content must conform to
    pub schema: Option<String>,
    pub initiator: Address,
    pub thread_type: ThreadType,
    pub sharing: ThreadSharing,
    /// Empty means every peer is a member.
    pub members: Vec<Address>,
    pub state: ThreadState,
    pub head: Option<BlockId>,
    pub head_block: Option<Box<Block>>,
    pub schema_node: Option<String>,
    pub block_count: u64,
    pub peer_count: u64,
}

impl Thread {
    pub fn new(
        name: impl Into<String>,
        initiator: Address,
        thread_type: ThreadType,
        sharing: ThreadSharing,
        members: Vec<Address>,
    ) -> Self {
        let id = ThreadId::new();
        Self {
            key: id.0.clone(),
            id,
            sk: crypto::generate_symmetric_key().to_vec(),
            name: name.into(),
            schema: None,
            initiator,
            thread_type,
            sharing,
            members,
            state: ThreadState::Loaded,
            head: None,
            head_block: None,
            schema_node: None,
            block_count: 0,
            peer_count: 0,
        }
    }

    pub fn secret(&self) -> Result<SymmetricKey, CryptoError> {
        crypto::key_from_slice(&self.sk)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::encrypt(&self.secret()?, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::decrypt(&self.secret()?, ciphertext)
    }

    /// Encrypt a snapshot of this thread for storage on a cafe. The cafe
    /// only ever sees the ciphertext.
    pub fn seal_backup(&self, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
        let mut snapshot = self.clone();
        snapshot.head_block = None;
        let plaintext = bincode::serialize(&snapshot)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        crypto::encrypt(key, &plaintext)
    }

    pub fn open_backup(key: &SymmetricKey, ciphertext: &[u8]) -> Result<Self, CryptoError> {
        let plaintext = crypto::decrypt(key, ciphertext)?;
        bincode::deserialize(&plaintext).map_err(|e| CryptoError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_roundtrip() {
        let thread = Thread::new(
            "notes",
            Address([3u8; 32]),
            ThreadType::Open,
            ThreadSharing::Shared,
            vec![],
        );
        let key = crypto::generate_symmetric_key();
        let sealed = thread.seal_backup(&key).unwrap();
        let opened = Thread::open_backup(&key, &sealed).unwrap();
        assert_eq!(opened.id, thread.id);
        assert_eq!(opened.sk, thread.sk);

        assert!(Thread::open_backup(&crypto::generate_symmetric_key(), &sealed).is_err());
    }

    #[test]
    fn test_thread_content_encryption() {
        let thread = Thread::new(
            "t",
            Address([4u8; 32]),
            ThreadType::Private,
            ThreadSharing::NotShared,
            vec![],
        );
        let ct = thread.encrypt(b"payload").unwrap();
        assert_eq!(thread.decrypt(&ct).unwrap(), b"payload");
    }
}
