use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::types::{Address, BlockId, Cid, ThreadId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BlockType {
    Merge,
    Join,
    Leave,
    Invite,
    Message,
    Files,
    Comment,
    Like,
    Announce,
    Flag,
    Ignore,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "MERGE",
            Self::Join => "JOIN",
            Self::Leave => "LEAVE",
            Self::Invite => "INVITE",
            Self::Message => "MESSAGE",
            Self::Files => "FILES",
            Self::Comment => "COMMENT",
            Self::Like => "LIKE",
            Self::Announce => "ANNOUNCE",
            Self::Flag => "FLAG",
            Self::Ignore => "IGNORE",
        }
    }

    /// Blocks that act on another block rather than standing on their own.
    pub fn is_annotation(&self) -> bool {
        matches!(self, Self::Comment | Self::Like)
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signed portion of a block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub thread: ThreadId,
    /// `None` only for MERGE blocks, which must be identical across peers.
    pub author: Option<Address>,
    pub block_type: BlockType,
    pub date: DateTime<Utc>,
    /// Preceding block ids. Empty for genesis, 2+ at a merge point.
    pub parents: Vec<BlockId>,
    pub target: Option<String>,
    pub body: Vec<u8>,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }
}

/// One entry in a thread's append-only DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub header: BlockHeader,
    pub sig: Option<Vec<u8>>,
}

impl Block {
    /// Content address of a header and its signature.
    pub fn compute_id(header: &BlockHeader, sig: Option<&[u8]>) -> Result<BlockId, CodecError> {
        let mut bytes = header.to_bytes()?;
        if let Some(sig) = sig {
            bytes.extend_from_slice(sig);
        }
        Ok(Cid::of(&bytes))
    }

    pub fn new(header: BlockHeader, sig: Option<Vec<u8>>) -> Result<Self, CodecError> {
        let id = Self::compute_id(&header, sig.as_deref())?;
        Ok(Self { id, header, sig })
    }

    pub fn block_type(&self) -> BlockType {
        self.header.block_type
    }

    pub fn parents(&self) -> &[BlockId] {
        &self.header.parents
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.header.date
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.header.body).into_owned()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            thread: ThreadId::from("t1"),
            author: Some(Address([1u8; 32])),
            block_type: BlockType::Message,
            date: Utc::now(),
            parents: vec![],
            target: None,
            body: b"hi".to_vec(),
        }
    }

    #[test]
    fn test_id_covers_signature() {
        let h = header();
        let a = Block::new(h.clone(), Some(vec![1, 2, 3])).unwrap();
        let b = Block::new(h.clone(), Some(vec![1, 2, 4])).unwrap();
        let c = Block::new(h, Some(vec![1, 2, 3])).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, c.id);
    }

    #[test]
    fn test_annotation_kinds() {
        assert!(BlockType::Comment.is_annotation());
        assert!(BlockType::Like.is_annotation());
        assert!(!BlockType::Message.is_annotation());
        assert_eq!(BlockType::Merge.to_string(), "MERGE");
    }
}
