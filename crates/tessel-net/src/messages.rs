//! Pubsub framing.
//!
//! Gossipsub authenticates the libp2p peer that forwarded a message, not
//! the tessel account that wrote it. Every pubsub payload is therefore a
//! [`PubSubFrame`]: the sealed envelope plus the address it claims to come
//! from, opened against that address on receipt.

use serde::{Deserialize, Serialize};

use tessel_shared::constants::{CAFE_PROTOCOL, MAX_MESSAGE_SIZE};
use tessel_shared::protocol::Message;
use tessel_shared::{open, seal, Address, Envelope, Signer};

use crate::error::NetError;

/// Topic every node listens on for `CafePubSubQuery` broadcasts.
pub const QUERY_TOPIC: &str = CAFE_PROTOCOL;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PubSubFrame {
    pub from: Address,
    pub envelope: Envelope,
}

impl PubSubFrame {
    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let bytes = bincode::serialize(self).map_err(|e| NetError::MalformedFrame(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::FrameTooLarge(bytes.len()));
        }
        bincode::deserialize(bytes).map_err(|e| NetError::MalformedFrame(e.to_string()))
    }
}

/// Seal `message` as `signer` and frame it for publishing.
pub fn frame_message(message: &Message, signer: &dyn Signer) -> Result<Vec<u8>, NetError> {
    PubSubFrame {
        from: signer.address(),
        envelope: seal(message, signer)?,
    }
    .encode()
}

/// Decode a frame and open its envelope against the claimed sender.
pub fn open_frame(bytes: &[u8]) -> Result<(Address, Message), NetError> {
    let frame = PubSubFrame::decode(bytes)?;
    let message = open(&frame.envelope, &frame.from)?;
    Ok((frame.from, message))
}
