//! Signed transport unit for every peer-to-peer and peer-to-cafe exchange.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_STREAM_FRAME_SIZE;
use crate::error::CodecError;
use crate::identity::{verify, Signer};
use crate::protocol::Message;
use crate::types::Address;

/// A serialized [`Message`] and a detached signature over those exact bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub message: Vec<u8>,
    pub sig: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Serialize `message` and sign it with `signer`.
pub fn seal(message: &Message, signer: &dyn Signer) -> Result<Envelope, CodecError> {
    message.validate()?;
    let bytes = message.encode()?;
    let sig = signer.sign(&bytes)?;
    Ok(Envelope { message: bytes, sig })
}

/// Verify `envelope` against `expected` and parse its message.
///
/// The signature is checked before the payload is parsed, so nothing from
/// an unverified envelope reaches the caller.
pub fn open(envelope: &Envelope, expected: &Address) -> Result<Message, CodecError> {
    if !verify(expected, &envelope.message, &envelope.sig) {
        return Err(CodecError::InvalidSignature);
    }
    Message::decode(&envelope.message)
}

/// Decode transport bytes and [`open`] the result.
pub fn open_bytes(bytes: &[u8], expected: &Address) -> Result<Message, CodecError> {
    open(&Envelope::decode(bytes)?, expected)
}

/// Prefix `bytes` with their big-endian `u32` length, for streaming
/// several envelopes over one response body.
pub fn write_frame(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Pop one complete frame off the front of `buf`. Returns `None` until
/// the whole frame has arrived.
pub fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_STREAM_FRAME_SIZE {
        return Err(CodecError::MalformedEnvelope(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let frame = buf[4..4 + len].to_vec();
    buf.drain(..4 + len);
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptoError;
    use crate::identity::Identity;
    use crate::protocol::{CafeChallenge, Payload};

    struct LockedSigner;

    impl Signer for LockedSigner {
        fn address(&self) -> Address {
            Address([0u8; 32])
        }

        fn sign(&self, _message: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Err(CryptoError::KeyUnavailable)
        }
    }

    fn challenge(id: &Identity) -> Message {
        Message::request(
            Payload::CafeChallenge(CafeChallenge {
                address: id.address(),
            }),
            7,
        )
    }

    #[test]
    fn test_seal_then_open() {
        let id = Identity::generate();
        let msg = challenge(&id);
        let env = seal(&msg, &id).unwrap();
        let bytes = env.encode().unwrap();
        assert_eq!(open_bytes(&bytes, &id.address()).unwrap(), msg);
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let id = Identity::generate();
        let env = seal(&challenge(&id), &id).unwrap();
        let other = Identity::generate();
        assert!(matches!(
            open(&env, &other.address()),
            Err(CodecError::InvalidSignature)
        ));
    }

    #[test]
    fn test_tampered_message_rejected() {
        let id = Identity::generate();
        let mut env = seal(&challenge(&id), &id).unwrap();
        let last = env.message.len() - 1;
        env.message[last] ^= 0x01;
        assert!(matches!(
            open(&env, &id.address()),
            Err(CodecError::InvalidSignature)
        ));
    }

    #[test]
    fn test_signed_garbage_is_malformed() {
        let id = Identity::generate();
        let garbage = vec![0xFFu8; 3];
        let sig = Signer::sign(&id, &garbage).unwrap();
        let env = Envelope {
            message: garbage,
            sig,
        };
        assert!(matches!(
            open(&env, &id.address()),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_undecodable_bytes_are_malformed() {
        let id = Identity::generate();
        assert!(matches!(
            open_bytes(&[1, 2], &id.address()),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_unavailable_key_is_signing_error() {
        let id = Identity::generate();
        assert!(matches!(
            seal(&challenge(&id), &LockedSigner),
            Err(CodecError::SigningError(_))
        ));
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut stream = write_frame(b"first");
        stream.extend(write_frame(b"second"));

        let mut buf = stream[..7].to_vec();
        assert_eq!(take_frame(&mut buf).unwrap(), None);
        buf.extend_from_slice(&stream[7..]);
        assert_eq!(take_frame(&mut buf).unwrap().unwrap(), b"first");
        assert_eq!(take_frame(&mut buf).unwrap().unwrap(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_header_rejected() {
        let mut buf = u32::MAX.to_be_bytes().to_vec();
        assert!(take_frame(&mut buf).is_err());
    }
}
