use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::models::{CafeMessage, CafeSession, Contact};
use crate::query::{PubSubQuery, PubSubQueryResults, Query, QueryResults};
use crate::types::{Address, ThreadId};

/// Flat wire message kind. Values are stable on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    ThreadEnvelope = 10,
    CafeChallenge = 50,
    CafeNonce = 51,
    CafeRegistration = 52,
    CafeSession = 53,
    CafeRefreshSession = 54,
    CafeStore = 55,
    CafeObject = 56,
    CafeObjectList = 57,
    CafeStoreThread = 58,
    CafeStored = 59,
    CafeDeliverMessage = 60,
    CafeCheckMessages = 61,
    CafeMessages = 62,
    CafeDeleteMessages = 63,
    CafeDeleteMessagesAck = 64,
    CafeYouHaveMail = 65,
    CafePublishContact = 66,
    CafePublishContactAck = 67,
    CafeQuery = 70,
    CafeQueryRes = 71,
    CafePubSubQuery = 100,
    CafePubSubQueryRes = 101,
    Error = 500,
}

impl MessageType {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// A thread block in transit, encrypted with the thread key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadEnvelope {
    pub thread: ThreadId,
    /// Cid of the block carried in `ciphertext`
    pub hash: String,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeChallenge {
    pub address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeNonce {
    pub value: String,
}

/// Proof of key ownership: `sig` covers `value ‖ nonce`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeRegistration {
    pub address: Address,
    /// Nonce issued by the cafe
    pub value: String,
    /// Nonce chosen by the client
    pub nonce: String,
    pub sig: Vec<u8>,
    /// Registration token, required when the cafe is not open
    pub token: String,
}

impl CafeRegistration {
    pub fn signed_payload(value: &str, nonce: &str) -> Vec<u8> {
        let mut payload = Vec::with_capacity(value.len() + nonce.len());
        payload.extend_from_slice(value.as_bytes());
        payload.extend_from_slice(nonce.as_bytes());
        payload
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeRefreshSession {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeStore {
    pub token: String,
    pub cids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeObject {
    pub token: String,
    pub cid: String,
    pub data: Vec<u8>,
    /// Raw DAG node bytes, used instead of `data` for structured objects
    pub node: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeObjectList {
    pub cids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeStoreThread {
    pub token: String,
    pub id: String,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeStored {
    pub id: String,
}

/// Queue `id` (a content id) for `client`. The sender is the envelope
/// author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeDeliverMessage {
    pub id: String,
    pub client: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeCheckMessages {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeMessages {
    pub messages: Vec<CafeMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeDeleteMessages {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeDeleteMessagesAck {
    pub more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafePublishContact {
    pub token: String,
    pub contact: Contact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafePublishContactAck {
    pub id: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// Closed union of message bodies, one variant per [`MessageType`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    Ping,
    Pong,
    ThreadEnvelope(ThreadEnvelope),
    CafeChallenge(CafeChallenge),
    CafeNonce(CafeNonce),
    CafeRegistration(CafeRegistration),
    CafeSession(CafeSession),
    CafeRefreshSession(CafeRefreshSession),
    CafeStore(CafeStore),
    CafeObject(CafeObject),
    CafeObjectList(CafeObjectList),
    CafeStoreThread(CafeStoreThread),
    CafeStored(CafeStored),
    CafeDeliverMessage(CafeDeliverMessage),
    CafeCheckMessages(CafeCheckMessages),
    CafeMessages(CafeMessages),
    CafeDeleteMessages(CafeDeleteMessages),
    CafeDeleteMessagesAck(CafeDeleteMessagesAck),
    CafeYouHaveMail,
    CafePublishContact(CafePublishContact),
    CafePublishContactAck(CafePublishContactAck),
    CafeQuery(Query),
    CafeQueryRes(QueryResults),
    CafePubSubQuery(PubSubQuery),
    CafePubSubQueryRes(PubSubQueryResults),
    Error(ErrorPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::ThreadEnvelope(_) => MessageType::ThreadEnvelope,
            Self::CafeChallenge(_) => MessageType::CafeChallenge,
            Self::CafeNonce(_) => MessageType::CafeNonce,
            Self::CafeRegistration(_) => MessageType::CafeRegistration,
            Self::CafeSession(_) => MessageType::CafeSession,
            Self::CafeRefreshSession(_) => MessageType::CafeRefreshSession,
            Self::CafeStore(_) => MessageType::CafeStore,
            Self::CafeObject(_) => MessageType::CafeObject,
            Self::CafeObjectList(_) => MessageType::CafeObjectList,
            Self::CafeStoreThread(_) => MessageType::CafeStoreThread,
            Self::CafeStored(_) => MessageType::CafeStored,
            Self::CafeDeliverMessage(_) => MessageType::CafeDeliverMessage,
            Self::CafeCheckMessages(_) => MessageType::CafeCheckMessages,
            Self::CafeMessages(_) => MessageType::CafeMessages,
            Self::CafeDeleteMessages(_) => MessageType::CafeDeleteMessages,
            Self::CafeDeleteMessagesAck(_) => MessageType::CafeDeleteMessagesAck,
            Self::CafeYouHaveMail => MessageType::CafeYouHaveMail,
            Self::CafePublishContact(_) => MessageType::CafePublishContact,
            Self::CafePublishContactAck(_) => MessageType::CafePublishContactAck,
            Self::CafeQuery(_) => MessageType::CafeQuery,
            Self::CafeQueryRes(_) => MessageType::CafeQueryRes,
            Self::CafePubSubQuery(_) => MessageType::CafePubSubQuery,
            Self::CafePubSubQueryRes(_) => MessageType::CafePubSubQueryRes,
            Self::Error(_) => MessageType::Error,
        }
    }
}

/// The frame every envelope carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Payload,
    /// Correlates a response with its request on one connection
    pub request_id: i32,
    pub is_response: bool,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            msg_type: payload.message_type(),
            payload,
            request_id: 0,
            is_response: false,
        }
    }

    pub fn request(payload: Payload, request_id: i32) -> Self {
        Self {
            request_id,
            ..Self::new(payload)
        }
    }

    pub fn response(payload: Payload, request_id: i32) -> Self {
        Self {
            request_id,
            is_response: true,
            ..Self::new(payload)
        }
    }

    pub fn error(code: u16, message: impl Into<String>, request_id: i32) -> Self {
        Self::response(
            Payload::Error(ErrorPayload {
                code,
                message: message.into(),
            }),
            request_id,
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let message: Self = bincode::deserialize(bytes)?;
        message.validate()?;
        Ok(message)
    }

    /// The declared type must agree with the payload variant.
    pub fn validate(&self) -> Result<(), CodecError> {
        let actual = self.payload.message_type();
        if actual != self.msg_type {
            return Err(CodecError::MalformedEnvelope(format!(
                "type {:?} carries {:?} payload",
                self.msg_type, actual
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::CafeChallenge.code(), 50);
        assert_eq!(MessageType::CafePubSubQueryRes.code(), 101);
        assert_eq!(MessageType::Error.code(), 500);
    }

    #[test]
    fn test_mismatched_type_rejected() {
        let mut msg = Message::new(Payload::Ping);
        msg.msg_type = MessageType::Pong;
        let bytes = bincode::serialize(&msg).unwrap();
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_registration_payload_concatenates() {
        assert_eq!(CafeRegistration::signed_payload("n1", "c1"), b"n1c1".to_vec());
    }

    #[test]
    fn test_error_is_response() {
        let msg = Message::error(401, "unauthorized", 9);
        assert!(msg.is_response);
        assert_eq!(msg.request_id, 9);
        assert_eq!(msg.msg_type, MessageType::Error);
    }
}
