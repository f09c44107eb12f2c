//! # tessel-shared
//!
//! Wire contract shared by every tessel node and cafe: the signed
//! [`envelope::Envelope`], the [`protocol::Message`] frame with its closed
//! [`protocol::Payload`] union, the thread/block/cafe data model, and the
//! identity and content-addressing primitives the rest of the workspace
//! builds on.

pub mod block;
pub mod constants;
pub mod content;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod models;
pub mod protocol;
pub mod query;
pub mod thread;
pub mod types;

pub use envelope::{open, open_bytes, seal, take_frame, write_frame, Envelope};
pub use error::{CodecError, CryptoError, IdentityError};
pub use identity::{verify, Identity, Signer};
pub use types::{Address, BlockId, Cid, ThreadId};
