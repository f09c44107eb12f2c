//! # tessel-thread
//!
//! The thread block log: an append-only, multi-parent DAG of signed blocks
//! per thread, with deterministic merging of concurrent heads, the
//! permission model that gates appends, thread invites, and the read-side
//! feed projection.

pub mod error;
pub mod feed;
pub mod invite;
pub mod log;
pub mod permissions;
pub mod registry;
pub mod store;

pub use error::{Result, ThreadError};
pub use feed::{feed, FeedItem, FeedItemList, FeedMode, FeedRequest};
pub use invite::{accept_invite, create_invite, ThreadInvite};
pub use log::{BlockLog, Walk};
pub use registry::{SharedLog, ThreadRegistry};
pub use store::{BlockStore, MemoryBlockStore};
