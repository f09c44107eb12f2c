//! # tessel-store
//!
//! Durable node state backed by SQLite: thread logs and their heads, the
//! contact directory, cafe sessions and fetched inbox messages, and pinned
//! content objects. A cafe keeps its registered clients, session versions,
//! delivery queue and thread backups in the same database.
//!
//! The crate exposes a synchronous `Database` handle with typed CRUD helpers,
//! plus [`SqliteBlockStore`] and [`SqliteContentStore`] adapters that plug the
//! database into the thread log and content layers.

pub mod backups;
pub mod blocks;
pub mod clients;
pub mod contacts;
pub mod database;
pub mod inbox;
pub mod migrations;
pub mod objects;
pub mod queue;
pub mod sessions;
pub mod threads;

mod error;

pub use blocks::SqliteBlockStore;
pub use database::{Database, SharedDatabase};
pub use error::{Result, StoreError};
pub use objects::SqliteContentStore;
pub use queue::QueuedMessage;
