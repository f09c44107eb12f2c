//! # tessel-server
//!
//! Cafe node for the Tessel network. A cafe is an always-on peer that
//! clients register with over HTTP. It provides:
//! - **Sessions**: nonce-challenge registration and rotating bearer tokens
//! - **Object pinning** for content blocks clients push to it
//! - **Thread backups** held as opaque ciphertext per client
//! - **Store-and-forward inboxes** with pubsub wake-ups, retries and a
//!   dead-letter list
//! - **Search** over published contacts and backups, locally and across
//!   the network

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod objects;
pub mod rate_limit;
pub mod relay;
pub mod service;
pub mod sessions;
pub mod tokens;
