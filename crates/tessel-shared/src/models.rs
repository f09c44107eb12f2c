use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Address, ThreadId};

/// A relay ("cafe") a peer has registered with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cafe {
    /// Peer id the cafe is reachable at
    pub peer: Address,
    /// Cafe account identity
    pub address: Address,
    pub api: String,
    pub protocol: String,
    pub node: String,
    pub url: String,
    /// Additional reachable multiaddrs
    pub swarm: Vec<String>,
}

/// A known peer. Created on first contact exchange, updated on each newer
/// profile broadcast, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: Address,
    pub username: String,
    pub avatar: Option<String>,
    /// Cafes this peer receives store-and-forward traffic through
    pub inboxes: Vec<Cafe>,
    pub threads: Vec<ThreadId>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Contact {
    pub fn new(id: Address, username: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            username: username.into(),
            avatar: None,
            inboxes: Vec::new(),
            threads: Vec::new(),
            created: now,
            updated: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeSession {
    pub id: String,
    pub access: String,
    pub exp: DateTime<Utc>,
    pub refresh: String,
    pub rexp: DateTime<Utc>,
    pub subject: Address,
    pub session_type: String,
    pub cafe: Cafe,
}

impl CafeSession {
    pub fn access_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.exp
    }

    pub fn refresh_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.rexp
    }
}

/// A queued delivery as seen by its recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeMessage {
    pub id: String,
    /// Sender
    pub peer: Address,
    pub date: DateTime<Utc>,
    pub attempts: u32,
}

/// A queued delivery as held by the cafe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeClientMessage {
    pub id: String,
    pub peer: Address,
    pub client: Address,
    pub date: DateTime<Utc>,
}

/// An encrypted thread backup held by a cafe on behalf of a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeClientThread {
    pub id: String,
    pub client: Address,
    pub ciphertext: Vec<u8>,
}

/// A peer registered with this cafe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeClient {
    /// Peer the client connects as
    pub id: Address,
    /// Account the registration was signed for
    pub address: Address,
    /// Registration token the client presented, if any
    pub token: Option<String>,
    pub created: DateTime<Utc>,
    pub seen: DateTime<Utc>,
}
