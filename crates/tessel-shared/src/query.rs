use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_QUERY_LIMIT, DEFAULT_QUERY_WAIT_SECS};
use crate::models::{CafeClientThread, Contact};
use crate::types::Address;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QueryType {
    ThreadBackups,
    Contacts,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum QueryFilter {
    #[default]
    NoFilter,
    /// Drop a result whose date is not newer than one already seen for
    /// the same id.
    HideOlder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryOptions {
    pub local_only: bool,
    pub remote_only: bool,
    /// `<= 0` means unlimited
    pub limit: i32,
    /// Seconds to wait on the network
    pub wait: u32,
    pub filter: QueryFilter,
    /// Result ids the caller has already seen
    pub exclude: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            local_only: false,
            remote_only: false,
            limit: DEFAULT_QUERY_LIMIT,
            wait: DEFAULT_QUERY_WAIT_SECS,
            filter: QueryFilter::NoFilter,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadBackupQuery {
    pub address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContactQuery {
    pub id: Option<Address>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueryPayload {
    ThreadBackup(ThreadBackupQuery),
    Contact(ContactQuery),
}

impl QueryPayload {
    pub fn query_type(&self) -> QueryType {
        match self {
            Self::ThreadBackup(_) => QueryType::ThreadBackups,
            Self::Contact(_) => QueryType::Contacts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub id: String,
    /// Cafe access token, filled in per cafe session
    pub token: String,
    pub query_type: QueryType,
    pub options: QueryOptions,
    pub payload: QueryPayload,
}

impl Query {
    pub fn new(payload: QueryPayload, options: QueryOptions) -> Self {
        Self {
            id: crate::crypto::random_token(),
            token: String::new(),
            query_type: payload.query_type(),
            options,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueryValue {
    Contact(Contact),
    ThreadBackup(CafeClientThread),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResult {
    pub id: String,
    pub date: DateTime<Utc>,
    /// Whether the result came from the querying node itself
    pub local: bool,
    pub value: QueryValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResults {
    pub query_type: QueryType,
    pub items: Vec<QueryResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseType {
    /// Respond directly to the querying peer
    P2p,
    /// Publish responses on a topic named after the query id
    PubSub,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PubSubQuery {
    pub id: String,
    pub query_type: QueryType,
    pub payload: QueryPayload,
    pub response_type: ResponseType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PubSubQueryResults {
    pub id: String,
    pub results: QueryResults,
}

/// One step of a streamed query. `Done` is emitted exactly once, last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    Data(QueryResult),
    Done,
}
