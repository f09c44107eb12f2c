//! What a cafe can be searched for: the contacts its clients publish and
//! the thread backups it holds.

use tracing::debug;

use tessel_net::{QueryError, QuerySource};
use tessel_shared::models::{CafeClient, Contact};
use tessel_shared::query::{QueryPayload, QueryResult, QueryValue};
use tessel_shared::Address;
use tessel_store::SharedDatabase;

use crate::error::{lock_db, ServerError};

pub struct Directory {
    db: SharedDatabase,
}

impl Directory {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Record `client`'s own contact card. Older cards than the one held
    /// are ignored.
    pub fn publish_contact(&self, client: &CafeClient, contact: &Contact) -> Result<Address, ServerError> {
        if contact.id != client.address && contact.id != client.id {
            return Err(ServerError::Forbidden(
                "clients may only publish their own contact".into(),
            ));
        }
        let updated = lock_db(&self.db)?.add_or_update_contact(contact)?;
        debug!(contact = %contact.id.short(), updated, "contact published");
        Ok(contact.id)
    }
}

impl QuerySource for Directory {
    fn search(
        &self,
        payload: &QueryPayload,
        exclude: &[String],
        local: bool,
    ) -> Result<Vec<QueryResult>, QueryError> {
        let db = self
            .db
            .lock()
            .map_err(|_| QueryError::Source("database lock poisoned".into()))?;
        let source = |e: tessel_store::StoreError| QueryError::Source(e.to_string());

        let results = match payload {
            QueryPayload::ThreadBackup(q) => db
                .client_threads_by_address(&q.address)
                .map_err(source)?
                .into_iter()
                .filter(|(thread, _)| !exclude.contains(&thread.id))
                .map(|(thread, updated)| QueryResult {
                    id: thread.id.clone(),
                    date: updated,
                    local,
                    value: QueryValue::ThreadBackup(thread),
                })
                .collect(),
            QueryPayload::Contact(q) => db
                .find_contacts(q.id.as_ref(), q.username.as_deref(), exclude)
                .map_err(source)?
                .into_iter()
                .map(|contact| QueryResult {
                    id: contact.id.to_hex(),
                    date: contact.updated,
                    local,
                    value: QueryValue::Contact(contact),
                })
                .collect(),
        };
        Ok(results)
    }
}
