use tessel_net::{QueryError, QuerySource};
use tessel_shared::query::{QueryPayload, QueryResult, QueryValue};
use tessel_store::SharedDatabase;

/// The contacts this node knows, searchable by id or username prefix.
///
/// Clients hold no thread backups, so backup queries find nothing here.
pub struct LocalDirectory {
    db: SharedDatabase,
}

impl LocalDirectory {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

impl QuerySource for LocalDirectory {
    fn search(
        &self,
        payload: &QueryPayload,
        exclude: &[String],
        local: bool,
    ) -> Result<Vec<QueryResult>, QueryError> {
        let QueryPayload::Contact(q) = payload else {
            return Ok(Vec::new());
        };
        let contacts = self
            .db
            .lock()
            .map_err(|_| QueryError::Source("database lock poisoned".into()))?
            .find_contacts(q.id.as_ref(), q.username.as_deref(), exclude)
            .map_err(|e| QueryError::Source(e.to_string()))?;

        Ok(contacts
            .into_iter()
            .map(|contact| QueryResult {
                id: contact.id.to_hex(),
                date: contact.updated,
                local,
                value: QueryValue::Contact(contact),
            })
            .collect())
    }
}
