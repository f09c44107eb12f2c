use rusqlite::{params, OptionalExtension};

use tessel_shared::content::ContentStore;
use tessel_shared::Cid;

use crate::contacts::format_time;
use crate::database::{Database, SharedDatabase};
use crate::error::{Result, StoreError};

impl Database {
    /// Pin `data` under its content id. Idempotent.
    pub fn put_object(&self, data: &[u8]) -> Result<Cid> {
        let cid = Cid::of(data);
        self.conn().execute(
            "INSERT OR IGNORE INTO objects (cid, data, size, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![cid.0, data, data.len() as i64, format_time(&chrono::Utc::now())],
        )?;
        Ok(cid)
    }

    pub fn get_object(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        let data = self
            .conn()
            .query_row(
                "SELECT data FROM objects WHERE cid = ?1",
                params![cid.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    pub fn has_object(&self, cid: &Cid) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM objects WHERE cid = ?1",
            params![cid.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// [`ContentStore`] backed by the `objects` table.
#[derive(Clone)]
pub struct SqliteContentStore {
    db: SharedDatabase,
}

impl SqliteContentStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

impl ContentStore for SqliteContentStore {
    type Error = StoreError;

    fn put(&self, data: &[u8]) -> Result<Cid> {
        self.db.lock().map_err(|_| StoreError::Poisoned)?.put_object(data)
    }

    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)?.get_object(cid)
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        self.db.lock().map_err(|_| StoreError::Poisoned)?.has_object(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_idempotent() {
        let store = SqliteContentStore::new(Database::open_in_memory().unwrap().shared());
        let a = store.put(b"hello").unwrap();
        let b = store.put(b"hello").unwrap();
        assert_eq!(a, b);
        assert!(a.is_valid());
        assert_eq!(store.get(&a).unwrap().unwrap(), b"hello");

        let missing = Cid::of(b"nope");
        assert!(!store.has(&missing).unwrap());
        assert!(store.get(&missing).unwrap().is_none());
    }
}
