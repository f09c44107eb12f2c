//! Encrypted thread backups a cafe holds for its clients.

use chrono::{DateTime, Utc};
use rusqlite::params;

use tessel_shared::models::CafeClientThread;
use tessel_shared::Address;

use crate::contacts::{format_time, parse_address, parse_time};
use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_client_thread(&self, thread: &CafeClientThread) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_client_threads (id, client, ciphertext, updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(client, id) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                updated = excluded.updated",
            params![
                thread.id,
                thread.client.to_hex(),
                thread.ciphertext,
                format_time(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Backups held for every client registered under account `address`,
    /// newest first, with the time each was last stored.
    pub fn client_threads_by_address(
        &self,
        address: &Address,
    ) -> Result<Vec<(CafeClientThread, DateTime<Utc>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT t.id, t.client, t.ciphertext, t.updated
             FROM cafe_client_threads t
             JOIN cafe_clients c ON c.id = t.client
             WHERE c.address = ?1
             ORDER BY t.updated DESC",
        )?;
        let rows = stmt.query_map(params![address.to_hex()], |row| {
            let client: String = row.get(1)?;
            let updated: String = row.get(3)?;
            Ok((
                CafeClientThread {
                    id: row.get(0)?,
                    client: parse_address(1, &client)?,
                    ciphertext: row.get(2)?,
                },
                parse_time(3, &updated)?,
            ))
        })?;
        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::tests::client;

    #[test]
    fn test_backups_found_by_account() {
        let db = Database::open_in_memory().unwrap();
        let c = client(&db, 1);
        let other = client(&db, 2);

        let backup = CafeClientThread {
            id: "thread-1".into(),
            client: c.id,
            ciphertext: vec![1, 2, 3],
        };
        db.upsert_client_thread(&backup).unwrap();
        db.upsert_client_thread(&CafeClientThread {
            ciphertext: vec![4, 5],
            ..backup.clone()
        })
        .unwrap();

        let found = db.client_threads_by_address(&c.address).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.ciphertext, vec![4, 5]);
        assert!(db.client_threads_by_address(&other.address).unwrap().is_empty());
    }
}
