//! Cafe-side client registry: registered peers, the version counter of each
//! issued session, and minted registration tokens.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use tessel_shared::models::CafeClient;
use tessel_shared::Address;

use crate::contacts::{format_time, parse_address, parse_time};
use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert a client or refresh its registration details.
    pub fn upsert_cafe_client(&self, client: &CafeClient) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_clients (id, address, token, created, seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                token = excluded.token,
                seen = excluded.seen",
            params![
                client.id.to_hex(),
                client.address.to_hex(),
                client.token,
                format_time(&client.created),
                format_time(&client.seen),
            ],
        )?;
        Ok(())
    }

    pub fn get_cafe_client(&self, id: &Address) -> Result<Option<CafeClient>> {
        let client = self
            .conn()
            .query_row(
                "SELECT id, address, token, created, seen FROM cafe_clients WHERE id = ?1",
                params![id.to_hex()],
                row_to_client,
            )
            .optional()?;
        Ok(client)
    }

    pub fn touch_cafe_client(&self, id: &Address, seen: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE cafe_clients SET seen = ?2 WHERE id = ?1",
            params![id.to_hex(), format_time(&seen)],
        )?;
        Ok(())
    }

    pub fn count_cafe_clients(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM cafe_clients", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // -- sessions --

    pub fn create_client_session(&self, id: &str, client: &Address, version: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_client_sessions (id, client, version, created)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, client.to_hex(), version as i64, format_time(&Utc::now())],
        )?;
        Ok(())
    }

    /// Owner and current version of a session.
    pub fn client_session_version(&self, id: &str) -> Result<Option<(Address, u64)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT client, version FROM cafe_client_sessions WHERE id = ?1",
                params![id],
                |row| {
                    let client: String = row.get(0)?;
                    let version: i64 = row.get(1)?;
                    Ok((parse_address(0, &client)?, version as u64))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Compare-and-swap the session version from `expected` to
    /// `expected + 1`. Returns `false` if another rotation won.
    pub fn bump_client_session(&self, id: &str, expected: u64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE cafe_client_sessions SET version = version + 1
             WHERE id = ?1 AND version = ?2",
            params![id, expected as i64],
        )?;
        Ok(affected == 1)
    }

    // -- registration tokens --

    pub fn add_registration_token(&self, id: &str, digest: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_tokens (id, digest, created) VALUES (?1, ?2, ?3)",
            params![id, digest, format_time(&Utc::now())],
        )?;
        Ok(())
    }

    /// Every stored `(id, digest)` pair.
    pub fn registration_tokens(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, digest FROM cafe_tokens ORDER BY created")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }

    pub fn delete_registration_token(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cafe_tokens WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<CafeClient> {
    let id: String = row.get(0)?;
    let address: String = row.get(1)?;
    let created: String = row.get(3)?;
    let seen: String = row.get(4)?;
    Ok(CafeClient {
        id: parse_address(0, &id)?,
        address: parse_address(1, &address)?,
        token: row.get(2)?,
        created: parse_time(3, &created)?,
        seen: parse_time(4, &seen)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn client(db: &Database, byte: u8) -> CafeClient {
        let now = Utc::now();
        let client = CafeClient {
            id: Address([byte; 32]),
            address: Address([byte.wrapping_add(100); 32]),
            token: None,
            created: now,
            seen: now,
        };
        db.upsert_cafe_client(&client).unwrap();
        client
    }

    #[test]
    fn test_client_upsert_keeps_created() {
        let db = Database::open_in_memory().unwrap();
        let mut c = client(&db, 1);

        let created = c.created;
        c.created = created + chrono::Duration::days(1);
        c.token = Some("tok".into());
        db.upsert_cafe_client(&c).unwrap();

        let stored = db.get_cafe_client(&c.id).unwrap().unwrap();
        assert_eq!(stored.created, created);
        assert_eq!(stored.token.as_deref(), Some("tok"));
        assert_eq!(db.count_cafe_clients().unwrap(), 1);
    }

    #[test]
    fn test_session_version_compare_and_swap() {
        let db = Database::open_in_memory().unwrap();
        let c = client(&db, 2);
        db.create_client_session("s1", &c.id, 1).unwrap();

        assert!(db.bump_client_session("s1", 1).unwrap());
        // a second rotation from the same version loses
        assert!(!db.bump_client_session("s1", 1).unwrap());
        assert_eq!(db.client_session_version("s1").unwrap(), Some((c.id, 2)));
        assert_eq!(db.client_session_version("nope").unwrap(), None);
    }

    #[test]
    fn test_registration_tokens() {
        let db = Database::open_in_memory().unwrap();
        db.add_registration_token("t1", &[1, 2, 3]).unwrap();
        db.add_registration_token("t2", &[4, 5, 6]).unwrap();
        assert_eq!(db.registration_tokens().unwrap().len(), 2);

        assert!(db.delete_registration_token("t1").unwrap());
        assert!(!db.delete_registration_token("t1").unwrap());
        assert_eq!(db.registration_tokens().unwrap()[0].0, "t2");
    }
}
