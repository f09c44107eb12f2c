//! Messages fetched from cafe inboxes that still await local handling.

use rusqlite::{params, OptionalExtension};

use tessel_shared::models::CafeMessage;
use tessel_shared::Address;

use crate::contacts::{format_time, parse_address, parse_time};
use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Queue a fetched message. Returns `false` if it was already queued.
    pub fn add_inbox_message(&self, cafe: &Address, message: &CafeMessage) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO cafe_inbox (id, peer, cafe_id, date, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.peer.to_hex(),
                cafe.to_hex(),
                format_time(&message.date),
                message.attempts,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Queued messages, oldest first.
    pub fn list_inbox_messages(&self, limit: usize) -> Result<Vec<CafeMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, peer, date, attempts FROM cafe_inbox
             ORDER BY date ASC, id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let peer: String = row.get(1)?;
            let date: String = row.get(2)?;
            Ok(CafeMessage {
                id: row.get(0)?,
                peer: parse_address(1, &peer)?,
                date: parse_time(2, &date)?,
                attempts: row.get(3)?,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The cafe a queued message was fetched from.
    pub fn inbox_message_cafe(&self, id: &str) -> Result<Option<Address>> {
        let cafe: Option<String> = self
            .conn()
            .query_row(
                "SELECT cafe_id FROM cafe_inbox WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        cafe.map(|hex| parse_address(0, &hex).map_err(Into::into))
            .transpose()
    }

    /// Bump the attempt counter; returns the new count.
    pub fn add_inbox_attempt(&self, id: &str) -> Result<u32> {
        self.conn().execute(
            "UPDATE cafe_inbox SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts = self.conn().query_row(
            "SELECT attempts FROM cafe_inbox WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn delete_inbox_message(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cafe_inbox WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn message(id: &str, age_secs: i64) -> CafeMessage {
        CafeMessage {
            id: id.into(),
            peer: Address([4u8; 32]),
            date: Utc::now() - Duration::seconds(age_secs),
            attempts: 0,
        }
    }

    #[test]
    fn test_inbox_queue_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let cafe = Address([1u8; 32]);

        assert!(db.add_inbox_message(&cafe, &message("new", 1)).unwrap());
        assert!(db.add_inbox_message(&cafe, &message("old", 100)).unwrap());
        assert!(!db.add_inbox_message(&cafe, &message("old", 100)).unwrap());

        let queued = db.list_inbox_messages(10).unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, "old");
        assert_eq!(db.inbox_message_cafe("old").unwrap(), Some(cafe));
        assert_eq!(db.inbox_message_cafe("missing").unwrap(), None);

        assert_eq!(db.add_inbox_attempt("old").unwrap(), 1);
        assert_eq!(db.add_inbox_attempt("old").unwrap(), 2);

        assert!(db.delete_inbox_message("old").unwrap());
        let queued = db.list_inbox_messages(10).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "new");
    }
}
