//! Cafe-side delivery queue.
//!
//! One row per `(client, id)`. A row stays until its client deletes it;
//! `next_attempt` tracks the pending YOU_HAVE_MAIL push and is cleared once
//! a push succeeds. Rows that exhaust their push attempts are flagged
//! `dead` but remain checkable.

use rusqlite::params;

use tessel_shared::models::{CafeClientMessage, CafeMessage};
use tessel_shared::Address;

use crate::contacts::{format_time, parse_address, parse_time};
use crate::database::Database;
use crate::error::Result;

/// A queued row together with its push bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message: CafeClientMessage,
    pub attempts: u32,
    pub dead: bool,
}

const QUEUED_COLUMNS: &str = "id, peer, client, date, attempts, dead";

impl Database {
    /// Queue a delivery, due for a push at `due_ms`. Re-delivering an id
    /// already queued for the client restarts its pushes but keeps its
    /// place in the queue, so a page already checked stays the page deleted.
    pub fn enqueue_client_message(&self, message: &CafeClientMessage, due_ms: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_client_messages (id, client, peer, date, attempts, next_attempt, dead)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, 0)
             ON CONFLICT(client, id) DO UPDATE SET
                peer = excluded.peer,
                attempts = 0,
                next_attempt = excluded.next_attempt,
                dead = 0",
            params![
                message.id,
                message.client.to_hex(),
                message.peer.to_hex(),
                format_time(&message.date),
                due_ms,
            ],
        )?;
        Ok(())
    }

    /// The oldest `limit` messages queued for `client`.
    pub fn list_client_messages(&self, client: &Address, limit: usize) -> Result<Vec<CafeMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, peer, date, attempts FROM cafe_client_messages
             WHERE client = ?1
             ORDER BY date ASC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![client.to_hex(), limit as i64], |row| {
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

    /// Delete the page [`list_client_messages`](Self::list_client_messages)
    /// would return. Returns how many messages remain for `client`.
    pub fn delete_client_messages(&self, client: &Address, limit: usize) -> Result<usize> {
        let hex = client.to_hex();
        self.conn().execute(
            "DELETE FROM cafe_client_messages WHERE rowid IN (
                SELECT rowid FROM cafe_client_messages
                WHERE client = ?1
                ORDER BY date ASC, id ASC LIMIT ?2
             )",
            params![hex, limit as i64],
        )?;
        let remaining: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM cafe_client_messages WHERE client = ?1",
            params![hex],
            |row| row.get(0),
        )?;
        Ok(remaining as usize)
    }

    /// Live messages whose push is due at `now_ms`, oldest first.
    pub fn due_client_messages(&self, now_ms: i64, limit: usize) -> Result<Vec<QueuedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {QUEUED_COLUMNS} FROM cafe_client_messages
             WHERE dead = 0 AND next_attempt IS NOT NULL AND next_attempt <= ?1
             ORDER BY next_attempt ASC, date ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now_ms, limit as i64], row_to_queued)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Clear the pending push of a message once its client was notified.
    pub fn mark_client_message_notified(&self, client: &Address, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE cafe_client_messages SET next_attempt = NULL
             WHERE client = ?1 AND id = ?2",
            params![client.to_hex(), id],
        )?;
        Ok(())
    }

    /// Count a failed push and reschedule it; returns the new attempt count.
    pub fn retry_client_message(&self, client: &Address, id: &str, next_ms: i64) -> Result<u32> {
        let hex = client.to_hex();
        self.conn().execute(
            "UPDATE cafe_client_messages
             SET attempts = attempts + 1, next_attempt = ?3
             WHERE client = ?1 AND id = ?2",
            params![hex, id, next_ms],
        )?;
        let attempts = self.conn().query_row(
            "SELECT attempts FROM cafe_client_messages WHERE client = ?1 AND id = ?2",
            params![hex, id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Stop pushing a message. It stays in its client's queue.
    pub fn dead_letter_client_message(&self, client: &Address, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE cafe_client_messages SET dead = 1, next_attempt = NULL
             WHERE client = ?1 AND id = ?2",
            params![client.to_hex(), id],
        )?;
        Ok(())
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {QUEUED_COLUMNS} FROM cafe_client_messages
             WHERE dead = 1 ORDER BY date ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_queued)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// `(queued, dead)` message counts across all clients.
    pub fn queue_counts(&self) -> Result<(usize, usize)> {
        let (queued, dead): (i64, i64) = self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(dead), 0) FROM cafe_client_messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((queued as usize, dead as usize))
    }
}

fn row_to_queued(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let peer: String = row.get(1)?;
    let client: String = row.get(2)?;
    let date: String = row.get(3)?;
    let dead: i64 = row.get(5)?;
    Ok(QueuedMessage {
        message: CafeClientMessage {
            id: row.get(0)?,
            peer: parse_address(1, &peer)?,
            client: parse_address(2, &client)?,
            date: parse_time(3, &date)?,
        },
        attempts: row.get(4)?,
        dead: dead != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::tests::client;
    use chrono::{Duration, Utc};

    fn deliver(db: &Database, to: &Address, id: &str, age_secs: i64) {
        let message = CafeClientMessage {
            id: id.into(),
            peer: Address([9u8; 32]),
            client: *to,
            date: Utc::now() - Duration::seconds(age_secs),
        };
        db.enqueue_client_message(&message, 0).unwrap();
    }

    #[test]
    fn test_pages_drain_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let c = client(&db, 1);
        for i in 0..5 {
            deliver(&db, &c.id, &format!("m{i}"), 100 - i);
        }

        let page = db.list_client_messages(&c.id, 2).unwrap();
        assert_eq!(page.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["m0", "m1"]);

        assert_eq!(db.delete_client_messages(&c.id, 2).unwrap(), 3);
        assert_eq!(db.list_client_messages(&c.id, 2).unwrap()[0].id, "m2");
        assert_eq!(db.delete_client_messages(&c.id, 2).unwrap(), 1);
        assert_eq!(db.delete_client_messages(&c.id, 2).unwrap(), 0);
    }

    #[test]
    fn test_redelivery_keeps_checked_page() {
        let db = Database::open_in_memory().unwrap();
        let c = client(&db, 5);
        for i in 0..3 {
            deliver(&db, &c.id, &format!("m{i}"), 100 - i);
        }
        let page = db.list_client_messages(&c.id, 2).unwrap();
        assert_eq!(page.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["m0", "m1"]);

        // the sender retries m0 between our check and delete
        db.retry_client_message(&c.id, "m0", 1_000).unwrap();
        deliver(&db, &c.id, "m0", 0);

        assert_eq!(db.delete_client_messages(&c.id, 2).unwrap(), 1);
        let rest = db.list_client_messages(&c.id, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "m2");
        assert_eq!(rest[0].attempts, 0);
    }

    #[test]
    fn test_queues_are_per_client() {
        let db = Database::open_in_memory().unwrap();
        let a = client(&db, 1);
        let b = client(&db, 2);
        deliver(&db, &a.id, "x", 1);
        deliver(&db, &b.id, "x", 1);

        assert_eq!(db.delete_client_messages(&a.id, 10).unwrap(), 0);
        assert_eq!(db.list_client_messages(&b.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_retry_then_dead_letter() {
        let db = Database::open_in_memory().unwrap();
        let c = client(&db, 3);
        deliver(&db, &c.id, "m", 1);

        assert_eq!(db.due_client_messages(0, 10).unwrap().len(), 1);
        assert_eq!(db.retry_client_message(&c.id, "m", 1_000).unwrap(), 1);
        assert!(db.due_client_messages(999, 10).unwrap().is_empty());
        assert_eq!(db.due_client_messages(1_000, 10).unwrap()[0].attempts, 1);

        db.dead_letter_client_message(&c.id, "m").unwrap();
        assert!(db.due_client_messages(i64::MAX, 10).unwrap().is_empty());
        assert_eq!(db.list_dead_letters(10).unwrap().len(), 1);
        assert_eq!(db.queue_counts().unwrap(), (1, 1));

        // still checkable by its client
        let inbox = db.list_client_messages(&c.id, 10).unwrap();
        assert_eq!(inbox[0].attempts, 1);
    }

    #[test]
    fn test_notified_messages_are_not_due() {
        let db = Database::open_in_memory().unwrap();
        let c = client(&db, 4);
        deliver(&db, &c.id, "m", 1);
        db.mark_client_message_notified(&c.id, "m").unwrap();
        assert!(db.due_client_messages(i64::MAX, 10).unwrap().is_empty());
        assert_eq!(db.list_client_messages(&c.id, 10).unwrap()[0].attempts, 0);
    }
}
