use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};

use tessel_shared::models::Contact;
use tessel_shared::Address;

use crate::database::Database;
use crate::error::Result;

const CONTACT_COLUMNS: &str = "id, username, avatar, inboxes, threads, created, updated";

impl Database {
    /// Insert a contact, or replace the stored one if `contact` is newer.
    /// Returns whether anything changed. Contacts are never deleted.
    pub fn add_or_update_contact(&self, contact: &Contact) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO contacts (id, username, avatar, inboxes, threads, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                avatar = excluded.avatar,
                inboxes = excluded.inboxes,
                threads = excluded.threads,
                updated = excluded.updated
             WHERE excluded.updated > contacts.updated",
            params![
                contact.id.to_hex(),
                contact.username,
                contact.avatar,
                serde_json::to_string(&contact.inboxes)?,
                serde_json::to_string(&contact.threads)?,
                format_time(&contact.created),
                format_time(&contact.updated),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_contact(&self, id: &Address) -> Result<Option<Contact>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.to_hex()],
                row_to_contact,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.find_contacts(None, None, &[])
    }

    /// Contacts matching every given criterion, minus `exclude` (hex ids).
    pub fn find_contacts(
        &self,
        id: Option<&Address>,
        username: Option<&str>,
        exclude: &[String],
    ) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE (?1 IS NULL OR id = ?1)
               AND (?2 IS NULL OR username LIKE '%' || ?2 || '%')
             ORDER BY updated DESC"
        ))?;
        let rows = stmt.query_map(
            params![id.map(|a| a.to_hex()), username],
            row_to_contact,
        )?;

        let mut contacts = Vec::new();
        for row in rows {
            let contact = row?;
            if !exclude.contains(&contact.id.to_hex()) {
                contacts.push(contact);
            }
        }
        Ok(contacts)
    }
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Fixed-width UTC timestamps, so text columns sort chronologically.
pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_address(idx: usize, s: &str) -> rusqlite::Result<Address> {
    s.parse::<Address>().map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conversion_err(idx, e))
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let id: String = row.get(0)?;
    let inboxes: String = row.get(3)?;
    let threads: String = row.get(4)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;

    Ok(Contact {
        id: parse_address(0, &id)?,
        username: row.get(1)?,
        avatar: row.get(2)?,
        inboxes: parse_json(3, &inboxes)?,
        threads: parse_json(4, &threads)?,
        created: parse_time(5, &created)?,
        updated: parse_time(6, &updated)?,
    })
}
