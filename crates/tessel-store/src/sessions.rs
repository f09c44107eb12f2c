use rusqlite::{params, OptionalExtension};

use tessel_shared::models::CafeSession;
use tessel_shared::Address;

use crate::contacts::{format_time, parse_address, parse_json, parse_time};
use crate::database::Database;
use crate::error::Result;

const SESSION_COLUMNS: &str = "id, access, exp, refresh, rexp, subject, type, cafe";

impl Database {
    /// Store the session held with a cafe, replacing any earlier one for
    /// the same cafe peer.
    pub fn upsert_cafe_session(&self, session: &CafeSession) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cafe_sessions (cafe_id, id, access, exp, refresh, rexp, subject, type, cafe)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(cafe_id) DO UPDATE SET
                id = excluded.id,
                access = excluded.access,
                exp = excluded.exp,
                refresh = excluded.refresh,
                rexp = excluded.rexp,
                subject = excluded.subject,
                type = excluded.type,
                cafe = excluded.cafe",
            params![
                session.cafe.peer.to_hex(),
                session.id,
                session.access,
                format_time(&session.exp),
                session.refresh,
                format_time(&session.rexp),
                session.subject.to_hex(),
                session.session_type,
                serde_json::to_string(&session.cafe)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_cafe_session(&self, cafe_peer: &Address) -> Result<Option<CafeSession>> {
        let session = self
            .conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM cafe_sessions WHERE cafe_id = ?1"),
                params![cafe_peer.to_hex()],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn list_cafe_sessions(&self) -> Result<Vec<CafeSession>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM cafe_sessions ORDER BY cafe_id"
        ))?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    pub fn delete_cafe_session(&self, cafe_peer: &Address) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM cafe_sessions WHERE cafe_id = ?1",
            params![cafe_peer.to_hex()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<CafeSession> {
    let exp: String = row.get(2)?;
    let rexp: String = row.get(4)?;
    let subject: String = row.get(5)?;
    let cafe: String = row.get(7)?;

    Ok(CafeSession {
        id: row.get(0)?,
        access: row.get(1)?,
        exp: parse_time(2, &exp)?,
        refresh: row.get(3)?,
        rexp: parse_time(4, &rexp)?,
        subject: parse_address(5, &subject)?,
        session_type: row.get(6)?,
        cafe: parse_json(7, &cafe)?,
    })
}
