//! v002 -- Cafe host schema.
//!
//! Tables used only when this database backs a cafe: registered clients,
//! their session versions, registration tokens, queued deliveries and
//! encrypted thread backups.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Registered clients
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_clients (
    id          TEXT PRIMARY KEY NOT NULL,    -- client peer, hex
    address     TEXT NOT NULL,                -- account address, hex
    token       TEXT,                         -- registration token id
    created     TEXT NOT NULL,
    seen        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cafe_clients_address ON cafe_clients(address);

-- ----------------------------------------------------------------
-- Session versions (bumped on every refresh)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_client_sessions (
    id          TEXT PRIMARY KEY NOT NULL,
    client      TEXT NOT NULL,
    version     INTEGER NOT NULL,
    created     TEXT NOT NULL,

    FOREIGN KEY (client) REFERENCES cafe_clients(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Registration tokens (BLAKE3 digests only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_tokens (
    id          TEXT PRIMARY KEY NOT NULL,
    digest      BLOB NOT NULL,
    created     TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Deliveries queued per client
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_client_messages (
    id           TEXT NOT NULL,               -- envelope cid
    client       TEXT NOT NULL,
    peer         TEXT NOT NULL,               -- sender, hex
    date         TEXT NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    next_attempt INTEGER,                     -- unix ms, NULL once notified
    dead         INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (client, id),
    FOREIGN KEY (client) REFERENCES cafe_clients(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cafe_client_messages_date
    ON cafe_client_messages(client, date);
CREATE INDEX IF NOT EXISTS idx_cafe_client_messages_due
    ON cafe_client_messages(next_attempt);

-- ----------------------------------------------------------------
-- Encrypted thread backups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_client_threads (
    id          TEXT NOT NULL,
    client      TEXT NOT NULL,
    ciphertext  BLOB NOT NULL,
    updated     TEXT NOT NULL,

    PRIMARY KEY (client, id),
    FOREIGN KEY (client) REFERENCES cafe_clients(id) ON DELETE CASCADE
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
