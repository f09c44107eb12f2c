//! v001 -- Initial schema.
//!
//! Thread logs (`threads`, `blocks`, `thread_heads`), the
//! contact directory, client-side cafe state (`cafe_sessions`,
//! `cafe_inbox`) and locally pinned content `objects`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Threads
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS threads (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    data        BLOB NOT NULL                 -- bincode Thread record
);

-- ----------------------------------------------------------------
-- Blocks
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    id          TEXT NOT NULL,                -- hex BLAKE3 content id
    thread_id   TEXT NOT NULL,
    block_type  TEXT NOT NULL,
    author      TEXT,                         -- hex pubkey, NULL for MERGE
    target      TEXT,
    date        TEXT NOT NULL,                -- RFC-3339
    data        BLOB NOT NULL,                -- bincode Block

    PRIMARY KEY (thread_id, id),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_blocks_thread_date ON blocks(thread_id, date DESC);
CREATE INDEX IF NOT EXISTS idx_blocks_target ON blocks(target);

CREATE TABLE IF NOT EXISTS thread_heads (
    thread_id   TEXT NOT NULL,
    block_id    TEXT NOT NULL,

    PRIMARY KEY (thread_id, block_id),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Contacts (never deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    id          TEXT PRIMARY KEY NOT NULL,    -- hex pubkey
    username    TEXT NOT NULL,
    avatar      TEXT,
    inboxes     TEXT NOT NULL,                -- JSON [Cafe]
    threads     TEXT NOT NULL,                -- JSON [ThreadId]
    created     TEXT NOT NULL,
    updated     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contacts_username ON contacts(username);

-- ----------------------------------------------------------------
-- Cafe sessions held by this peer
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_sessions (
    cafe_id     TEXT PRIMARY KEY NOT NULL,    -- cafe peer, hex
    id          TEXT NOT NULL,
    access      TEXT NOT NULL,
    exp         TEXT NOT NULL,
    refresh     TEXT NOT NULL,
    rexp        TEXT NOT NULL,
    subject     TEXT NOT NULL,
    type        TEXT NOT NULL,
    cafe        TEXT NOT NULL                 -- JSON Cafe
);

-- ----------------------------------------------------------------
-- Messages downloaded from cafe inboxes, pending local handling
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cafe_inbox (
    id          TEXT PRIMARY KEY NOT NULL,
    peer        TEXT NOT NULL,                -- sender, hex
    cafe_id     TEXT NOT NULL,
    date        TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_cafe_inbox_date ON cafe_inbox(date);

-- ----------------------------------------------------------------
-- Content objects pinned locally
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS objects (
    cid         TEXT PRIMARY KEY NOT NULL,
    data        BLOB NOT NULL,
    size        INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
