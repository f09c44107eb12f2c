use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};

use tessel_shared::block::Block;
use tessel_shared::thread::Thread;
use tessel_shared::{BlockId, ThreadId};

use crate::contacts::format_time;
use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        upsert_thread(self.conn(), thread)
    }

    pub fn get_thread(&self, id: &ThreadId) -> Result<Option<Thread>> {
        let data: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT data FROM threads WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match data {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        })
    }

    pub fn list_threads(&self) -> Result<Vec<Thread>> {
        let mut stmt = self.conn().prepare("SELECT data FROM threads ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut threads = Vec::new();
        for row in rows {
            threads.push(bincode::deserialize(&row?)?);
        }
        Ok(threads)
    }

    pub fn delete_thread(&self, id: &ThreadId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM threads WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }

    pub fn get_block(&self, thread: &ThreadId, id: &BlockId) -> Result<Option<Block>> {
        let data: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT data FROM blocks WHERE thread_id = ?1 AND id = ?2",
                params![thread.0, id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match data {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        })
    }

    pub fn has_block(&self, thread: &ThreadId, id: &BlockId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blocks WHERE thread_id = ?1 AND id = ?2",
            params![thread.0, id.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All blocks of a thread, newest first.
    pub fn list_blocks(&self, thread: &ThreadId) -> Result<Vec<Block>> {
        let mut stmt = self.conn().prepare(
            "SELECT data FROM blocks WHERE thread_id = ?1 ORDER BY date DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![thread.0], |row| row.get::<_, Vec<u8>>(0))?;
        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(bincode::deserialize(&row?)?);
        }
        Ok(blocks)
    }

    pub fn get_heads(&self, thread: &ThreadId) -> Result<BTreeSet<BlockId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT block_id FROM thread_heads WHERE thread_id = ?1")?;
        let rows = stmt.query_map(params![thread.0], |row| row.get::<_, String>(0))?;
        let mut heads = BTreeSet::new();
        for row in rows {
            heads.insert(BlockId::from(row?.as_str()));
        }
        Ok(heads)
    }

    /// Store `block`, replace the head set and the thread record in one
    /// transaction.
    pub fn commit_block(
        &mut self,
        thread: &Thread,
        block: &Block,
        heads: &BTreeSet<BlockId>,
    ) -> Result<()> {
        let data = bincode::serialize(block)?;
        let tx = self.conn_mut().transaction()?;

        upsert_thread(&tx, thread)?;
        tx.execute(
            "INSERT OR IGNORE INTO blocks (id, thread_id, block_type, author, target, date, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                block.id.0,
                thread.id.0,
                block.block_type().as_str(),
                block.header.author.map(|a| a.to_hex()),
                block.header.target,
                format_time(&block.date()),
                data,
            ],
        )?;
        tx.execute(
            "DELETE FROM thread_heads WHERE thread_id = ?1",
            params![thread.id.0],
        )?;
        for head in heads {
            tx.execute(
                "INSERT INTO thread_heads (thread_id, block_id) VALUES (?1, ?2)",
                params![thread.id.0, head.0],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn upsert_thread(conn: &rusqlite::Connection, thread: &Thread) -> Result<()> {
    conn.execute(
        "INSERT INTO threads (id, name, data) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, data = excluded.data",
        params![thread.id.0, thread.name, bincode::serialize(thread)?],
    )?;
    Ok(())
}
