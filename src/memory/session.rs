use super::traits::{MessageEntry, MessageRole, SessionMessageRecord, SessionMessageStore};
use crate::error::MemoryError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// Append-only chat history on the primary store's SQLite handle.
///
/// Messages are never edited; `clear_*` drops whole slices of a session.
/// Auto-saved rows (conversation autosave) are flagged so they can be
/// cleared without touching messages the user explicitly kept.
pub struct SqliteSessionMessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionMessageStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> anyhow::Result<Self> {
        {
            let guard = lock(&conn)?;
            guard
                .execute_batch(
                    "CREATE TABLE IF NOT EXISTS session_messages (
                        id         TEXT PRIMARY KEY,
                        session_id TEXT NOT NULL,
                        role       TEXT NOT NULL,
                        content    TEXT NOT NULL,
                        auto_saved INTEGER NOT NULL DEFAULT 0,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_session_messages_session
                        ON session_messages(session_id, created_at);",
                )
                .map_err(io_err)?;
        }
        Ok(Self { conn })
    }
}

fn lock(
    conn: &Arc<Mutex<Connection>>,
) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| MemoryError::BackendIo(format!("lock poisoned: {e}")).into())
}

fn io_err(e: rusqlite::Error) -> anyhow::Error {
    MemoryError::BackendIo(e.to_string()).into()
}

#[async_trait]
impl SessionMessageStore for SqliteSessionMessageStore {
    async fn save_message(
        &self,
        session_id: &str,
        message: MessageEntry,
        auto_saved: bool,
    ) -> anyhow::Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO session_messages (id, session_id, role, content, auto_saved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                session_id,
                message.role.as_str(),
                message.content,
                i32::from(auto_saved),
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(io_err)?;
        Ok(())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<MessageEntry>> {
        let conn = lock(&self.conn)?;
        let mut messages = Vec::new();

        if let Some(limit) = limit {
            let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut stmt = conn
                .prepare(
                    "SELECT role, content FROM session_messages
                     WHERE session_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )
                .map_err(io_err)?;
            let rows = stmt
                .query_map(params![session_id, limit_i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(io_err)?;
            for row in rows {
                let (role, content) = row.map_err(io_err)?;
                messages.push(MessageEntry::new(MessageRole::parse(&role)?, content));
            }
            messages.reverse();
        } else {
            let mut stmt = conn
                .prepare(
                    "SELECT role, content FROM session_messages
                     WHERE session_id = ?1
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(io_err)?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(io_err)?;
            for row in rows {
                let (role, content) = row.map_err(io_err)?;
                messages.push(MessageEntry::new(MessageRole::parse(&role)?, content));
            }
        }

        Ok(messages)
    }

    async fn clear_messages(&self, session_id: &str) -> anyhow::Result<usize> {
        let conn = lock(&self.conn)?;
        let removed = conn
            .execute(
                "DELETE FROM session_messages WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(io_err)?;
        Ok(removed)
    }

    async fn clear_auto_saved(&self, session_id: &str) -> anyhow::Result<usize> {
        let conn = lock(&self.conn)?;
        let removed = conn
            .execute(
                "DELETE FROM session_messages WHERE session_id = ?1 AND auto_saved = 1",
                params![session_id],
            )
            .map_err(io_err)?;
        Ok(removed)
    }

    async fn all_messages(&self) -> anyhow::Result<Vec<SessionMessageRecord>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, role, content, auto_saved
                 FROM session_messages
                 ORDER BY created_at ASC, id ASC",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(io_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (session_id, role, content, auto_saved) = row.map_err(io_err)?;
            records.push(SessionMessageRecord {
                session_id,
                role: MessageRole::parse(&role)?,
                content,
                auto_saved: auto_saved != 0,
            });
        }
        Ok(records)
    }

    async fn health_check(&self) -> bool {
        lock(&self.conn)
            .ok()
            .and_then(|conn| {
                conn.query_row("SELECT COUNT(*) FROM session_messages", [], |row| {
                    row.get::<_, i64>(0)
                })
                .ok()
            })
            .is_some()
    }
}
