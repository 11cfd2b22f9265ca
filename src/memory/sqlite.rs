use super::traits::{
    validate_key, BackendCapabilities, MemoryBackend, MemoryCategory, MemoryEntry,
};
use crate::error::MemoryError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// SQLite-backed persistent memory.
///
/// - authoritative `memories` table, upsert by key with stable ids
/// - FTS5 virtual table (BM25 ranking) kept in sync by triggers
/// - the connection is shared with the vector store and outbox, which
///   borrow it through the `Arc` and never close it
pub struct SqliteMemory {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteMemory {
    pub fn new(workspace_dir: &Path) -> anyhow::Result<Self> {
        let db_path = workspace_dir.join("memory.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path).map_err(Self::io_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )
        .map_err(Self::io_err)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    /// Handle lent to the vector store and outbox. Borrowers must treat the
    /// connection as read/write but never close it.
    pub fn shared_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "-- Authoritative entries
            CREATE TABLE IF NOT EXISTS memories (
                id         TEXT PRIMARY KEY,
                key        TEXT NOT NULL UNIQUE,
                content    TEXT NOT NULL,
                category   TEXT NOT NULL DEFAULT 'core',
                session_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
            CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id);

            -- FTS5 full-text search (BM25 scoring)
            CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                key, content, content=memories, content_rowid=rowid
            );

            -- FTS5 triggers: keep in sync with memories table
            CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                INSERT INTO memories_fts(rowid, key, content)
                VALUES (new.rowid, new.key, new.content);
            END;
            CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, key, content)
                VALUES ('delete', old.rowid, old.key, old.content);
            END;
            CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, key, content)
                VALUES ('delete', old.rowid, old.key, old.content);
                INSERT INTO memories_fts(rowid, key, content)
                VALUES (new.rowid, new.key, new.content);
            END;",
        )
        .map_err(Self::io_err)?;
        Ok(())
    }

    fn io_err(e: rusqlite::Error) -> anyhow::Error {
        MemoryError::BackendIo(e.to_string()).into()
    }

    fn lock_connection(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MemoryError::BackendIo(format!("lock poisoned: {e}")).into())
    }

    /// Quote query tokens so FTS5 never sees its operator syntax.
    fn fts_query(query: &str) -> Option<String> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.replace('"', ""))
            .filter(|t| !t.is_empty())
            .map(|t| format!("\"{t}\""))
            .collect();
        if tokens.is_empty() {
            None
        } else {
            Some(tokens.join(" OR "))
        }
    }

    fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
        let category_raw: String = row.get(3)?;
        Ok(MemoryEntry {
            id: row.get(0)?,
            key: row.get(1)?,
            content: row.get(2)?,
            category: MemoryCategory::parse(&category_raw),
            session_id: row.get(4)?,
            timestamp: row.get(5)?,
            score: None,
        })
    }
}

#[async_trait]
impl MemoryBackend for SqliteMemory {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            backend: "sqlite",
            supports_session_store: true,
            supports_keyword_rank: true,
            supports_transactions: true,
            supports_outbox: true,
        }
    }

    async fn store(
        &self,
        key: &str,
        content: &str,
        category: MemoryCategory,
        session_id: Option<&str>,
    ) -> anyhow::Result<()> {
        validate_key(key)?;

        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock_connection()?;
        // Upsert keeps the original id and created_at; readers see either
        // the old row or the new one, never a half-written entry.
        conn.execute(
            "INSERT INTO memories (id, key, content, category, session_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(key) DO UPDATE SET
                 content = excluded.content,
                 category = excluded.category,
                 session_id = excluded.session_id,
                 updated_at = excluded.updated_at",
            params![id, key, content, category.to_string(), session_id, now],
        )
        .map_err(Self::io_err)?;
        Ok(())
    }

    async fn recall(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let Some(fts_query) = Self::fts_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock_connection()?;
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut entries = Vec::new();

        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.key, m.content, m.category, m.session_id, m.updated_at,
                        bm25(memories_fts) AS rank
                 FROM memories_fts
                 JOIN memories m ON m.rowid = memories_fts.rowid
                 WHERE memories_fts MATCH ?1
                   AND (?2 IS NULL OR m.session_id = ?2)
                 ORDER BY rank ASC
                 LIMIT ?3",
            )
            .map_err(Self::io_err)?;
        let rows = stmt
            .query_map(params![fts_query, session_id, limit_i64], |row| {
                let mut entry = Self::map_entry_row(row)?;
                let rank: f64 = row.get(6)?;
                // bm25() is lower-is-better; flip so callers see higher-is-better
                entry.score = Some(-rank);
                Ok(entry)
            })
            .map_err(Self::io_err)?;
        for row in rows {
            entries.push(row.map_err(Self::io_err)?);
        }

        Ok(entries)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<MemoryEntry>> {
        let conn = self.lock_connection()?;
        conn.query_row(
            "SELECT id, key, content, category, session_id, updated_at
             FROM memories WHERE key = ?1",
            params![key],
            Self::map_entry_row,
        )
        .optional()
        .map_err(Self::io_err)
    }

    async fn list(
        &self,
        category: Option<&MemoryCategory>,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let conn = self.lock_connection()?;
        let category_label = category.map(ToString::to_string);
        let mut stmt = conn
            .prepare(
                "SELECT id, key, content, category, session_id, updated_at
                 FROM memories
                 WHERE (?1 IS NULL OR category = ?1)
                   AND (?2 IS NULL OR session_id = ?2)
                 ORDER BY updated_at DESC",
            )
            .map_err(Self::io_err)?;
        let rows = stmt
            .query_map(params![category_label, session_id], Self::map_entry_row)
            .map_err(Self::io_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(Self::io_err)?);
        }
        Ok(entries)
    }

    async fn forget(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.lock_connection()?;
        let removed = conn
            .execute("DELETE FROM memories WHERE key = ?1", params![key])
            .map_err(Self::io_err)?;
        Ok(removed > 0)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let conn = self.lock_connection()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
            .map_err(Self::io_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn health_check(&self) -> bool {
        self.lock_connection()
            .ok()
            .and_then(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .ok()
            })
            .is_some()
    }
}
