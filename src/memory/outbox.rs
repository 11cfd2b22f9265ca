use super::breaker::CircuitBreaker;
use super::embeddings::EmbeddingProvider;
use super::vector_store::VectorStore;
use crate::error::MemoryError;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const DRAIN_BATCH_SIZE: usize = 32;

/// Pending vector-sync operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxOperation {
    Upsert,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            other => {
                Err(MemoryError::Serialization(format!("unknown outbox operation: {other}")).into())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub key: String,
    pub operation: OutboxOperation,
    pub attempts: u32,
    pub next_attempt_at: i64,
}

/// Durable queue of pending vector-sync work, co-located with the primary
/// SQLite database.
///
/// Writes to the queue ride the same connection as the primary store, so a
/// primary write + enqueue can share one transaction. Drain is asynchronous
/// and never blocks a user-visible write.
pub struct VectorOutbox {
    conn: Arc<Mutex<Connection>>,
    max_retries: u32,
    base_backoff_ms: u64,
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
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

impl VectorOutbox {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        max_retries: u32,
        base_backoff_ms: u64,
    ) -> anyhow::Result<Self> {
        {
            let guard = lock(&conn)?;
            guard
                .execute_batch(
                    "CREATE TABLE IF NOT EXISTS memory_outbox (
                        id              INTEGER PRIMARY KEY AUTOINCREMENT,
                        memory_key      TEXT NOT NULL,
                        operation       TEXT NOT NULL,
                        attempts        INTEGER NOT NULL DEFAULT 0,
                        next_attempt_at INTEGER NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_memory_outbox_due
                        ON memory_outbox(next_attempt_at, id);",
                )
                .map_err(io_err)?;
        }
        Ok(Self {
            conn,
            max_retries: max_retries.max(1),
            base_backoff_ms: base_backoff_ms.max(1),
        })
    }

    /// Append a pending operation. Called from the write path, so this must
    /// stay cheap: one insert, no vector work.
    pub fn enqueue(&self, key: &str, operation: OutboxOperation) -> anyhow::Result<i64> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO memory_outbox (memory_key, operation, attempts, next_attempt_at)
             VALUES (?1, ?2, 0, ?3)",
            params![key, operation.as_str(), now_unix_ms()],
        )
        .map_err(io_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn pending_count(&self) -> anyhow::Result<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_outbox", [], |row| row.get(0))
            .map_err(io_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn due_entries(&self, limit: usize) -> anyhow::Result<Vec<OutboxEntry>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, memory_key, operation, attempts, next_attempt_at
                 FROM memory_outbox
                 WHERE next_attempt_at <= ?1
                 ORDER BY id ASC
                 LIMIT ?2",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map(
                params![now_unix_ms(), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .map_err(io_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, key, op, attempts, next_attempt_at) = row.map_err(io_err)?;
            entries.push(OutboxEntry {
                id,
                key,
                operation: OutboxOperation::parse(&op)?,
                attempts: u32::try_from(attempts).unwrap_or(0),
                next_attempt_at,
            });
        }
        Ok(entries)
    }

    fn remove(&self, id: i64) -> anyhow::Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM memory_outbox WHERE id = ?1", params![id])
            .map_err(io_err)?;
        Ok(())
    }

    fn reschedule(&self, entry: &OutboxEntry) -> anyhow::Result<bool> {
        let attempts = entry.attempts + 1;
        if attempts >= self.max_retries {
            tracing::warn!(
                key = %entry.key,
                attempts,
                "outbox entry exhausted retries, dropping"
            );
            self.remove(entry.id)?;
            return Ok(true);
        }

        let backoff = self.base_backoff_ms.saturating_mul(1_u64 << attempts.min(20));
        let next = now_unix_ms().saturating_add(i64::try_from(backoff).unwrap_or(i64::MAX));
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE memory_outbox SET attempts = ?1, next_attempt_at = ?2 WHERE id = ?3",
            params![attempts, next, entry.id],
        )
        .map_err(io_err)?;
        Ok(false)
    }

    /// Read the entry's current content from the co-located primary table.
    /// A vanished row degrades the upsert into a delete.
    fn current_content(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT content FROM memories WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(io_err)
    }

    /// Process due entries until the batch is done or the breaker objects.
    /// Returns the number of entries completed (synced or dropped).
    pub async fn drain(
        &self,
        provider: &dyn EmbeddingProvider,
        store: &dyn VectorStore,
        breaker: Option<&CircuitBreaker>,
    ) -> anyhow::Result<usize> {
        let due = self.due_entries(DRAIN_BATCH_SIZE)?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut completed = 0_usize;
        for entry in due {
            if let Some(breaker) = breaker {
                if !breaker.allow() {
                    tracing::debug!(next_id = entry.id, "outbox drain stopped by open breaker");
                    break;
                }
            }

            let outcome = self.replay(&entry, provider, store).await;
            match outcome {
                Ok(()) => {
                    self.remove(entry.id)?;
                    if let Some(breaker) = breaker {
                        breaker.record_success();
                    }
                    completed += 1;
                }
                Err(error) => {
                    tracing::debug!(key = %entry.key, %error, "outbox replay failed");
                    if let Some(breaker) = breaker {
                        breaker.record_failure();
                    }
                    if self.reschedule(&entry)? {
                        completed += 1;
                    }
                }
            }
        }

        Ok(completed)
    }

    async fn replay(
        &self,
        entry: &OutboxEntry,
        provider: &dyn EmbeddingProvider,
        store: &dyn VectorStore,
    ) -> anyhow::Result<()> {
        match entry.operation {
            OutboxOperation::Upsert => match self.current_content(&entry.key)? {
                Some(content) => {
                    let embedding = provider.embed_one(&content).await?;
                    store.upsert(&entry.key, &embedding).await
                }
                None => {
                    store.delete(&entry.key).await?;
                    Ok(())
                }
            },
            OutboxOperation::Delete => {
                store.delete(&entry.key).await?;
                Ok(())
            }
        }
    }
}
