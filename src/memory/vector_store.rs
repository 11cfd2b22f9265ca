use super::vector::{bytes_to_vec, cosine_similarity, vec_to_bytes};
use crate::error::MemoryError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// A nearest-neighbor hit. Score is cosine similarity in [0, 1].
#[derive(Debug, Clone)]
pub struct VectorResult {
    pub key: String,
    pub score: f32,
}

/// Persists `{key → embedding}` and answers brute-force nearest-neighbor
/// queries.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, key: &str, embedding: &[f32]) -> anyhow::Result<()>;
    async fn search(&self, query: &[f32], limit: usize) -> anyhow::Result<Vec<VectorResult>>;
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
    async fn count(&self) -> anyhow::Result<usize>;
}

/// Vector store sharing the primary backend's SQLite handle.
///
/// The connection is borrowed, never closed here: the `Arc` keeps the
/// primary store in charge of the handle's lifetime.
pub struct SqliteSharedVectorStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSharedVectorStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> anyhow::Result<Self> {
        {
            let guard = lock(&conn)?;
            guard
                .execute_batch(
                    "CREATE TABLE IF NOT EXISTS memory_embeddings (
                        memory_key TEXT PRIMARY KEY,
                        embedding  BLOB NOT NULL,
                        updated_at TEXT NOT NULL
                    );",
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
        .map_err(|e| MemoryError::VectorStore(format!("lock poisoned: {e}")).into())
}

fn io_err(e: rusqlite::Error) -> anyhow::Error {
    MemoryError::VectorStore(e.to_string()).into()
}

#[async_trait]
impl VectorStore for SqliteSharedVectorStore {
    async fn upsert(&self, key: &str, embedding: &[f32]) -> anyhow::Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO memory_embeddings (memory_key, embedding, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(memory_key) DO UPDATE SET
                 embedding = excluded.embedding,
                 updated_at = excluded.updated_at",
            params![key, vec_to_bytes(embedding), Utc::now().to_rfc3339()],
        )
        .map_err(io_err)?;
        Ok(())
    }

    async fn search(&self, query: &[f32], limit: usize) -> anyhow::Result<Vec<VectorResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut results = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn
                .prepare("SELECT memory_key, embedding FROM memory_embeddings")
                .map_err(io_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(io_err)?;

            let mut scored = Vec::new();
            for row in rows {
                let (key, blob) = row.map_err(io_err)?;
                let stored = bytes_to_vec(&blob)?;
                // Empty or mismatched rows score 0 rather than erroring
                let score = cosine_similarity(query, &stored);
                scored.push(VectorResult { key, score });
            }
            scored
        };

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.key.cmp(&b.key))
        });
        results.truncate(limit);
        Ok(results)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let conn = lock(&self.conn)?;
        let removed = conn
            .execute(
                "DELETE FROM memory_embeddings WHERE memory_key = ?1",
                params![key],
            )
            .map_err(io_err)?;
        Ok(removed > 0)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_embeddings", [], |row| {
                row.get(0)
            })
            .map_err(io_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
