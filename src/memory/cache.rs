use crate::error::MemoryError;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// TTL + size bounded response cache in its own SQLite file
/// (`response_cache.db`).
///
/// Keys are hashed before storage so arbitrarily long prompts stay cheap to
/// index. Eviction is LRU by `accessed_at` once `max_entries` is exceeded;
/// expired rows are dropped lazily on read.
pub struct ResponseCache {
    conn: Mutex<Connection>,
    ttl: Duration,
    max_entries: usize,
}

fn io_err(e: rusqlite::Error) -> anyhow::Error {
    MemoryError::BackendIo(e.to_string()).into()
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub fn new(workspace_dir: &Path, ttl_minutes: u64, max_entries: usize) -> anyhow::Result<Self> {
        let db_path = workspace_dir.join("response_cache.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path).map_err(io_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS response_cache (
                 key_hash    TEXT PRIMARY KEY,
                 value       TEXT NOT NULL,
                 created_at  INTEGER NOT NULL,
                 accessed_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_response_cache_accessed
                 ON response_cache(accessed_at);",
        )
        .map_err(io_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            ttl: Duration::from_secs(ttl_minutes.saturating_mul(60)),
            max_entries: max_entries.max(1),
        })
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MemoryError::BackendIo(format!("lock poisoned: {e}")).into())
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key_hash = hash_key(key);
        let now = now_unix();
        let conn = self.lock()?;

        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, created_at FROM response_cache WHERE key_hash = ?1",
                params![key_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(io_err)?;

        let Some((value, created_at)) = row else {
            return Ok(None);
        };

        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(created_at) > ttl_secs {
            conn.execute(
                "DELETE FROM response_cache WHERE key_hash = ?1",
                params![key_hash],
            )
            .map_err(io_err)?;
            return Ok(None);
        }

        conn.execute(
            "UPDATE response_cache SET accessed_at = ?1 WHERE key_hash = ?2",
            params![now, key_hash],
        )
        .map_err(io_err)?;
        Ok(Some(value))
    }

    pub fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let now = now_unix();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO response_cache (key_hash, value, created_at, accessed_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key_hash) DO UPDATE SET
                 value = excluded.value,
                 created_at = excluded.created_at,
                 accessed_at = excluded.accessed_at",
            params![hash_key(key), value, now],
        )
        .map_err(io_err)?;

        // LRU eviction keeps the table bounded
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))
            .map_err(io_err)?;
        let max = i64::try_from(self.max_entries).unwrap_or(i64::MAX);
        if count > max {
            conn.execute(
                "DELETE FROM response_cache WHERE key_hash IN (
                     SELECT key_hash FROM response_cache
                     ORDER BY accessed_at ASC
                     LIMIT ?1
                 )",
                params![count - max],
            )
            .map_err(io_err)?;
        }

        Ok(())
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))
            .map_err(io_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM response_cache", [])
            .map_err(io_err)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(ttl_minutes: u64, max_entries: usize) -> (TempDir, ResponseCache) {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path(), ttl_minutes, max_entries).unwrap();
        (tmp, cache)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_tmp, cache) = cache(60, 100);
        cache.put("prompt", "answer").unwrap();
        assert_eq!(cache.get("prompt").unwrap().as_deref(), Some("answer"));
        assert_eq!(cache.get("other").unwrap(), None);
    }

    #[test]
    fn put_overwrites_existing_value() {
        let (_tmp, cache) = cache(60, 100);
        cache.put("prompt", "old").unwrap();
        cache.put("prompt", "new").unwrap();
        assert_eq!(cache.get("prompt").unwrap().as_deref(), Some("new"));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let (_tmp, cache) = cache(0, 100);
        cache.put("prompt", "answer").unwrap();
        // created_at == now, ttl 0: anything older than this second is gone;
        // force the clock past it by backdating the row
        {
            let conn = cache.conn.lock().unwrap();
            conn.execute("UPDATE response_cache SET created_at = created_at - 10", [])
                .unwrap();
        }
        assert_eq!(cache.get("prompt").unwrap(), None);
        assert_eq!(cache.len().unwrap(), 0, "expired row removed on read");
    }

    #[test]
    fn eviction_keeps_most_recently_used() {
        let (_tmp, cache) = cache(60, 2);
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();

        // Make `a` the most recently used, then overflow with `c`
        {
            let conn = cache.conn.lock().unwrap();
            conn.execute(
                "UPDATE response_cache SET accessed_at = accessed_at - 100
                 WHERE key_hash != ?1",
                params![hash_key("a")],
            )
            .unwrap();
        }
        cache.put("c", "3").unwrap();

        assert_eq!(cache.len().unwrap(), 2);
        assert!(cache.get("a").unwrap().is_some());
        assert!(cache.get("b").unwrap().is_none(), "LRU entry evicted");
        assert!(cache.get("c").unwrap().is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let (_tmp, cache) = cache(60, 100);
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn long_keys_are_hashed() {
        let (_tmp, cache) = cache(60, 100);
        let long_key = "x".repeat(100_000);
        cache.put(&long_key, "value").unwrap();
        assert_eq!(cache.get(&long_key).unwrap().as_deref(), Some("value"));
    }
}
