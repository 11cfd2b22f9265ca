use super::traits::{
    MemoryBackend, MemoryEntry, MessageEntry, SessionMessageRecord, SessionMessageStore,
};
use crate::error::MemoryError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "memory_snapshot.json";

/// Self-describing whole-state serialization of the memory subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub version: u32,
    pub exported_at: String,
    pub backend: String,
    pub entries: Vec<MemoryEntry>,
    #[serde(default)]
    pub messages: Vec<SessionMessageRecord>,
}

fn snapshots_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("snapshots")
}

fn snapshot_path(workspace_dir: &Path) -> PathBuf {
    snapshots_dir(workspace_dir).join(SNAPSHOT_FILE)
}

/// Serialize the current entry set (and session messages, when a store is
/// attached) into `snapshots/`. Idempotent: the previous snapshot is
/// replaced atomically via temp-file + rename.
pub async fn export(
    backend: &dyn MemoryBackend,
    session_store: Option<&dyn SessionMessageStore>,
    workspace_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let entries = backend.list(None, None).await?;
    let messages = match session_store {
        Some(store) => store.all_messages().await?,
        None => Vec::new(),
    };

    let snapshot = MemorySnapshot {
        version: SNAPSHOT_VERSION,
        exported_at: Utc::now().to_rfc3339(),
        backend: backend.name().to_string(),
        entries,
        messages,
    };

    let dir = snapshots_dir(workspace_dir);
    std::fs::create_dir_all(&dir)?;

    let json = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| MemoryError::Serialization(e.to_string()))?;

    let final_path = snapshot_path(workspace_dir);
    let tmp_path = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &final_path)?;

    tracing::info!(
        entries = snapshot.entries.len(),
        messages = snapshot.messages.len(),
        path = %final_path.display(),
        "memory snapshot exported"
    );
    Ok(final_path)
}

/// Read the current snapshot. `None` when absent; malformed content is a
/// `Serialization` error so callers can decide whether to continue empty.
pub fn load(workspace_dir: &Path) -> anyhow::Result<Option<MemorySnapshot>> {
    let path = snapshot_path(workspace_dir);
    if !path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(&path)?;
    let snapshot: MemorySnapshot = serde_json::from_str(&raw)
        .map_err(|e| MemoryError::Serialization(format!("snapshot: {e}")))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(MemoryError::Serialization(format!(
            "snapshot version {} unsupported",
            snapshot.version
        ))
        .into());
    }

    Ok(Some(snapshot))
}

/// Conservative hydrate gate: only when the store is empty and a
/// well-formed snapshot exists.
pub async fn should_hydrate(backend: &dyn MemoryBackend, workspace_dir: &Path) -> bool {
    match backend.count().await {
        Ok(0) => {}
        Ok(_) => return false,
        Err(error) => {
            tracing::warn!(%error, "hydrate check skipped: count failed");
            return false;
        }
    }

    match load(workspace_dir) {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(error) => {
            tracing::warn!(%error, "snapshot unreadable, starting empty");
            false
        }
    }
}

/// Restore entries (and messages) from a snapshot. Returns the number of
/// entries written.
pub async fn hydrate(
    backend: &dyn MemoryBackend,
    session_store: Option<&dyn SessionMessageStore>,
    snapshot: MemorySnapshot,
) -> anyhow::Result<usize> {
    let mut restored = 0_usize;
    for entry in snapshot.entries {
        backend
            .store(
                &entry.key,
                &entry.content,
                entry.category,
                entry.session_id.as_deref(),
            )
            .await?;
        restored += 1;
    }

    if let Some(store) = session_store {
        for record in snapshot.messages {
            store
                .save_message(
                    &record.session_id,
                    MessageEntry::new(record.role, record.content),
                    record.auto_saved,
                )
                .await?;
        }
    }

    tracing::info!(restored, "memory hydrated from snapshot");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::session::SqliteSessionMessageStore;
    use crate::memory::sqlite::SqliteMemory;
    use crate::memory::traits::{MemoryCategory, MessageRole};
    use tempfile::TempDir;

    #[tokio::test]
    async fn export_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mem = SqliteMemory::new(tmp.path()).unwrap();
        mem.store("a", "first", MemoryCategory::Core, None)
            .await
            .unwrap();
        mem.store("b", "second", MemoryCategory::Daily, Some("s1"))
            .await
            .unwrap();

        let path = export(&mem, None, tmp.path()).await.unwrap();
        assert!(path.exists());

        let snapshot = load(tmp.path()).unwrap().unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.backend, "sqlite");
        assert_eq!(snapshot.entries.len(), 2);
    }

    #[tokio::test]
    async fn export_overwrites_previous_snapshot() {
        let tmp = TempDir::new().unwrap();
        let mem = SqliteMemory::new(tmp.path()).unwrap();
        mem.store("a", "first", MemoryCategory::Core, None)
            .await
            .unwrap();
        export(&mem, None, tmp.path()).await.unwrap();

        mem.store("b", "second", MemoryCategory::Core, None)
            .await
            .unwrap();
        export(&mem, None, tmp.path()).await.unwrap();

        let snapshot = load(tmp.path()).unwrap().unwrap();
        assert_eq!(snapshot.entries.len(), 2);
    }

    #[tokio::test]
    async fn hydrate_restores_entries_and_messages() {
        let source_tmp = TempDir::new().unwrap();
        let source = SqliteMemory::new(source_tmp.path()).unwrap();
        let source_messages =
            SqliteSessionMessageStore::new(source.shared_connection()).unwrap();
        source
            .store("k", "kept", MemoryCategory::Core, None)
            .await
            .unwrap();
        source_messages
            .save_message("s1", MessageEntry::new(MessageRole::User, "hello"), true)
            .await
            .unwrap();
        export(&source, Some(&source_messages), source_tmp.path())
            .await
            .unwrap();

        let target_tmp = TempDir::new().unwrap();
        let target = SqliteMemory::new(target_tmp.path()).unwrap();
        let target_messages =
            SqliteSessionMessageStore::new(target.shared_connection()).unwrap();

        let snapshot = load(source_tmp.path()).unwrap().unwrap();
        let restored = hydrate(&target, Some(&target_messages), snapshot)
            .await
            .unwrap();

        assert_eq!(restored, 1);
        assert_eq!(target.get("k").await.unwrap().unwrap().content, "kept");
        let messages = target_messages.get_messages("s1", None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn should_hydrate_requires_empty_store_and_valid_snapshot() {
        let tmp = TempDir::new().unwrap();
        let mem = SqliteMemory::new(tmp.path()).unwrap();

        // No snapshot yet
        assert!(!should_hydrate(&mem, tmp.path()).await);

        mem.store("k", "content", MemoryCategory::Core, None)
            .await
            .unwrap();
        export(&mem, None, tmp.path()).await.unwrap();

        // Snapshot exists but the store is non-empty
        assert!(!should_hydrate(&mem, tmp.path()).await);

        mem.forget("k").await.unwrap();
        assert!(should_hydrate(&mem, tmp.path()).await);
    }

    #[tokio::test]
    async fn malformed_snapshot_is_a_serialization_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("snapshots")).unwrap();
        std::fs::write(tmp.path().join("snapshots").join(SNAPSHOT_FILE), "{oops").unwrap();

        let err = load(tmp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::Serialization(_))
        ));

        // And the hydrate gate treats it as "start empty"
        let mem = SqliteMemory::new(tmp.path()).unwrap();
        assert!(!should_hydrate(&mem, tmp.path()).await);
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("snapshots")).unwrap();
        std::fs::write(
            tmp.path().join("snapshots").join(SNAPSHOT_FILE),
            r#"{"version":99,"exported_at":"2025-01-01T00:00:00Z","backend":"sqlite","entries":[]}"#,
        )
        .unwrap();

        assert!(load(tmp.path()).is_err());
    }
}
