use super::traits::{
    validate_key, BackendCapabilities, MemoryBackend, MemoryCategory, MemoryEntry,
};
use crate::error::MemoryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend that delegates every operation to an external sync tool.
///
/// The tool is invoked as `<command> <op>` with the workspace directory in
/// `ENGRAM_WORKSPACE`, one JSON request on stdin and one JSON response on
/// stdout. Useful when memory is owned by an external synchronizer (a
/// git-backed store, a team server) rather than this process.
pub struct ExternalSyncMemory {
    command: String,
    workspace_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

impl<'a> SyncRequest<'a> {
    fn new(op: &'static str) -> Self {
        Self {
            op,
            key: None,
            content: None,
            category: None,
            query: None,
            limit: None,
            session_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    entry: Option<MemoryEntry>,
    #[serde(default)]
    entries: Vec<MemoryEntry>,
    #[serde(default)]
    removed: bool,
    #[serde(default)]
    count: usize,
}

impl ExternalSyncMemory {
    pub fn new(command: impl Into<String>, workspace_dir: &Path) -> Self {
        Self {
            command: command.into(),
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }

    async fn invoke(&self, request: &SyncRequest<'_>) -> anyhow::Result<SyncResponse> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;

        let mut child = Command::new(&self.command)
            .arg(request.op)
            .env("ENGRAM_WORKSPACE", &self.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MemoryError::BackendIo(format!("spawn {}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| MemoryError::BackendIo(format!("write request: {e}")))?;
            // Line-oriented readers need the terminator before EOF
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| MemoryError::BackendIo(format!("write request: {e}")))?;
        }

        let output = tokio::time::timeout(SYNC_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| MemoryError::BackendIo(format!("{} timed out", self.command)))?
            .map_err(|e| MemoryError::BackendIo(format!("wait {}: {e}", self.command)))?;

        if !output.status.success() {
            return Err(MemoryError::BackendIo(format!(
                "{} {} exited with {}",
                self.command, request.op, output.status
            ))
            .into());
        }

        let response: SyncResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| MemoryError::Serialization(format!("sync tool response: {e}")))?;

        if !response.ok {
            let reason = response.error.unwrap_or_else(|| "unspecified".into());
            return Err(MemoryError::BackendIo(format!(
                "{} {} failed: {reason}",
                self.command, request.op
            ))
            .into());
        }

        Ok(response)
    }
}

#[async_trait]
impl MemoryBackend for ExternalSyncMemory {
    fn name(&self) -> &str {
        "external"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            backend: "external",
            supports_session_store: false,
            supports_keyword_rank: true,
            supports_transactions: false,
            supports_outbox: false,
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

        let mut request = SyncRequest::new("store");
        request.key = Some(key);
        request.content = Some(content);
        request.category = Some(category.to_string());
        request.session_id = session_id;
        self.invoke(&request).await?;
        Ok(())
    }

    async fn recall(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let mut request = SyncRequest::new("recall");
        request.query = Some(query);
        request.limit = Some(limit);
        request.session_id = session_id;
        Ok(self.invoke(&request).await?.entries)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<MemoryEntry>> {
        let mut request = SyncRequest::new("get");
        request.key = Some(key);
        Ok(self.invoke(&request).await?.entry)
    }

    async fn list(
        &self,
        category: Option<&MemoryCategory>,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let mut request = SyncRequest::new("list");
        request.category = category.map(ToString::to_string);
        request.session_id = session_id;
        Ok(self.invoke(&request).await?.entries)
    }

    async fn forget(&self, key: &str) -> anyhow::Result<bool> {
        let mut request = SyncRequest::new("forget");
        request.key = Some(key);
        Ok(self.invoke(&request).await?.removed)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.invoke(&SyncRequest::new("count")).await?.count)
    }

    async fn health_check(&self) -> bool {
        self.invoke(&SyncRequest::new("ping")).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // A tiny sync tool: answers every op from a canned JSON table so the
    // stdio protocol is exercised end to end.
    fn fake_tool(dir: &Path) -> PathBuf {
        let path = dir.join("fake-memsync");
        let script = r#"#!/bin/sh
read -r _request
case "$1" in
  store) echo '{"ok":true}' ;;
  get)   echo '{"ok":true,"entry":{"id":"1","key":"k","content":"from tool","category":"core","timestamp":"2025-01-01T00:00:00Z","session_id":null,"score":null}}' ;;
  recall) echo '{"ok":true,"entries":[{"id":"1","key":"k","content":"from tool","category":"core","timestamp":"2025-01-01T00:00:00Z","session_id":null,"score":0.5}]}' ;;
  list)  echo '{"ok":true,"entries":[]}' ;;
  forget) echo '{"ok":true,"removed":true}' ;;
  count) echo '{"ok":true,"count":2}' ;;
  ping)  echo '{"ok":true}' ;;
  *)     echo '{"ok":false,"error":"unknown op"}' ;;
esac
"#;
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn round_trips_through_the_sync_tool() {
        let tmp = TempDir::new().unwrap();
        let tool = fake_tool(tmp.path());
        let mem = ExternalSyncMemory::new(tool.to_string_lossy(), tmp.path());

        mem.store("k", "content", MemoryCategory::Core, None)
            .await
            .unwrap();

        let entry = mem.get("k").await.unwrap().unwrap();
        assert_eq!(entry.content, "from tool");

        let recalled = mem.recall("tool", 5, None).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].score, Some(0.5));

        assert!(mem.forget("k").await.unwrap());
        assert_eq!(mem.count().await.unwrap(), 2);
        assert!(mem.health_check().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_error_response_surfaces_as_backend_io() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("failing-memsync");
        std::fs::write(&path, "#!/bin/sh\nread -r _request\necho '{\"ok\":false,\"error\":\"locked\"}'\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mem = ExternalSyncMemory::new(path.to_string_lossy(), tmp.path());
        let err = mem.count().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::BackendIo(_))
        ));
        assert!(err.to_string().contains("locked"));
    }

    #[tokio::test]
    async fn missing_tool_is_backend_io() {
        let tmp = TempDir::new().unwrap();
        let mem = ExternalSyncMemory::new("/nonexistent/memsync", tmp.path());
        let err = mem.count().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::BackendIo(_))
        ));
        assert!(!mem.health_check().await);
    }
}
