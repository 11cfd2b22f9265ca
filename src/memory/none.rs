use super::traits::{
    validate_key, BackendCapabilities, MemoryBackend, MemoryCategory, MemoryEntry,
};
use async_trait::async_trait;

/// Backend that remembers nothing.
///
/// Writes succeed and vanish; reads return nothing. Used when the host
/// disables persistence but still wants the runtime wiring in place.
pub struct NullMemory;

#[async_trait]
impl MemoryBackend for NullMemory {
    fn name(&self) -> &str {
        "none"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            backend: "none",
            supports_session_store: false,
            supports_keyword_rank: false,
            supports_transactions: false,
            supports_outbox: false,
        }
    }

    async fn store(
        &self,
        key: &str,
        _content: &str,
        _category: MemoryCategory,
        _session_id: Option<&str>,
    ) -> anyhow::Result<()> {
        validate_key(key)?;
        Ok(())
    }

    async fn recall(
        &self,
        _query: &str,
        _limit: usize,
        _session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        Ok(Vec::new())
    }

    async fn get(&self, _key: &str) -> anyhow::Result<Option<MemoryEntry>> {
        Ok(None)
    }

    async fn list(
        &self,
        _category: Option<&MemoryCategory>,
        _session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        Ok(Vec::new())
    }

    async fn forget(&self, _key: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(0)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
