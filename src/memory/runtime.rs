use super::breaker::CircuitBreaker;
use super::cache::ResponseCache;
use super::embeddings::EmbeddingProvider;
use super::outbox::{OutboxOperation, VectorOutbox};
use super::retrieval::{RetrievalCandidate, RetrievalEngine};
use super::rollout::{RolloutPolicy, SearchPath};
use super::traits::{
    BackendCapabilities, MemoryBackend, MemoryCategory, MemoryEntry, MessageEntry,
    SessionMessageStore,
};
use super::vector_store::VectorStore;
use super::{hygiene, snapshot};
use crate::config::MemoryConfig;
use crate::health;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

const BACKEND_COMPONENT: &str = "memory.backend";
const VECTOR_COMPONENT: &str = "memory.vector";

/// The assembled memory subsystem the host application holds.
///
/// Owns the primary backend, session store, response cache, retrieval
/// engine and the vector plane. The primary write path is strict; the
/// vector plane is best-effort and converges through the outbox.
///
/// Field order mirrors teardown order: the outbox and vector plane go
/// first, the primary backend last, so borrowers of the shared SQLite
/// handle are gone before its owner.
pub struct MemoryRuntime {
    outbox: Option<VectorOutbox>,
    breaker: Arc<CircuitBreaker>,
    vector_store: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    engine: RetrievalEngine,
    response_cache: Option<ResponseCache>,
    session_store: Option<Arc<dyn SessionMessageStore>>,
    backend: Arc<dyn MemoryBackend>,
    rollout: RolloutPolicy,
    auto_save: bool,
    workspace_dir: PathBuf,
    config: MemoryConfig,
}

impl std::fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("backend", &self.backend.name())
            .field("auto_save", &self.auto_save)
            .field("workspace_dir", &self.workspace_dir)
            .finish_non_exhaustive()
    }
}

pub struct MemoryRuntimeParts {
    pub outbox: Option<VectorOutbox>,
    pub breaker: Arc<CircuitBreaker>,
    pub vector_store: Option<Arc<dyn VectorStore>>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub engine: RetrievalEngine,
    pub response_cache: Option<ResponseCache>,
    pub session_store: Option<Arc<dyn SessionMessageStore>>,
    pub backend: Arc<dyn MemoryBackend>,
    pub rollout: RolloutPolicy,
    pub auto_save: bool,
    pub workspace_dir: PathBuf,
    pub config: MemoryConfig,
}

impl MemoryRuntime {
    pub fn from_parts(parts: MemoryRuntimeParts) -> Self {
        Self {
            outbox: parts.outbox,
            breaker: parts.breaker,
            vector_store: parts.vector_store,
            embedder: parts.embedder,
            engine: parts.engine,
            response_cache: parts.response_cache,
            session_store: parts.session_store,
            backend: parts.backend,
            rollout: parts.rollout,
            auto_save: parts.auto_save,
            workspace_dir: parts.workspace_dir,
            config: parts.config,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    pub fn rollout(&self) -> &RolloutPolicy {
        &self.rollout
    }

    // ── Primary path (strict) ────────────────────────────────────────────

    /// Authoritative write, then best-effort vector sync. A backend failure
    /// propagates and marks the component errored; vector failures never
    /// reach the caller.
    pub async fn store(
        &self,
        key: &str,
        content: &str,
        category: MemoryCategory,
        session_id: Option<&str>,
    ) -> anyhow::Result<()> {
        match self.backend.store(key, content, category, session_id).await {
            Ok(()) => health::mark_component_ok(BACKEND_COMPONENT),
            Err(error) => {
                health::mark_component_error(BACKEND_COMPONENT, &error);
                return Err(error);
            }
        }

        self.sync_vector_after_store(key, content).await;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<MemoryEntry>> {
        self.backend.get(key).await
    }

    pub async fn list(
        &self,
        category: Option<&MemoryCategory>,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        self.backend.list(category, session_id).await
    }

    /// Remove the authoritative entry, then best-effort remove its
    /// embedding (directly, or through the outbox when the store is away).
    pub async fn forget(&self, key: &str) -> anyhow::Result<bool> {
        let removed = self.backend.forget(key).await?;
        if !removed {
            return Ok(false);
        }

        if let Some(store) = &self.vector_store {
            if let Err(error) = store.delete(key).await {
                tracing::warn!(key, %error, "vector delete failed, enqueueing");
                self.enqueue_vector_sync(key, OutboxOperation::Delete);
            }
        }
        Ok(true)
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        self.backend.count().await
    }

    // ── Search ───────────────────────────────────────────────────────────

    /// Ranked retrieval under the rollout policy. Keyword-only and hybrid
    /// serve their own results; shadow serves keyword and records the
    /// hybrid observation on the side.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<RetrievalCandidate>> {
        match self.rollout.decide(session_id) {
            SearchPath::KeywordOnly => self.engine.search(query, limit, session_id).await,
            SearchPath::Hybrid => {
                let candidates = self.engine.search_hybrid(query, limit, session_id).await?;
                Ok(self.hydrate_vector_hits(candidates).await)
            }
            SearchPath::ShadowHybrid => {
                let served = self.engine.search(query, limit, session_id).await?;
                if self.rollout.shadow_sampled(session_id) {
                    self.observe_shadow_hybrid(query, limit, session_id, &served)
                        .await;
                }
                Ok(served)
            }
        }
    }

    /// Run the hybrid leg for observation only. Failures are invisible to
    /// the served result.
    async fn observe_shadow_hybrid(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
        served: &[RetrievalCandidate],
    ) {
        let started = Instant::now();
        match self.engine.search_hybrid(query, limit, session_id).await {
            Ok(hybrid) => {
                let overlap = hybrid
                    .iter()
                    .filter(|h| served.iter().any(|s| s.key == h.key))
                    .count();
                tracing::info!(
                    target: "memory::shadow",
                    keyword_result_count = served.len(),
                    hybrid_result_count = hybrid.len(),
                    overlap_count = overlap,
                    wallclock_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "shadow hybrid observation"
                );
            }
            Err(error) => {
                tracing::debug!(target: "memory::shadow", %error, "shadow hybrid failed");
            }
        }
    }

    /// Vector-only hits carry no payload; fill them in from the primary
    /// store so callers always see content.
    async fn hydrate_vector_hits(
        &self,
        mut candidates: Vec<RetrievalCandidate>,
    ) -> Vec<RetrievalCandidate> {
        for candidate in &mut candidates {
            if !candidate.content.is_empty() {
                continue;
            }
            match self.backend.get(&candidate.key).await {
                Ok(Some(entry)) => {
                    candidate.id = entry.id;
                    candidate.content.clone_from(&entry.content);
                    candidate.snippet = entry
                        .content
                        .chars()
                        .take(160)
                        .collect::<String>();
                    candidate.category = entry.category;
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(key = %candidate.key, %error, "hydration lookup failed");
                }
            }
        }
        candidates
    }

    // ── Vector plane (best-effort) ───────────────────────────────────────

    /// Embed the stored content and upsert its vector. Never raises: any
    /// failure records on the breaker and lands in the outbox so the index
    /// converges later.
    pub async fn sync_vector_after_store(&self, key: &str, content: &str) {
        let (Some(embedder), Some(store)) = (&self.embedder, &self.vector_store) else {
            return;
        };

        if !self.breaker.allow() {
            self.enqueue_vector_sync(key, OutboxOperation::Upsert);
            return;
        }

        match embedder.embed_one(content).await {
            Ok(embedding) if !embedding.is_empty() => {
                self.breaker.record_success();
                match store.upsert(key, &embedding).await {
                    Ok(()) => health::mark_component_ok(VECTOR_COMPONENT),
                    Err(error) => {
                        tracing::warn!(key, %error, "vector upsert failed, enqueueing");
                        health::mark_component_error(VECTOR_COMPONENT, &error);
                        self.enqueue_vector_sync(key, OutboxOperation::Upsert);
                    }
                }
            }
            Ok(_) => {
                // Noop provider: nothing to index, nothing to retry
            }
            Err(error) => {
                self.breaker.record_failure();
                tracing::warn!(key, %error, "embedding failed, enqueueing");
                health::mark_component_error(VECTOR_COMPONENT, &error);
                self.enqueue_vector_sync(key, OutboxOperation::Upsert);
            }
        }
    }

    /// Queue a sync operation unconditionally (no-op without an outbox).
    pub fn enqueue_vector_sync(&self, key: &str, operation: OutboxOperation) {
        if let Some(outbox) = &self.outbox {
            if let Err(error) = outbox.enqueue(key, operation) {
                tracing::warn!(key, %error, "outbox enqueue failed");
            }
        }
    }

    /// Replay pending vector work. Called opportunistically by the host,
    /// typically once per agent turn.
    pub async fn drain_outbox(&self) -> anyhow::Result<usize> {
        let (Some(outbox), Some(embedder), Some(store)) =
            (&self.outbox, &self.embedder, &self.vector_store)
        else {
            return Ok(0);
        };
        outbox
            .drain(embedder.as_ref(), store.as_ref(), Some(&self.breaker))
            .await
    }

    pub fn outbox_pending(&self) -> usize {
        self.outbox
            .as_ref()
            .and_then(|o| o.pending_count().ok())
            .unwrap_or(0)
    }

    // ── Session messages ─────────────────────────────────────────────────

    pub async fn save_message(
        &self,
        session_id: &str,
        message: MessageEntry,
    ) -> anyhow::Result<()> {
        match &self.session_store {
            Some(store) => store.save_message(session_id, message, false).await,
            None => Ok(()),
        }
    }

    /// Autosave of conversation context; a no-op when disabled in config.
    pub async fn auto_save_message(
        &self,
        session_id: &str,
        message: MessageEntry,
    ) -> anyhow::Result<()> {
        if !self.auto_save {
            return Ok(());
        }
        match &self.session_store {
            Some(store) => store.save_message(session_id, message, true).await,
            None => Ok(()),
        }
    }

    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<MessageEntry>> {
        match &self.session_store {
            Some(store) => store.get_messages(session_id, limit).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn clear_messages(&self, session_id: &str) -> anyhow::Result<usize> {
        match &self.session_store {
            Some(store) => store.clear_messages(session_id).await,
            None => Ok(0),
        }
    }

    pub async fn clear_auto_saved(&self, session_id: &str) -> anyhow::Result<usize> {
        match &self.session_store {
            Some(store) => store.clear_auto_saved(session_id).await,
            None => Ok(0),
        }
    }

    pub fn session_store(&self) -> Option<&Arc<dyn SessionMessageStore>> {
        self.session_store.as_ref()
    }

    // ── Response cache ───────────────────────────────────────────────────

    pub fn cached_response(&self, key: &str) -> Option<String> {
        self.response_cache
            .as_ref()
            .and_then(|cache| cache.get(key).ok().flatten())
    }

    pub fn cache_response(&self, key: &str, value: &str) {
        if let Some(cache) = &self.response_cache {
            if let Err(error) = cache.put(key, value) {
                tracing::debug!(%error, "response cache write failed");
            }
        }
    }

    // ── Lifecycle operators ──────────────────────────────────────────────

    /// Serialize the current state into `snapshots/`.
    pub async fn export_snapshot(&self) -> anyhow::Result<std::path::PathBuf> {
        snapshot::export(
            self.backend.as_ref(),
            self.session_store.as_deref(),
            &self.workspace_dir,
        )
        .await
    }

    /// Restore a loaded snapshot into the primary store (and session
    /// history when present). Returns the number of entries written.
    pub async fn hydrate_from(&self, snap: snapshot::MemorySnapshot) -> anyhow::Result<usize> {
        snapshot::hydrate(self.backend.as_ref(), self.session_store.as_deref(), snap).await
    }

    /// Run hygiene when the cadence marker says it is due; optionally
    /// refresh the snapshot afterwards.
    pub async fn run_hygiene_if_due(&self) -> anyhow::Result<Option<hygiene::HygieneReport>> {
        let report = hygiene::run_if_due(
            &self.config,
            &self.workspace_dir,
            self.backend.as_ref(),
            self.outbox.as_ref(),
        )
        .await?;

        if report.is_some() && self.config.snapshot_on_hygiene {
            if let Err(error) = self.export_snapshot().await {
                tracing::warn!(%error, "post-hygiene snapshot failed");
            }
        }
        Ok(report)
    }

    // ── Health ───────────────────────────────────────────────────────────

    pub async fn health_check(&self) -> bool {
        let healthy = self.backend.health_check().await;
        if healthy {
            health::mark_component_ok(BACKEND_COMPONENT);
        } else {
            health::mark_component_error(BACKEND_COMPONENT, "backend health check failed");
        }
        healthy
    }
}
