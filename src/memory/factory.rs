use super::breaker::CircuitBreaker;
use super::cache::ResponseCache;
use super::embeddings::{self, EmbeddingProvider};
use super::external::ExternalSyncMemory;
use super::markdown::MarkdownMemory;
use super::none::NullMemory;
use super::outbox::VectorOutbox;
use super::retrieval::{
    MarkdownScanSource, PrimaryBackendSource, RetrievalEngine, RetrievalPolicy, RetrievalSource,
};
use super::rollout::{RolloutMode, RolloutPolicy};
use super::runtime::{MemoryRuntime, MemoryRuntimeParts};
use super::session::SqliteSessionMessageStore;
use super::snapshot;
use super::sqlite::SqliteMemory;
use super::traits::{MemoryBackend, SessionMessageStore};
use super::vector_store::{SqliteSharedVectorStore, VectorStore};
use crate::config::MemoryConfig;
use crate::error::MemoryError;
use std::path::Path;
use std::sync::Arc;

/// Assemble a `MemoryRuntime` from configuration.
///
/// Init order matters: hydrate before anything else can observe an empty
/// store, hygiene after hydrate so restored entries age normally.
pub async fn create_memory_runtime(
    config: &MemoryConfig,
    workspace_dir: &Path,
    api_key: Option<&str>,
) -> anyhow::Result<MemoryRuntime> {
    std::fs::create_dir_all(workspace_dir)?;

    // The sqlite backend is built once and lends its connection to the
    // vector store, outbox and session history
    let sqlite = match config.backend.as_str() {
        "sqlite" => Some(Arc::new(SqliteMemory::new(workspace_dir)?)),
        _ => None,
    };

    let backend: Arc<dyn MemoryBackend> = match (config.backend.as_str(), &sqlite) {
        (_, Some(sqlite)) => Arc::clone(sqlite) as Arc<dyn MemoryBackend>,
        ("markdown", None) => Arc::new(MarkdownMemory::new(workspace_dir)),
        ("none", None) => Arc::new(NullMemory),
        ("external", None) => {
            let command = config
                .external_sync_command
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| {
                    MemoryError::UnknownBackend(
                        "external (no external_sync_command configured)".into(),
                    )
                })?;
            Arc::new(ExternalSyncMemory::new(command, workspace_dir))
        }
        (other, None) => return Err(MemoryError::UnknownBackend(other.to_string()).into()),
    };

    let breaker = Arc::new(CircuitBreaker::with_settings(
        config.circuit_breaker_failures,
        config.circuit_breaker_cooldown_ms,
    ));

    let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.embedding_provider == "none" {
        None
    } else {
        Some(Arc::from(embeddings::create_embedding_provider(
            &config.embedding_provider,
            api_key,
            &config.embedding_model,
            config.embedding_dimensions,
        )))
    };

    // The vector plane requires a transactional backend to host its tables
    let (vector_store, outbox): (Option<Arc<dyn VectorStore>>, Option<VectorOutbox>) =
        match &sqlite {
            Some(sqlite) if embedder.is_some() => {
                let store: Arc<dyn VectorStore> =
                    Arc::new(SqliteSharedVectorStore::new(sqlite.shared_connection())?);
                let outbox = VectorOutbox::new(
                    sqlite.shared_connection(),
                    config.outbox_max_retries,
                    config.outbox_backoff_ms,
                )?;
                (Some(store), Some(outbox))
            }
            _ => (None, None),
        };

    let session_store: Option<Arc<dyn SessionMessageStore>> = match &sqlite {
        Some(sqlite) => Some(Arc::new(SqliteSessionMessageStore::new(
            sqlite.shared_connection(),
        )?)),
        None => None,
    };

    let response_cache = if config.response_cache.enabled {
        Some(ResponseCache::new(
            workspace_dir,
            config.response_cache.ttl_minutes,
            config.response_cache.max_entries,
        )?)
    } else {
        None
    };

    let sources: Vec<Arc<dyn RetrievalSource>> = vec![
        Arc::new(PrimaryBackendSource::new(Arc::clone(&backend))),
        Arc::new(MarkdownScanSource::new(workspace_dir)),
    ];

    let mut engine = RetrievalEngine::new(
        sources,
        RetrievalPolicy {
            rrf_k: config.rrf_k,
            top_k: config.max_results,
            min_score: config.min_score,
        },
    );
    if let (Some(embedder), Some(vector_store)) = (&embedder, &vector_store) {
        engine = engine.with_vector_plane(
            Arc::clone(embedder),
            Arc::clone(vector_store),
            Arc::clone(&breaker),
            config.hybrid.clone(),
        );
    }

    let rollout = RolloutPolicy::new(
        RolloutMode::parse(&config.rollout_mode),
        config.canary_hybrid_percent,
        config.shadow_hybrid_percent,
    );

    let runtime = MemoryRuntime::from_parts(MemoryRuntimeParts {
        outbox,
        breaker,
        vector_store,
        embedder,
        engine,
        response_cache,
        session_store,
        backend,
        rollout,
        auto_save: config.auto_save,
        workspace_dir: workspace_dir.to_path_buf(),
        config: config.clone(),
    });

    initialize(&runtime, config, workspace_dir).await;
    Ok(runtime)
}

/// Post-assembly init: hydrate, hygiene, health marks. Everything here is
/// best-effort: failures log and the runtime comes up regardless.
async fn initialize(runtime: &MemoryRuntime, config: &MemoryConfig, workspace_dir: &Path) {
    if config.auto_hydrate && runtime.backend_name() != "none" {
        hydrate_if_needed(runtime, workspace_dir).await;
    }

    if let Err(error) = runtime.run_hygiene_if_due().await {
        tracing::warn!(%error, "memory hygiene skipped");
    }

    if runtime.health_check().await {
        tracing::debug!(backend = runtime.backend_name(), "memory runtime ready");
    }
}

async fn hydrate_if_needed(runtime: &MemoryRuntime, workspace_dir: &Path) {
    // Conservative gate: only an empty store with a well-formed snapshot
    match runtime.count().await {
        Ok(0) => {}
        Ok(_) | Err(_) => return,
    }

    let snap = match snapshot::load(workspace_dir) {
        Ok(Some(snap)) => snap,
        Ok(None) => return,
        Err(error) => {
            tracing::warn!(%error, "snapshot unreadable, starting empty");
            return;
        }
    };

    if let Err(error) = runtime.hydrate_from(snap).await {
        tracing::warn!(%error, "hydrate failed, continuing with empty store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn factory_sqlite() {
        let tmp = TempDir::new().unwrap();
        let cfg = MemoryConfig::default();
        let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();
        assert_eq!(runtime.backend_name(), "sqlite");
        assert!(runtime.capabilities().supports_transactions);
    }

    #[tokio::test]
    async fn factory_markdown() {
        let tmp = TempDir::new().unwrap();
        let cfg = MemoryConfig {
            backend: "markdown".into(),
            ..MemoryConfig::default()
        };
        let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();
        assert_eq!(runtime.backend_name(), "markdown");
        assert!(!runtime.capabilities().supports_outbox);
    }

    #[tokio::test]
    async fn factory_none() {
        let tmp = TempDir::new().unwrap();
        let cfg = MemoryConfig {
            backend: "none".into(),
            ..MemoryConfig::default()
        };
        let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();
        assert_eq!(runtime.backend_name(), "none");
    }

    #[tokio::test]
    async fn factory_unknown_backend_is_error() {
        let tmp = TempDir::new().unwrap();
        let cfg = MemoryConfig {
            backend: "redis".into(),
            ..MemoryConfig::default()
        };
        let err = create_memory_runtime(&cfg, tmp.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn factory_external_requires_command() {
        let tmp = TempDir::new().unwrap();
        let cfg = MemoryConfig {
            backend: "external".into(),
            ..MemoryConfig::default()
        };
        assert!(create_memory_runtime(&cfg, tmp.path(), None).await.is_err());
    }

    #[tokio::test]
    async fn hygiene_failure_is_nonfatal() {
        let tmp = TempDir::new().unwrap();
        // A file where the state directory should be makes hygiene's
        // marker write fail
        std::fs::write(tmp.path().join("state"), "not-a-dir").unwrap();

        let cfg = MemoryConfig::default();
        let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();
        assert_eq!(runtime.backend_name(), "sqlite");
    }
}
