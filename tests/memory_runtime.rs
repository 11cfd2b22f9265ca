use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engram::config::{HybridConfig, MemoryConfig};
use engram::memory::runtime::MemoryRuntimeParts;
use engram::memory::{
    create_memory_runtime, CircuitBreaker, EmbeddingProvider, MemoryBackend, MemoryCategory,
    MemoryRuntime, PrimaryBackendSource, RetrievalEngine, RetrievalPolicy, RetrievalSource,
    RolloutMode, RolloutPolicy, SearchPath, SqliteMemory, SqliteSharedVectorStore, VectorOutbox,
    VectorStore,
};
use tempfile::TempDir;

// ── Test embedding providers ─────────────────────────────────

/// Maps direction words onto fixed axes so hybrid ranking is predictable.
struct DirectionalEmbedding;

#[async_trait]
impl EmbeddingProvider for DirectionalEmbedding {
    fn name(&self) -> &str {
        "directional"
    }

    fn dimensions(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                if text.starts_with("north") {
                    vec![1.0, 0.0, 0.0]
                } else {
                    vec![0.0, 1.0, 0.0]
                }
            })
            .collect())
    }
}

struct SwitchableEmbedding {
    healthy: AtomicBool,
    calls: AtomicUsize,
}

impl SwitchableEmbedding {
    fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for SwitchableEmbedding {
    fn name(&self) -> &str {
        "switchable"
    }

    fn dimensions(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        } else {
            anyhow::bail!("embedding provider unavailable")
        }
    }
}

// ── Harness ──────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    runtime: MemoryRuntime,
    embedder: Arc<SwitchableEmbedding>,
}

/// Hand-assembled runtime with a controllable embedder, hybrid on, and the
/// rollout forced to a given mode.
fn build_runtime(
    mode: RolloutMode,
    embedder_healthy: bool,
    breaker_failures: u32,
    breaker_cooldown_ms: u64,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = MemoryConfig {
        hygiene_enabled: false,
        ..MemoryConfig::default()
    };

    let backend = Arc::new(SqliteMemory::new(tmp.path()).unwrap());
    let embedder = Arc::new(SwitchableEmbedding::new(embedder_healthy));
    let vector_store: Arc<dyn VectorStore> =
        Arc::new(SqliteSharedVectorStore::new(backend.shared_connection()).unwrap());
    let outbox = VectorOutbox::new(backend.shared_connection(), 5, 10).unwrap();
    let breaker = Arc::new(CircuitBreaker::with_settings(
        breaker_failures,
        breaker_cooldown_ms,
    ));

    let sources: Vec<Arc<dyn RetrievalSource>> = vec![Arc::new(PrimaryBackendSource::new(
        backend.clone() as Arc<dyn MemoryBackend>,
    ))];
    let engine = RetrievalEngine::new(
        sources,
        RetrievalPolicy {
            rrf_k: 60,
            top_k: 6,
            min_score: 0.0,
        },
    )
    .with_vector_plane(
        embedder.clone() as Arc<dyn EmbeddingProvider>,
        vector_store.clone(),
        breaker.clone(),
        HybridConfig {
            enabled: true,
            candidate_multiplier: 4,
        },
    );

    let runtime = MemoryRuntime::from_parts(MemoryRuntimeParts {
        outbox: Some(outbox),
        breaker,
        vector_store: Some(vector_store),
        embedder: Some(embedder.clone() as Arc<dyn EmbeddingProvider>),
        engine,
        response_cache: None,
        session_store: None,
        backend,
        rollout: RolloutPolicy::new(mode, 50, 100),
        auto_save: true,
        workspace_dir: tmp.path().to_path_buf(),
        config,
    });

    Harness {
        _tmp: tmp,
        runtime,
        embedder,
    }
}

// ── S1: keyword-only hit ─────────────────────────────────────

#[tokio::test]
async fn keyword_only_search_ranks_and_scores_by_rank() {
    let tmp = TempDir::new().unwrap();
    let cfg = MemoryConfig::default();
    let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();

    runtime
        .store("zig_pref", "User prefers Zig", MemoryCategory::Core, None)
        .await
        .unwrap();
    runtime
        .store("rust_note", "Also knows Rust", MemoryCategory::Daily, None)
        .await
        .unwrap();

    let results = runtime.search("zig", 5, None).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].key, "zig_pref");
    assert_eq!(results[0].keyword_rank, Some(1));
    assert!((results[0].final_score - 1.0 / 61.0).abs() < 1e-5);
}

// ── S2: hybrid fusion ────────────────────────────────────────

#[tokio::test]
async fn hybrid_search_fuses_vector_and_keyword_ranks() {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(SqliteMemory::new(tmp.path()).unwrap());
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(DirectionalEmbedding);
    let vector_store: Arc<dyn VectorStore> =
        Arc::new(SqliteSharedVectorStore::new(backend.shared_connection()).unwrap());
    let breaker = Arc::new(CircuitBreaker::with_settings(5, 1_000));

    for (key, content) in [
        ("north", "window faces north"),
        ("east", "balcony faces east"),
        ("up", "skylight points up"),
        ("northeast", "corner faces northeast"),
    ] {
        backend
            .store(key, content, MemoryCategory::Core, None)
            .await
            .unwrap();
        let embedding = embedder.embed_one(key).await.unwrap();
        vector_store.upsert(key, &embedding).await.unwrap();
    }

    let sources: Vec<Arc<dyn RetrievalSource>> = vec![Arc::new(PrimaryBackendSource::new(
        backend.clone() as Arc<dyn MemoryBackend>,
    ))];
    let engine = RetrievalEngine::new(
        sources,
        RetrievalPolicy {
            rrf_k: 60,
            top_k: 4,
            min_score: 0.0,
        },
    )
    .with_vector_plane(
        embedder,
        vector_store,
        breaker,
        HybridConfig {
            enabled: true,
            candidate_multiplier: 4,
        },
    );

    let results = engine.search_hybrid("north", 4, None).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].key, "north", "vector + keyword agree on north");
    assert!(results[0].vector_score.is_some());
    assert!(results[0].keyword_rank.is_some());
}

// ── S3: outbox replay ────────────────────────────────────────

#[tokio::test]
async fn failed_vector_sync_replays_through_the_outbox() {
    let harness = build_runtime(RolloutMode::On, false, 10, 60_000);

    harness
        .runtime
        .store(
            "pending",
            "content waiting for vectors",
            MemoryCategory::Core,
            None,
        )
        .await
        .unwrap();

    // The write itself succeeded; the vector work is parked
    assert_eq!(harness.runtime.count().await.unwrap(), 1);
    assert_eq!(harness.runtime.outbox_pending(), 1);

    harness.embedder.set_healthy(true);
    let drained = harness.runtime.drain_outbox().await.unwrap();
    assert_eq!(drained, 1);
    assert_eq!(harness.runtime.outbox_pending(), 0);

    // Hybrid search now sees the replayed embedding
    let results = harness.runtime.search("content", 5, None).await.unwrap();
    assert!(results.iter().any(|c| c.key == "pending"));
    assert!(results
        .iter()
        .find(|c| c.key == "pending")
        .unwrap()
        .vector_score
        .is_some());
}

// ── S4: breaker opens and degrades to keyword-only ───────────

#[tokio::test]
async fn open_breaker_degrades_search_to_keyword_only() {
    let harness = build_runtime(RolloutMode::On, false, 2, 100);

    harness
        .runtime
        .store("k", "searchable content", MemoryCategory::Core, None)
        .await
        .unwrap();

    // Two failing hybrid searches trip the breaker
    let first = harness.runtime.search("searchable", 5, None).await.unwrap();
    assert!(!first.is_empty(), "keyword results still served");
    let _ = harness.runtime.search("searchable", 5, None).await.unwrap();

    let calls_when_opened = harness.embedder.calls();
    let results = harness.runtime.search("searchable", 5, None).await.unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|c| c.vector_score.is_none()));
    assert_eq!(
        harness.embedder.calls(),
        calls_when_opened,
        "open breaker short-circuits before the provider"
    );

    // After the cooldown a single probe is admitted
    tokio::time::sleep(Duration::from_millis(120)).await;
    let _ = harness.runtime.search("searchable", 5, None).await.unwrap();
    assert_eq!(harness.embedder.calls(), calls_when_opened + 1);
}

#[tokio::test]
async fn recovered_probe_closes_the_breaker() {
    let harness = build_runtime(RolloutMode::On, false, 1, 50);

    harness
        .runtime
        .store("k", "content here", MemoryCategory::Core, None)
        .await
        .unwrap();
    let _ = harness.runtime.search("content", 5, None).await.unwrap();

    harness.embedder.set_healthy(true);
    tokio::time::sleep(Duration::from_millis(70)).await;
    let _ = harness.runtime.search("content", 5, None).await.unwrap();

    // One successful probe closes the circuit again
    let drained_calls = harness.embedder.calls();
    let _ = harness.runtime.search("content", 5, None).await.unwrap();
    assert!(harness.embedder.calls() > drained_calls);
}

// ── S5: canary stickiness at the runtime boundary ────────────

#[tokio::test]
async fn canary_split_is_sticky_and_roughly_proportional() {
    let policy = RolloutPolicy::new(RolloutMode::Canary, 50, 0);

    let hybrid = (0..1000)
        .filter(|i| policy.decide(Some(&format!("session-{i}"))) == SearchPath::Hybrid)
        .count();
    #[allow(clippy::cast_precision_loss)]
    let fraction = hybrid as f64 / 1000.0;
    assert!((0.35..=0.65).contains(&fraction), "fraction: {fraction}");

    for i in 0..50 {
        let session = format!("session-{i}");
        let first = policy.decide(Some(&session));
        for _ in 0..3 {
            assert_eq!(policy.decide(Some(&session)), first);
        }
    }
}

// ── S6: snapshot round-trip ──────────────────────────────────

#[tokio::test]
async fn snapshot_survives_a_wiped_database() {
    let tmp = TempDir::new().unwrap();
    let cfg = MemoryConfig {
        snapshot_enabled: true,
        ..MemoryConfig::default()
    };

    {
        let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();
        for (key, content) in [("a", "first"), ("b", "second"), ("c", "third")] {
            runtime
                .store(key, content, MemoryCategory::Core, None)
                .await
                .unwrap();
        }
        runtime.export_snapshot().await.unwrap();
    }

    // Wipe the primary database (WAL sidecars included)
    for name in ["memory.db", "memory.db-wal", "memory.db-shm"] {
        let _ = std::fs::remove_file(tmp.path().join(name));
    }

    let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();
    assert_eq!(runtime.count().await.unwrap(), 3);
    for (key, content) in [("a", "first"), ("b", "second"), ("c", "third")] {
        let entry = runtime.get(key).await.unwrap().unwrap();
        assert_eq!(entry.content, content);
    }
}

// ── Shadow mode ──────────────────────────────────────────────

#[tokio::test]
async fn shadow_mode_serves_keyword_results_even_when_hybrid_breaks() {
    let harness = build_runtime(RolloutMode::Shadow, false, 10, 60_000);

    harness
        .runtime
        .store("k", "observable content", MemoryCategory::Core, None)
        .await
        .unwrap();
    let calls_before_search = harness.embedder.calls();

    let results = harness
        .runtime
        .search("observable", 5, Some("session-1"))
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert!(
        results.iter().all(|c| c.vector_score.is_none()),
        "served results are the keyword path"
    );
    assert!(
        harness.embedder.calls() > calls_before_search,
        "the hybrid observation leg actually ran"
    );
}

// ── Forget keeps the planes aligned ──────────────────────────

#[tokio::test]
async fn forget_removes_entry_and_embedding() {
    let harness = build_runtime(RolloutMode::On, true, 10, 60_000);

    harness
        .runtime
        .store("gone", "to be removed", MemoryCategory::Core, None)
        .await
        .unwrap();

    assert!(harness.runtime.forget("gone").await.unwrap());
    assert!(harness.runtime.get("gone").await.unwrap().is_none());

    let results = harness.runtime.search("removed", 5, None).await.unwrap();
    assert!(results.is_empty());
}

// ── Session messages through the runtime ─────────────────────

#[tokio::test]
async fn session_messages_round_trip_through_the_runtime() {
    let tmp = TempDir::new().unwrap();
    let cfg = MemoryConfig::default();
    let runtime = create_memory_runtime(&cfg, tmp.path(), None).await.unwrap();

    runtime
        .save_message(
            "s1",
            engram::memory::MessageEntry::new(engram::memory::MessageRole::User, "hello"),
        )
        .await
        .unwrap();
    runtime
        .auto_save_message(
            "s1",
            engram::memory::MessageEntry::new(engram::memory::MessageRole::Assistant, "context"),
        )
        .await
        .unwrap();

    assert_eq!(runtime.get_messages("s1", None).await.unwrap().len(), 2);
    assert_eq!(runtime.clear_auto_saved("s1").await.unwrap(), 1);
    assert_eq!(runtime.get_messages("s1", None).await.unwrap().len(), 1);
    assert_eq!(runtime.clear_messages("s1").await.unwrap(), 1);
}
