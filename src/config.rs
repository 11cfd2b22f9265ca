use serde::{Deserialize, Serialize};

/// Configuration surface read by the memory core.
///
/// The host application deserializes this from its own config file; every
/// knob has a conservative default so an empty table yields a working
/// keyword-only runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "sqlite" | "markdown" | "none" | "external"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Auto-save conversation context to the session message store
    #[serde(default = "default_auto_save")]
    pub auto_save: bool,
    /// Command invoked by the "external" backend (JSON over stdio)
    #[serde(default)]
    pub external_sync_command: Option<String>,

    // ── Hygiene ──────────────────────────────────────────────────────────
    /// Run memory hygiene (archiving + retention cleanup) at init if due
    #[serde(default = "default_hygiene_enabled")]
    pub hygiene_enabled: bool,
    /// Archive non-core entries older than this many days
    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: u32,
    /// Purge entries older than this many days
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u32,
    /// Trim conversation-category entries older than this many days
    #[serde(default = "default_conversation_retention_days")]
    pub conversation_retention_days: u32,

    // ── Snapshot / hydrate ───────────────────────────────────────────────
    #[serde(default)]
    pub snapshot_enabled: bool,
    #[serde(default)]
    pub snapshot_on_hygiene: bool,
    /// Restore from the latest snapshot when the primary store is empty
    #[serde(default = "default_auto_hydrate")]
    pub auto_hydrate: bool,

    // ── Embeddings ───────────────────────────────────────────────────────
    /// Embedding provider: "none" | "openai" | "custom:URL"
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,
    /// Embedding model name (e.g. "text-embedding-3-small")
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Embedding vector dimensions
    #[serde(default = "default_embedding_dims")]
    pub embedding_dimensions: usize,

    // ── Hybrid retrieval ─────────────────────────────────────────────────
    #[serde(default)]
    pub hybrid: HybridConfig,
    /// RRF rank constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    /// Top-k results served per search
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Candidates below this fused score are dropped
    #[serde(default)]
    pub min_score: f64,

    // ── Rollout ──────────────────────────────────────────────────────────
    /// "off" | "shadow" | "canary" | "on"
    #[serde(default = "default_rollout_mode")]
    pub rollout_mode: String,
    /// Percentage of sessions routed to hybrid in canary mode
    #[serde(default = "default_canary_percent")]
    pub canary_hybrid_percent: u8,
    /// Percentage of shadow calls that actually run the hybrid observation
    #[serde(default = "default_shadow_percent")]
    pub shadow_hybrid_percent: u8,

    // ── Vector plane resilience ──────────────────────────────────────────
    #[serde(default = "default_breaker_failures")]
    pub circuit_breaker_failures: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,
    #[serde(default = "default_outbox_max_retries")]
    pub outbox_max_retries: u32,
    /// Base delay for outbox retry backoff (doubles per attempt)
    #[serde(default = "default_outbox_backoff_ms")]
    pub outbox_backoff_ms: u64,

    // ── Response cache ───────────────────────────────────────────────────
    #[serde(default)]
    pub response_cache: ResponseCacheConfig,
}

/// Hybrid retrieval controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Vector fetch budget is `top_k * candidate_multiplier`
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_backend() -> String {
    "sqlite".into()
}
fn default_auto_save() -> bool {
    true
}
fn default_hygiene_enabled() -> bool {
    true
}
fn default_archive_after_days() -> u32 {
    7
}
fn default_purge_after_days() -> u32 {
    30
}
fn default_conversation_retention_days() -> u32 {
    30
}
fn default_auto_hydrate() -> bool {
    true
}
fn default_embedding_provider() -> String {
    "none".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_dims() -> usize {
    1536
}
fn default_rrf_k() -> u32 {
    60
}
fn default_max_results() -> usize {
    6
}
fn default_rollout_mode() -> String {
    "off".into()
}
fn default_canary_percent() -> u8 {
    10
}
fn default_shadow_percent() -> u8 {
    10
}
fn default_breaker_failures() -> u32 {
    5
}
fn default_breaker_cooldown_ms() -> u64 {
    30_000
}
fn default_outbox_max_retries() -> u32 {
    5
}
fn default_outbox_backoff_ms() -> u64 {
    1_000
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_cache_ttl_minutes() -> u64 {
    60
}
fn default_cache_max_entries() -> usize {
    5_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            auto_save: default_auto_save(),
            external_sync_command: None,
            hygiene_enabled: default_hygiene_enabled(),
            archive_after_days: default_archive_after_days(),
            purge_after_days: default_purge_after_days(),
            conversation_retention_days: default_conversation_retention_days(),
            snapshot_enabled: false,
            snapshot_on_hygiene: false,
            auto_hydrate: default_auto_hydrate(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dims(),
            hybrid: HybridConfig::default(),
            rrf_k: default_rrf_k(),
            max_results: default_max_results(),
            min_score: 0.0,
            rollout_mode: default_rollout_mode(),
            canary_hybrid_percent: default_canary_percent(),
            shadow_hybrid_percent: default_shadow_percent(),
            circuit_breaker_failures: default_breaker_failures(),
            circuit_breaker_cooldown_ms: default_breaker_cooldown_ms(),
            outbox_max_retries: default_outbox_max_retries(),
            outbox_backoff_ms: default_outbox_backoff_ms(),
            response_cache: ResponseCacheConfig::default(),
        }
    }
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_minutes: default_cache_ttl_minutes(),
            max_entries: default_cache_max_entries(),
        }
    }
}
