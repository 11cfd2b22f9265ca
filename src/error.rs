use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for the memory runtime.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum EngramError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Memory ──────────────────────────────────────────────────────────
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    // ── Session store ───────────────────────────────────────────────────
    #[error("session: {0}")]
    Session(#[from] SessionError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Memory errors ──────────────────────────────────────────────────────────

/// Failure kinds for the memory core.
///
/// The primary write path is strict and surfaces these; the vector-sync path
/// captures them, records breaker/outbox state, and never raises to the
/// caller of `store`.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("backend io: {0}")]
    BackendIo(String),

    #[error("invalid memory key: {0}")]
    InvalidKey(String),

    #[error("unknown memory backend '{0}'")]
    UnknownBackend(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector store: {0}")]
    VectorStore(String),
}

// ─── Session store errors ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("store: {0}")]
    Store(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, EngramError>;
