use crate::error::MemoryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single memory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub key: String,
    pub content: String,
    pub category: MemoryCategory,
    pub timestamp: String,
    pub session_id: Option<String>,
    pub score: Option<f64>,
}

/// Memory categories for organization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Long-term facts, preferences, decisions
    Core,
    /// Daily session logs
    Daily,
    /// Conversation context
    Conversation,
    /// User-defined custom category
    Custom(String),
}

impl MemoryCategory {
    /// Parse a category label; unknown labels become `Custom`.
    pub fn parse(label: &str) -> Self {
        match label {
            "core" => Self::Core,
            "daily" => Self::Daily,
            "conversation" => Self::Conversation,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Daily => write!(f, "daily"),
            Self::Conversation => write!(f, "conversation"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Feature set a backend publishes so consumers can opt into extras.
///
/// The vector plane requires `supports_transactions`; the outbox additionally
/// requires `supports_outbox` (a table co-located with the primary store).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub backend: &'static str,
    pub supports_session_store: bool,
    pub supports_keyword_rank: bool,
    pub supports_transactions: bool,
    pub supports_outbox: bool,
}

/// Chat message roles
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(MemoryError::Serialization(format!("unknown message role: {other}")).into()),
        }
    }
}

/// A single chat message. Append-only once saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub role: MessageRole,
    pub content: String,
}

impl MessageEntry {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Authoritative key→entry store with keyword search.
///
/// `store` is an upsert by key: the entry id stays stable across overwrites
/// and replacement is atomic from a reader's perspective. `recall` order
/// defines the 1-based keyword rank consumed by the retrieval engine.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> BackendCapabilities;
    async fn store(
        &self,
        key: &str,
        content: &str,
        category: MemoryCategory,
        session_id: Option<&str>,
    ) -> anyhow::Result<()>;
    async fn recall(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<MemoryEntry>>;
    async fn list(
        &self,
        category: Option<&MemoryCategory>,
        session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>>;
    async fn forget(&self, key: &str) -> anyhow::Result<bool>;
    async fn count(&self) -> anyhow::Result<usize>;
    async fn health_check(&self) -> bool;
}

/// A saved message with its session context, as exported to snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessageRecord {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub auto_saved: bool,
}

/// Append-only per-session chat history.
#[async_trait]
pub trait SessionMessageStore: Send + Sync {
    async fn save_message(
        &self,
        session_id: &str,
        message: MessageEntry,
        auto_saved: bool,
    ) -> anyhow::Result<()>;
    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<MessageEntry>>;
    async fn clear_messages(&self, session_id: &str) -> anyhow::Result<usize>;
    async fn clear_auto_saved(&self, session_id: &str) -> anyhow::Result<usize>;
    /// Every message across sessions, in insertion order. Snapshot export
    /// reads this; it is not a conversation API.
    async fn all_messages(&self) -> anyhow::Result<Vec<SessionMessageRecord>>;
    async fn health_check(&self) -> bool;
}

/// Reject keys that cannot round-trip through every backend.
pub fn validate_key(key: &str) -> anyhow::Result<()> {
    if key.trim().is_empty() {
        return Err(MemoryError::InvalidKey("key must not be empty".into()).into());
    }
    if key.contains('\n') {
        return Err(MemoryError::InvalidKey("key must be a single line".into()).into());
    }
    Ok(())
}
