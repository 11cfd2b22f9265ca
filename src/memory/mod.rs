pub mod breaker;
pub mod cache;
pub mod embeddings;
pub mod external;
pub mod factory;
pub mod hygiene;
pub mod markdown;
pub mod none;
pub mod outbox;
pub mod retrieval;
pub mod rollout;
pub mod runtime;
pub mod session;
pub mod snapshot;
pub mod sqlite;
pub mod traits;
pub mod vector;
pub mod vector_store;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cache::ResponseCache;
pub use embeddings::{create_embedding_provider, EmbeddingProvider, NoopEmbedding, OpenAiEmbedding};
pub use external::ExternalSyncMemory;
pub use factory::create_memory_runtime;
pub use hygiene::HygieneReport;
pub use markdown::MarkdownMemory;
pub use none::NullMemory;
pub use outbox::{OutboxEntry, OutboxOperation, VectorOutbox};
pub use retrieval::{
    MarkdownScanSource, PrimaryBackendSource, RetrievalCandidate, RetrievalEngine,
    RetrievalPolicy, RetrievalSource, SourceCapabilities,
};
pub use rollout::{fnv1a32, RolloutMode, RolloutPolicy, SearchPath};
pub use runtime::MemoryRuntime;
pub use session::SqliteSessionMessageStore;
pub use snapshot::MemorySnapshot;
pub use sqlite::SqliteMemory;
pub use traits::{
    BackendCapabilities, MemoryBackend, MemoryCategory, MemoryEntry, MessageEntry, MessageRole,
    SessionMessageRecord, SessionMessageStore,
};
pub use vector::{bytes_to_vec, cosine_similarity, l2_distance, vec_to_bytes};
pub use vector_store::{SqliteSharedVectorStore, VectorResult, VectorStore};
