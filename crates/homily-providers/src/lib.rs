//! External provider clients for homily.
//!
//! This crate provides:
//! - An embedding provider trait and an OpenAI-compatible HTTP implementation
//! - A vector store trait and a REST client for Milvus/Zilliz-style ANN search
//! - Shared retry/backoff for idempotent POSTs (5xx/429/timeouts only)
//! - Typed provider errors that keep status codes and truncated bodies
//!   without ever carrying credentials

pub mod embeddings;
pub mod error;
pub mod retry;
pub mod vector_store;

// Re-exports
pub use embeddings::{EmbeddingProvider, OpenAiEmbeddings};
pub use error::ProviderError;
pub use retry::RetryPolicy;
pub use vector_store::{AnnQuery, Metric, RawHit, RestVectorStore, VectorStore};

/// Default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default ANN collection name.
pub const DEFAULT_COLLECTION: &str = "sermon_blocks";
