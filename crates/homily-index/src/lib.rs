//! Hybrid search and ranking over a transcribed sermon corpus.
//!
//! This crate provides:
//! - Query tokenization and FTS5 query construction
//! - Lexical full-text search with an ordered fallback chain
//! - Semantic search through an embedding provider and an ANN store
//! - Batched hydration of vector hits into paragraph metadata
//! - Weighted-sum + reciprocal rank fusion deduplicated by paragraph
//! - Pagination with an "unlimited" mode and a short-TTL query cache
//! - Arena-based sermon hierarchy reads

pub mod cache;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod hierarchy;
pub mod hydrate;
pub mod lexical;
pub mod pagination;
pub mod query;
pub mod schema;
pub mod store;
pub mod vector;

// Re-exports
pub use cache::{Clock, ManualClock, QueryCache, SystemClock};
pub use engine::{
    Diagnostics, EngineConfig, SearchData, SearchEngine, SearchMode, SearchRequest,
    SearchResponse, SemanticStatus,
};
pub use error::{SearchError, StorageError};
pub use fusion::{fuse, FusedResult, FusionComponents, FusionConfig, FusionPreset};
pub use hierarchy::{BlockNode, ParagraphNode, SectionNode, SermonInfo, SermonOutline};
pub use hydrate::{HydratedRecord, ResolvedHit};
pub use lexical::{LexicalError, LexicalHit, LexicalPage, LexicalStrategy};
pub use pagination::{PageInfo, PageSize, Window};
pub use query::tokenize;
pub use store::SermonStore;
pub use vector::{SemanticHit, VectorSearchEngine};

/// Default number of candidates pulled from each leg before fusion.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 200;
