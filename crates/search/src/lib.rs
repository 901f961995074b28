//! kbforge Search
//!
//! Retrieval over embedded chunks:
//! - In-memory embedding index with structural score boosts
//! - Knowledge-base adapters behind a single hit type
//! - Concurrent multi knowledge-base aggregation with partial failure
//! - Query engine building completion context from documents

pub mod engine;
pub mod index;
pub mod retrieval;

pub use engine::{render_context, QueryEngine};
pub use index::{BoostPolicy, IndexStats, ScoredChunk, VectorStore};
pub use retrieval::{
    Citation, KbAggregator, KbResults, KnowledgeBaseResolver, KnowledgeBaseSource, SearchHit,
};
