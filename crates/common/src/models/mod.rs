//! Core data model
//!
//! Types passed between the chunker, the embedding index and the
//! retrieval layer.

mod chunk;
mod document;

pub use chunk::{ChunkMetadata, SemanticSource, TextChunk};
pub use document::Document;
