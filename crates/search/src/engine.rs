//! Document query engine
//!
//! Chunks and embeds documents into a [`VectorStore`], then builds the
//! context block handed to a completion model: nearest chunks first, with
//! footer, legal and navigation text promoted ahead of body text.

use crate::index::{BoostPolicy, VectorStore};
use kbforge_common::config::{AppConfig, RetrievalConfig};
use kbforge_common::errors::{AppError, Result};
use kbforge_common::{Document, Embedder, TextChunk};
use kbforge_ingestion::{Chunker, ChunkerConfig};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct QueryEngine {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    candidate_pool: usize,
    context_limit: usize,
    min_context_chars: usize,
}

impl QueryEngine {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
        retrieval: &RetrievalConfig,
    ) -> Self {
        Self {
            chunker,
            embedder,
            store,
            candidate_pool: retrieval.candidate_pool,
            context_limit: retrieval.context_limit,
            min_context_chars: retrieval.min_context_chars,
        }
    }

    /// Engine with a fresh store, chunker and boosts taken from `config`
    pub fn from_config(config: &AppConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let chunker = Chunker::new(ChunkerConfig::from(&config.chunking))?;
        let store = Arc::new(VectorStore::with_boosts(BoostPolicy::from(
            &config.retrieval.boost,
        )));
        Ok(Self::new(chunker, embedder, store, &config.retrieval))
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Chunk, embed and index documents `batch_size` at a time.
    ///
    /// Each batch is embedded with one call. Returns the number of chunks
    /// indexed.
    #[instrument(skip(self, documents), fields(documents = documents.len()))]
    pub async fn add_documents(&self, documents: &[Document], batch_size: usize) -> Result<usize> {
        let mut indexed = 0;

        for (batch_index, batch) in documents.chunks(batch_size.max(1)).enumerate() {
            let chunks: Vec<TextChunk> = batch
                .iter()
                .flat_map(|doc| self.chunker.process_document(doc))
                .collect();
            if chunks.is_empty() {
                continue;
            }

            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            if embeddings.len() != chunks.len() {
                return Err(AppError::EmbeddingError {
                    message: format!(
                        "Expected {} embeddings, got {}",
                        chunks.len(),
                        embeddings.len()
                    ),
                });
            }

            let accepted = self.store.add_nodes(
                chunks
                    .into_iter()
                    .zip(embeddings)
                    .map(|(chunk, embedding)| chunk.with_embedding(embedding)),
            );
            indexed += accepted;

            debug!(batch = batch_index, chunks = accepted, "Batch indexed");
        }

        info!(indexed, total = self.store.len(), "Documents indexed");
        Ok(indexed)
    }

    /// Chunks to use as context for `query`
    #[instrument(skip(self, query))]
    pub async fn retrieve_context(&self, query: &str) -> Result<Vec<Arc<TextChunk>>> {
        let query_embedding = self.embedder.embed(query).await?;
        let mut candidates =
            self.store
                .find_similar_nodes(&query_embedding, Some(query), self.candidate_pool);

        // Structural regions first, similarity order kept within each group
        candidates.sort_by_key(|chunk| !chunk.semantic_source().is_structural());
        candidates.retain(|chunk| chunk.char_len() > self.min_context_chars);
        candidates.truncate(self.context_limit);

        debug!(selected = candidates.len(), "Context retrieved");
        Ok(candidates)
    }
}

/// Render chunks as numbered document blocks
pub fn render_context(chunks: &[Arc<TextChunk>]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| match chunk.metadata.url.as_deref() {
            Some(url) => format!("DOCUMENT {}:\nSource: {}\n\n{}", i + 1, url, chunk.text),
            None => format!("DOCUMENT {}:\n\n{}", i + 1, chunk.text),
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
