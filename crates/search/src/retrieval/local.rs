//! Knowledge base backed by the local embedding index

use super::{HitCitation, KbSearchRequest, KbSearchResponse, KnowledgeBaseSource, SearchHit};
use crate::index::VectorStore;
use async_trait::async_trait;
use kbforge_common::errors::Result;
use kbforge_common::Embedder;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct IndexKbSource {
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
}

impl IndexKbSource {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }
}

#[async_trait]
impl KnowledgeBaseSource for IndexKbSource {
    #[instrument(skip(self, request), fields(knowledge_base = %request.knowledge_base_id))]
    async fn search(&self, request: &KbSearchRequest) -> Result<KbSearchResponse> {
        let query_embedding = self.embedder.embed(&request.query).await?;

        let results: Vec<SearchHit> = self
            .store
            .search_scored(&query_embedding, request.max_results)
            .into_iter()
            .filter(|scored| scored.score >= request.min_score)
            .map(|scored| {
                let metadata = &scored.chunk.metadata;
                let label = metadata
                    .url
                    .clone()
                    .unwrap_or_else(|| metadata.doc_id.clone());
                SearchHit {
                    content: scored.chunk.text.clone(),
                    score: scored.score,
                    citation: Some(HitCitation { label }),
                }
            })
            .collect();

        debug!(hits = results.len(), "Local index search complete");
        Ok(KbSearchResponse { results })
    }

    fn kind(&self) -> &str {
        "index"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbforge_common::embeddings::MockEmbedder;
    use kbforge_common::{ChunkMetadata, SemanticSource, TextChunk};
    use serde_json::Map;

    async fn chunk(embedder: &MockEmbedder, text: &str, url: Option<&str>) -> TextChunk {
        TextChunk {
            id: format!("doc-{}", text.len()),
            text: text.to_string(),
            embedding: Some(embedder.embed(text).await.unwrap()),
            metadata: ChunkMetadata {
                doc_id: "doc-1".into(),
                chunk_index: 0,
                total_chunks: 1,
                url: url.map(str::to_string),
                semantic_source: SemanticSource::Body,
                nav_content: false,
                extra: Map::new(),
            },
        }
    }

    fn request(query: &str, min_score: f32) -> KbSearchRequest {
        KbSearchRequest {
            knowledge_base_id: "local".into(),
            query: query.into(),
            max_results: 5,
            min_score,
        }
    }

    #[tokio::test]
    async fn test_hits_are_labelled_by_url_then_doc_id() {
        let embedder = MockEmbedder::new(128);
        let store = Arc::new(VectorStore::new());
        store.add_node(chunk(&embedder, "cookie consent banner", Some("https://example.com/cookies")).await);
        store.add_node(chunk(&embedder, "cookie consent text", None).await);

        let source = IndexKbSource::new(Arc::new(MockEmbedder::new(128)), store);
        let response = source.search(&request("cookie consent banner", 0.0)).await.unwrap();

        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].label(), Some("https://example.com/cookies"));
        assert!((response.results[0].score - 1.0).abs() < 1e-5);
        assert_eq!(response.results[1].label(), Some("doc-1"));
    }

    #[tokio::test]
    async fn test_hits_below_min_score_are_dropped() {
        let embedder = MockEmbedder::new(4096);
        let store = Arc::new(VectorStore::new());
        store.add_node(chunk(&embedder, "refund policy applies", None).await);
        store.add_node(chunk(&embedder, "zebra", None).await);

        let source = IndexKbSource::new(Arc::new(MockEmbedder::new(4096)), store);
        let response = source.search(&request("refund policy applies", 0.5)).await.unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].content, "refund policy applies");
    }
}
