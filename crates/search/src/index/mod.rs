//! In-memory embedding index
//!
//! Holds embedded chunks in insertion order and answers top-K queries by
//! cosine similarity, boosted for structurally de-emphasized regions
//! (footers, legal blocks, navigation) that plain similarity under-ranks.

mod similarity;

pub use similarity::cosine_similarity;

use kbforge_common::config::BoostConfig;
use kbforge_common::metrics;
use kbforge_common::{ChunkMetadata, SemanticSource, TextChunk};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Score multipliers per structural region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoostPolicy {
    pub footer: f32,
    pub legal: f32,
    pub navigation: f32,
}

impl Default for BoostPolicy {
    fn default() -> Self {
        Self::from(&BoostConfig::default())
    }
}

impl From<&BoostConfig> for BoostPolicy {
    fn from(config: &BoostConfig) -> Self {
        Self {
            footer: config.footer,
            legal: config.legal,
            navigation: config.navigation,
        }
    }
}

impl BoostPolicy {
    /// No boosting at all
    pub fn neutral() -> Self {
        Self {
            footer: 1.0,
            legal: 1.0,
            navigation: 1.0,
        }
    }

    /// Multiplier for a chunk. Footer beats legal block beats navigation.
    pub fn factor(&self, metadata: &ChunkMetadata) -> f32 {
        match metadata.semantic_source {
            SemanticSource::LikelyFooter => self.footer,
            SemanticSource::LegalBlock => self.legal,
            _ if metadata.nav_content => self.navigation,
            _ => 1.0,
        }
    }

    /// Boosted score. Negative similarity is divided so a boost always
    /// moves the chunk up.
    pub fn apply(&self, similarity: f32, metadata: &ChunkMetadata) -> f32 {
        let factor = self.factor(metadata);
        if similarity >= 0.0 {
            similarity * factor
        } else {
            similarity / factor
        }
    }
}

/// A stored chunk with its raw and boosted score
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<TextChunk>,

    /// Raw cosine similarity
    pub similarity: f32,

    /// Similarity after boosting; results are ordered by this
    pub score: f32,
}

/// Index statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub total_nodes: usize,
    pub by_source: BTreeMap<SemanticSource, usize>,
}

/// Growable collection of embedded chunks
#[derive(Debug, Default)]
pub struct VectorStore {
    nodes: RwLock<Vec<Arc<TextChunk>>>,
    boosts: BoostPolicy,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_boosts(boosts: BoostPolicy) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            boosts,
        }
    }

    pub fn boosts(&self) -> &BoostPolicy {
        &self.boosts
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<TextChunk>>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<TextChunk>>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an embedded chunk. Chunks without an embedding are dropped
    /// with a warning and `false` is returned. No deduplication by id.
    pub fn add_node(&self, chunk: TextChunk) -> bool {
        if !chunk.has_embedding() {
            warn!(chunk_id = %chunk.id, "Skipping chunk with missing embedding");
            metrics::record_index_insert(false, self.len());
            return false;
        }

        let total = {
            let mut nodes = self.write();
            nodes.push(Arc::new(chunk));
            nodes.len()
        };
        metrics::record_index_insert(true, total);
        true
    }

    /// Insert many chunks, returning how many were accepted
    pub fn add_nodes(&self, chunks: impl IntoIterator<Item = TextChunk>) -> usize {
        chunks
            .into_iter()
            .map(|chunk| self.add_node(chunk))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Every stored chunk in insertion order
    pub fn get_nodes(&self) -> Vec<Arc<TextChunk>> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Top `top_k` chunks with scores, best first. Ties keep insertion order.
    pub fn search_scored(&self, query_embedding: &[f32], top_k: usize) -> Vec<ScoredChunk> {
        if top_k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<ScoredChunk> = self
            .read()
            .iter()
            .map(|chunk| {
                let similarity = chunk
                    .embedding
                    .as_deref()
                    .map(|embedding| cosine_similarity(query_embedding, embedding))
                    .unwrap_or(0.0);
                ScoredChunk {
                    chunk: Arc::clone(chunk),
                    similarity,
                    score: self.boosts.apply(similarity, &chunk.metadata),
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);

        debug!(
            candidates = self.len(),
            returned = scored.len(),
            top_k,
            "Similarity search complete"
        );
        scored
    }

    /// Top `top_k` chunks for a query embedding. `query_text` does not
    /// influence scoring.
    pub fn find_similar_nodes(
        &self,
        query_embedding: &[f32],
        _query_text: Option<&str>,
        top_k: usize,
    ) -> Vec<Arc<TextChunk>> {
        self.search_scored(query_embedding, top_k)
            .into_iter()
            .map(|scored| scored.chunk)
            .collect()
    }

    pub fn get_stats(&self) -> IndexStats {
        let nodes = self.read();
        let mut by_source = BTreeMap::new();
        for chunk in nodes.iter() {
            *by_source.entry(chunk.semantic_source()).or_insert(0) += 1;
        }
        IndexStats {
            total_nodes: nodes.len(),
            by_source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn chunk(id: &str, source: SemanticSource, embedding: Option<Vec<f32>>) -> TextChunk {
        TextChunk {
            id: id.to_string(),
            text: format!("text of {}", id),
            embedding,
            metadata: ChunkMetadata {
                doc_id: "doc".into(),
                chunk_index: 0,
                total_chunks: 1,
                url: None,
                semantic_source: source,
                nav_content: source == SemanticSource::Navigation,
                extra: Map::new(),
            },
        }
    }

    fn ids(nodes: &[Arc<TextChunk>]) -> Vec<&str> {
        nodes.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_rejects_chunks_without_embedding() {
        let store = VectorStore::new();
        assert!(!store.add_node(chunk("a", SemanticSource::Body, None)));
        assert!(!store.add_node(chunk("b", SemanticSource::Body, Some(vec![]))));
        assert!(store.add_node(chunk("c", SemanticSource::Body, Some(vec![1.0]))));
        assert_eq!(ids(&store.get_nodes()), vec!["c"]);
    }

    #[test]
    fn test_no_deduplication_and_insertion_order() {
        let store = VectorStore::new();
        store.add_node(chunk("a", SemanticSource::Body, Some(vec![1.0, 0.0])));
        store.add_node(chunk("b", SemanticSource::Body, Some(vec![0.0, 1.0])));
        store.add_node(chunk("a", SemanticSource::Body, Some(vec![1.0, 0.0])));
        assert_eq!(ids(&store.get_nodes()), vec!["a", "b", "a"]);
        assert_eq!(store.get_stats().total_nodes, 3);
    }

    #[test]
    fn test_boost_monotonicity_for_equal_similarity() {
        let store = VectorStore::new();
        let v = Some(vec![1.0, 1.0]);
        store.add_node(chunk("body", SemanticSource::Body, v.clone()));
        store.add_node(chunk("nav", SemanticSource::Navigation, v.clone()));
        store.add_node(chunk("legal", SemanticSource::LegalBlock, v.clone()));
        store.add_node(chunk("footer", SemanticSource::LikelyFooter, v));

        let result = store.find_similar_nodes(&[1.0, 1.0], None, 4);
        assert_eq!(ids(&result), vec!["footer", "legal", "nav", "body"]);

        let scored = store.search_scored(&[1.0, 1.0], 1);
        assert!((scored[0].similarity - 1.0).abs() < 1e-6);
        assert!((scored[0].score - 1.25).abs() < 1e-5);
    }

    #[test]
    fn test_footer_boost_takes_priority_over_nav_flag() {
        let boosts = BoostPolicy::default();
        let mut footer = chunk("f", SemanticSource::LikelyFooter, None).metadata;
        footer.nav_content = true;
        assert_eq!(boosts.factor(&footer), 1.25);
        let mut legal = chunk("l", SemanticSource::LegalBlock, None).metadata;
        legal.nav_content = true;
        assert_eq!(boosts.factor(&legal), 1.15);
        assert_eq!(boosts.factor(&chunk("b", SemanticSource::Body, None).metadata), 1.0);
    }

    #[test]
    fn test_negative_similarity_is_divided() {
        let boosts = BoostPolicy::default();
        let footer = chunk("f", SemanticSource::LikelyFooter, None).metadata;
        let boosted = boosts.apply(-0.5, &footer);
        assert!(boosted > -0.5);
        assert!((boosted - (-0.4)).abs() < 1e-6);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let store = VectorStore::with_boosts(BoostPolicy::neutral());
        for id in ["first", "second", "third"] {
            store.add_node(chunk(id, SemanticSource::Body, Some(vec![0.5, 0.5])));
        }
        let result = store.find_similar_nodes(&[1.0, 1.0], Some("query"), 3);
        assert_eq!(ids(&result), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_top_k_bounds() {
        let store = VectorStore::new();
        store.add_node(chunk("a", SemanticSource::Body, Some(vec![1.0, 0.0])));
        store.add_node(chunk("b", SemanticSource::Body, Some(vec![0.0, 1.0])));
        store.add_node(chunk("c", SemanticSource::Body, Some(vec![1.0, 1.0])));

        assert_eq!(store.find_similar_nodes(&[1.0, 0.0], None, 2).len(), 2);
        assert_eq!(store.find_similar_nodes(&[1.0, 0.0], None, 10).len(), 3);
        assert!(store.find_similar_nodes(&[1.0, 0.0], None, 0).is_empty());
        assert_eq!(ids(&store.find_similar_nodes(&[1.0, 0.0], None, 1)), vec!["a"]);
    }

    #[test]
    fn test_dimension_mismatch_scores_zero() {
        let store = VectorStore::new();
        store.add_node(chunk("short", SemanticSource::Body, Some(vec![1.0])));
        store.add_node(chunk("match", SemanticSource::Body, Some(vec![0.2, 1.0])));
        let scored = store.search_scored(&[0.0, 1.0], 2);
        assert_eq!(scored[0].chunk.id, "match");
        assert_eq!(scored[1].similarity, 0.0);
    }

    #[test]
    fn test_stats_by_source() {
        let store = VectorStore::new();
        store.add_node(chunk("a", SemanticSource::Body, Some(vec![1.0])));
        store.add_node(chunk("b", SemanticSource::Body, Some(vec![1.0])));
        store.add_node(chunk("c", SemanticSource::LikelyFooter, Some(vec![1.0])));

        let stats = store.get_stats();
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.by_source.get(&SemanticSource::Body), Some(&2));
        assert_eq!(stats.by_source.get(&SemanticSource::LikelyFooter), Some(&1));
        assert_eq!(stats.by_source.get(&SemanticSource::Navigation), None);
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let store = Arc::new(VectorStore::new());
        let mut tasks = Vec::new();
        for task in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    let id = format!("{}-{}", task, i);
                    store.add_node(chunk(&id, SemanticSource::Body, Some(vec![1.0, 0.5])));
                }
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }
        assert_eq!(store.len(), 200);
    }
}
