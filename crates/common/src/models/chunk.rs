//! Text chunk produced by the chunker and stored in the embedding index

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Where in a document's structure a chunk originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticSource {
    /// Primary body text
    Body,
    /// Footer region or trailing content
    LikelyFooter,
    /// Terms, privacy, disclaimer and similar notices
    LegalBlock,
    /// Menus and navigation bars
    Navigation,
}

impl SemanticSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticSource::Body => "body",
            SemanticSource::LikelyFooter => "likely-footer",
            SemanticSource::LegalBlock => "legal-block",
            SemanticSource::Navigation => "navigation",
        }
    }

    /// Structurally de-emphasized regions (everything but body text)
    pub fn is_structural(&self) -> bool {
        !matches!(self, SemanticSource::Body)
    }
}

impl fmt::Display for SemanticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional and classification metadata carried by every chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: String,

    /// 0-based position within the source document
    pub chunk_index: usize,

    /// Chunks produced from the same document
    pub total_chunks: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(rename = "semanticSource")]
    pub semantic_source: SemanticSource,

    #[serde(rename = "navContent", default)]
    pub nav_content: bool,

    /// Remaining document metadata
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A bounded span of document text, optionally embedded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
}

impl TextChunk {
    /// Attach an embedding; the chunk is consumed so it is never mutated afterwards
    pub fn with_embedding(self, embedding: Vec<f32>) -> Self {
        Self {
            embedding: Some(embedding),
            ..self
        }
    }

    pub fn semantic_source(&self) -> SemanticSource {
        self.metadata.semantic_source
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Character count (Unicode scalar values)
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}
