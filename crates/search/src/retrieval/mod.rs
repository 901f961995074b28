//! Knowledge-base retrieval
//!
//! Every backend adapter maps its response into [`SearchHit`], so the
//! aggregator never sees backend-specific shapes:
//! - [`PalmKbSource`] - remote knowledge-base search API over HTTP
//! - [`IndexKbSource`] - local embedding index
//! - [`KbAggregator`] - concurrent fan-out across many knowledge bases

mod aggregator;
mod local;
mod palm;
mod registry;

pub use aggregator::{Citation, ContextType, KbAggregator, KbResults, UNIDENTIFIED_KNOWLEDGE_BASE};
pub use local::IndexKbSource;
pub use palm::PalmKbSource;
pub use registry::{KbRegistry, StaticKbSettings};

use async_trait::async_trait;
use kbforge_common::errors::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Attribution for a search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitCitation {
    /// Human-readable source label
    pub label: String,
}

/// One result returned by a knowledge-base backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Text excerpt
    pub content: String,

    /// Backend relevance score
    pub score: f32,

    /// Attribution; hits without one cannot be cited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<HitCitation>,
}

impl SearchHit {
    pub fn label(&self) -> Option<&str> {
        self.citation.as_ref().map(|c| c.label.as_str())
    }
}

/// Search request sent to one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbSearchRequest {
    /// Backend-side knowledge base id
    pub knowledge_base_id: String,

    /// Query text
    pub query: String,

    /// Maximum results to return
    pub max_results: usize,

    /// Minimum score threshold
    pub min_score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KbSearchResponse {
    pub results: Vec<SearchHit>,
}

/// A searchable knowledge-base backend
#[async_trait]
pub trait KnowledgeBaseSource: Send + Sync {
    /// Search the backend
    async fn search(&self, request: &KbSearchRequest) -> Result<KbSearchResponse>;

    /// Backend kind, used in logs
    fn kind(&self) -> &str;
}

/// A knowledge base resolved to its backend
#[derive(Clone)]
pub struct ResolvedKnowledgeBase {
    /// Caller-facing id
    pub id: String,

    /// Id the backend knows the knowledge base by
    pub external_id: String,

    /// Human-readable label
    pub label: String,

    pub source: Arc<dyn KnowledgeBaseSource>,
}

impl fmt::Debug for ResolvedKnowledgeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedKnowledgeBase")
            .field("id", &self.id)
            .field("external_id", &self.external_id)
            .field("label", &self.label)
            .field("source", &self.source.kind())
            .finish()
    }
}

/// Resolves knowledge-base ids to backends
#[async_trait]
pub trait KnowledgeBaseResolver: Send + Sync {
    async fn resolve(&self, knowledge_base_id: &str) -> Result<ResolvedKnowledgeBase>;
}

/// Per-user retrieval overrides; `None` falls back to system defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserKbSettings {
    pub max_results: Option<usize>,
    pub min_score: Option<f32>,
}

/// Source of per-user retrieval settings
#[async_trait]
pub trait KbSettingsProvider: Send + Sync {
    async fn settings_for(&self, user_id: &str) -> Result<UserKbSettings>;
}
