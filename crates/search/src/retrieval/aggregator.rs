//! Multi knowledge-base aggregation
//!
//! Fans one query out to every requested knowledge base as independent
//! tasks, waits for all of them to settle, then pools, ranks and
//! truncates the hits. A failing, panicking or slow backend is reported in
//! `failed_kbs` and never affects the others.

use super::{
    KbSearchRequest, KbSettingsProvider, KnowledgeBaseResolver, SearchHit, UserKbSettings,
};
use futures::future::join_all;
use kbforge_common::config::RetrievalConfig;
use kbforge_common::errors::{AppError, Result};
use kbforge_common::metrics::KbQueryTimer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Label reported for a failed knowledge base whose own label is unknown
pub const UNIDENTIFIED_KNOWLEDGE_BASE: &str = "Unidentified Knowledge Base";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    KnowledgeBase,
}

/// An attributable excerpt ready to be shown alongside an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub context_type: ContextType,
    pub knowledge_base_id: String,
    pub source_label: String,
    pub citation: String,
}

/// Merged citations plus the labels of knowledge bases that failed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbResults {
    pub citations: Vec<Citation>,
    pub failed_kbs: Vec<String>,
}

impl KbResults {
    pub fn has_failures(&self) -> bool {
        !self.failed_kbs.is_empty()
    }
}

struct KbFailure {
    label: Option<String>,
    error: AppError,
}

/// Queries many knowledge bases concurrently
pub struct KbAggregator {
    resolver: Arc<dyn KnowledgeBaseResolver>,
    settings: Arc<dyn KbSettingsProvider>,
    max_results: usize,
    min_score: f32,
    backend_timeout: Duration,
}

impl KbAggregator {
    pub fn new(
        resolver: Arc<dyn KnowledgeBaseResolver>,
        settings: Arc<dyn KbSettingsProvider>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            resolver,
            settings,
            max_results: config.max_results,
            min_score: config.min_score,
            backend_timeout: config.backend_timeout(),
        }
    }

    async fn effective_settings(&self, user_id: &str) -> (usize, f32) {
        let overrides = match self.settings.settings_for(user_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to load retrieval settings, using defaults");
                UserKbSettings::default()
            }
        };
        (
            overrides.max_results.unwrap_or(self.max_results),
            overrides.min_score.unwrap_or(self.min_score),
        )
    }

    /// Search every knowledge base in `knowledge_base_ids` for `message`.
    ///
    /// Results are pooled across backends, sorted by score (ties keep input
    /// order), truncated to the user's max results and converted to
    /// citations. Hits without a label are dropped after truncation.
    #[instrument(skip(self, message, knowledge_base_ids), fields(kb_count = knowledge_base_ids.len()))]
    pub async fn get_content_from_kbs(
        &self,
        user_id: &str,
        message: &str,
        knowledge_base_ids: &[String],
    ) -> KbResults {
        if knowledge_base_ids.is_empty() {
            return KbResults::default();
        }

        let (max_results, min_score) = self.effective_settings(user_id).await;

        let tasks: Vec<_> = knowledge_base_ids
            .iter()
            .map(|knowledge_base_id| {
                tokio::spawn(query_knowledge_base(
                    Arc::clone(&self.resolver),
                    knowledge_base_id.clone(),
                    message.to_string(),
                    max_results,
                    min_score,
                    self.backend_timeout,
                ))
            })
            .collect();

        let outcomes = join_all(tasks).await;

        let mut pooled: Vec<(&str, SearchHit)> = Vec::new();
        let mut failed_kbs = Vec::new();
        for (knowledge_base_id, outcome) in knowledge_base_ids.iter().zip(outcomes) {
            match outcome {
                Ok(Ok(hits)) => {
                    pooled.extend(hits.into_iter().map(|hit| (knowledge_base_id.as_str(), hit)));
                }
                Ok(Err(failure)) => {
                    error!(
                        knowledge_base = %knowledge_base_id,
                        error = %failure.error,
                        "Error fetching data for knowledge base"
                    );
                    failed_kbs.push(
                        failure
                            .label
                            .unwrap_or_else(|| UNIDENTIFIED_KNOWLEDGE_BASE.to_string()),
                    );
                }
                Err(e) => {
                    error!(
                        knowledge_base = %knowledge_base_id,
                        error = %e,
                        "Knowledge base task aborted"
                    );
                    failed_kbs.push(UNIDENTIFIED_KNOWLEDGE_BASE.to_string());
                }
            }
        }

        pooled.sort_by(|(_, a), (_, b)| b.score.total_cmp(&a.score));
        pooled.truncate(max_results);

        let citations: Vec<Citation> = pooled
            .into_iter()
            .filter_map(|(knowledge_base_id, hit)| {
                let citation = hit.citation.filter(|c| !c.label.is_empty())?;
                Some(Citation {
                    context_type: ContextType::KnowledgeBase,
                    knowledge_base_id: knowledge_base_id.to_string(),
                    source_label: citation.label,
                    citation: hit.content,
                })
            })
            .collect();

        info!(
            citations = citations.len(),
            failed = failed_kbs.len(),
            max_results,
            "Knowledge base aggregation complete"
        );

        KbResults {
            citations,
            failed_kbs,
        }
    }
}

/// Resolve and search one knowledge base under a single deadline
async fn query_knowledge_base(
    resolver: Arc<dyn KnowledgeBaseResolver>,
    knowledge_base_id: String,
    query: String,
    max_results: usize,
    min_score: f32,
    timeout: Duration,
) -> std::result::Result<Vec<SearchHit>, KbFailure> {
    let deadline = Instant::now() + timeout;
    let timer = KbQueryTimer::start(&knowledge_base_id);
    let timed_out = || AppError::BackendTimeout {
        knowledge_base: knowledge_base_id.clone(),
        timeout_ms: timeout.as_millis() as u64,
    };

    let resolved = match timeout_at(deadline, resolver.resolve(&knowledge_base_id)).await {
        Ok(Ok(resolved)) => resolved,
        Ok(Err(error)) => {
            timer.finish(false);
            return Err(KbFailure { label: None, error });
        }
        Err(_) => {
            timer.finish(false);
            return Err(KbFailure {
                label: None,
                error: timed_out(),
            });
        }
    };

    let label = Some(resolved.label.clone()).filter(|l| !l.is_empty());
    let request = KbSearchRequest {
        knowledge_base_id: resolved.external_id.clone(),
        query,
        max_results,
        min_score,
    };

    let searched: Result<_> = match timeout_at(deadline, resolved.source.search(&request)).await {
        Ok(result) => result,
        Err(_) => Err(timed_out()),
    };

    match searched {
        Ok(response) => {
            timer.finish(true);
            debug!(
                knowledge_base = %knowledge_base_id,
                backend = resolved.source.kind(),
                hits = response.results.len(),
                "Knowledge base search complete"
            );
            Ok(response.results)
        }
        Err(error) => {
            timer.finish(false);
            Err(KbFailure { label, error })
        }
    }
}
