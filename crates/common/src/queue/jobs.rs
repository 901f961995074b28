//! Job payloads for the two task queues

use super::TaskQueue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::Validate;

/// A closed, task-specific record that can be submitted to its queue
pub trait JobPayload: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {
    /// Queue this payload type is submitted to
    const QUEUE: TaskQueue;
}

/// One policy to evaluate against a crawled page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PolicySpec {
    #[validate(length(min = 1))]
    pub title: String,
    pub content: String,
    pub requirements: String,
}

/// Evaluate a set of policies against one web page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceJob {
    pub job_id: Uuid,
    #[validate(length(min = 1))]
    pub user_id: String,
    pub agent_id: Uuid,
    #[validate(url)]
    pub url: String,
    /// Id of the completion model to use
    pub model: Uuid,
    #[validate(length(min = 1), nested)]
    pub policies: Vec<PolicySpec>,
    #[serde(default)]
    pub instructions: String,
}

impl JobPayload for ComplianceJob {
    const QUEUE: TaskQueue = TaskQueue::ComplianceChecks;
}

/// Collect and summarize papers matching a filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResearchJob {
    pub job_id: Uuid,
    #[validate(length(min = 1))]
    pub user_id: String,
    pub agent_id: Uuid,
    #[validate(length(min = 1))]
    pub date_start: String,
    #[validate(length(min = 1))]
    pub date_end: String,
    pub model: Uuid,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub institutions: Vec<String>,
    #[validate(length(equal = 64))]
    pub search_hash: String,
}

impl ResearchJob {
    /// Search parameters that identify equivalent research requests
    pub fn search(&self) -> ResearchSearch<'_> {
        ResearchSearch {
            date_start: &self.date_start,
            date_end: &self.date_end,
            categories: &self.categories,
            institutions: &self.institutions,
        }
    }
}

impl JobPayload for ResearchJob {
    const QUEUE: TaskQueue = TaskQueue::ResearchJobs;
}

/// Borrowed research search parameters
#[derive(Debug, Clone, Copy)]
pub struct ResearchSearch<'a> {
    pub date_start: &'a str,
    pub date_end: &'a str,
    pub categories: &'a [String],
    pub institutions: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NormalizedSearch {
    date_start: String,
    date_end: String,
    categories: Vec<String>,
    institutions: Vec<String>,
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn normalize_list(values: &[String]) -> Vec<String> {
    let mut list: Vec<String> = values.iter().map(|v| normalize(v)).collect();
    list.sort();
    list
}

/// SHA-256 hex digest of the normalized search.
///
/// Case, surrounding whitespace and list order do not change the hash.
pub fn research_search_hash(search: ResearchSearch<'_>) -> String {
    let normalized = NormalizedSearch {
        date_start: normalize(search.date_start),
        date_end: normalize(search.date_end),
        categories: normalize_list(search.categories),
        institutions: normalize_list(search.institutions),
    };

    // Serializing plain strings and vectors cannot fail
    let canonical = serde_json::to_string(&normalized).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Key holding cached results of a finished search
pub fn research_cache_key(hash: &str) -> String {
    format!("research-cache:{}", hash)
}

/// Key pointing at the job currently running a search
pub fn research_active_key(hash: &str) -> String {
    format!("research-active:{}", hash)
}
