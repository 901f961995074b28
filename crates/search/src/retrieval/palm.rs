//! Remote knowledge-base search API
//!
//! `GET {endpoint}/api/v1/knowledgebases/{id}/search` with bearer auth.
//! The response is validated before mapping: every result id must be a
//! UUID and carry a score.

use super::{HitCitation, KbSearchRequest, KbSearchResponse, KnowledgeBaseSource, SearchHit};
use async_trait::async_trait;
use kbforge_common::errors::{AppError, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PalmSearchResponse {
    #[serde(default)]
    total_results: Option<u64>,
    results: Vec<PalmResult>,
}

#[derive(Debug, Deserialize)]
struct PalmResult {
    #[allow(dead_code)]
    id: Uuid,
    content: String,
    score: f32,
    #[serde(default)]
    citation: Option<PalmCitation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PalmCitation {
    #[serde(default)]
    #[allow(dead_code)]
    document_id: Option<Uuid>,
    name: String,
}

/// HTTP client for one knowledge-base API deployment
pub struct PalmKbSource {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl PalmKbSource {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn search_url(&self, knowledge_base_id: &str) -> String {
        format!(
            "{}/api/v1/knowledgebases/{}/search",
            self.endpoint, knowledge_base_id
        )
    }

    fn parse_response(knowledge_base_id: &str, body: &[u8]) -> Result<KbSearchResponse> {
        let response: PalmSearchResponse =
            serde_json::from_slice(body).map_err(|e| AppError::KnowledgeBase {
                knowledge_base: knowledge_base_id.to_string(),
                message: format!("Invalid search response: {}", e),
            })?;

        debug!(
            knowledge_base = knowledge_base_id,
            total = response.total_results.unwrap_or(response.results.len() as u64),
            "Search response received"
        );

        let results = response
            .results
            .into_iter()
            .map(|result| SearchHit {
                content: result.content,
                score: result.score,
                citation: result.citation.map(|c| HitCitation { label: c.name }),
            })
            .collect();

        Ok(KbSearchResponse { results })
    }
}

#[async_trait]
impl KnowledgeBaseSource for PalmKbSource {
    #[instrument(skip(self, request), fields(knowledge_base = %request.knowledge_base_id))]
    async fn search(&self, request: &KbSearchRequest) -> Result<KbSearchResponse> {
        let response = self
            .client
            .get(self.search_url(&request.knowledge_base_id))
            .bearer_auth(&self.api_key)
            .query(&[
                ("query", request.query.clone()),
                ("maxResults", request.max_results.to_string()),
                ("minScore", request.min_score.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::KnowledgeBase {
                knowledge_base: request.knowledge_base_id.clone(),
                message: format!("Search API returned {}: {}", status, body),
            });
        }

        let body = response.bytes().await?;
        Self::parse_response(&request.knowledge_base_id, &body)
    }

    fn kind(&self) -> &str {
        "palm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_maps_valid_response() {
        let body = json!({
            "totalResults": 1,
            "results": [{
                "id": "123e4567-e89b-12d3-a456-426614174000",
                "content": "Test content",
                "score": 0.42,
                "citation": {
                    "documentId": "123e4567-e89b-12d3-a456-426614174000",
                    "name": "test content citation",
                    "filename": "test-content-citation"
                }
            }]
        });

        let response = PalmKbSource::parse_response("kb", body.to_string().as_bytes()).unwrap();
        assert_eq!(
            response.results,
            vec![SearchHit {
                content: "Test content".into(),
                score: 0.42,
                citation: Some(HitCitation {
                    label: "test content citation".into()
                }),
            }]
        );
    }

    #[test]
    fn test_result_without_citation_has_no_label() {
        let body = json!({
            "results": [{
                "id": "123e4567-e89b-12d3-a456-426614174000",
                "content": "Anonymous",
                "score": 0.9
            }]
        });
        let response = PalmKbSource::parse_response("kb", body.to_string().as_bytes()).unwrap();
        assert_eq!(response.results[0].label(), None);
    }

    #[test]
    fn test_rejects_invalid_schema() {
        let body = json!({
            "totalResults": 1,
            "results": [{
                "id": "invalid-uuid",
                "content": "Test content",
                "links": { "self": "https://api.example.com/resource/invalid-uuid" }
            }]
        });
        let err = PalmKbSource::parse_response("kb", body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, AppError::KnowledgeBase { ref knowledge_base, .. } if knowledge_base == "kb"));
    }

    #[test]
    fn test_search_url_trims_trailing_slash() {
        let source = PalmKbSource::new("https://api.example.com/", "key", Duration::from_secs(1)).unwrap();
        assert_eq!(
            source.search_url("test-kb-id"),
            "https://api.example.com/api/v1/knowledgebases/test-kb-id/search"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let source = PalmKbSource::new("http://127.0.0.1:1", "key", Duration::from_secs(2)).unwrap();
        let request = KbSearchRequest {
            knowledge_base_id: "kb".into(),
            query: "privacy".into(),
            max_results: 5,
            min_score: 0.4,
        };
        assert!(source.search(&request).await.is_err());
    }
}
