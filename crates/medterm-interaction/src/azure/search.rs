//! Azure AI Search client - direct REST implementation of [`SearchIndex`].
//!
//! Performs hybrid (keyword + semantic) queries against a named index and
//! maps the response into [`SearchHit`]s, stripping the `@search.*`
//! bookkeeping fields out of the document payload.

use async_trait::async_trait;
use medterm_core::MedtermError;
use medterm_core::config::AppConfig;
use medterm_core::search::{SearchHit, SearchIndex, SearchRequest};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// REST client for an Azure AI Search service.
#[derive(Clone)]
pub struct AzureSearchClient {
    client: Client,
    endpoint: String,
    api_key: String,
    api_version: String,
}

impl AzureSearchClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_version: api_version.into(),
        }
    }

    /// Builds the client from the application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.search_endpoint,
            &config.search_api_key,
            &config.search_api_version,
        )
    }

    fn url(&self, index: &str) -> String {
        format!(
            "{}/indexes/{}/docs/search?api-version={}",
            self.endpoint, index, self.api_version
        )
    }
}

#[async_trait]
impl SearchIndex for AzureSearchClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, MedtermError> {
        let body = build_body(request);
        debug!(
            "Searching index '{}' for '{}' (top {})",
            request.index, request.query, request.top
        );

        let response = self
            .client
            .post(self.url(&request.index))
            .header("api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| MedtermError::search(format!("Search request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MedtermError::search(format!(
                "Search request returned {status}: {body}"
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|err| MedtermError::search(format!("Failed to parse search response: {err}")))?;

        Ok(parse_search_response(&parsed))
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SearchBody<'a> {
    search: &'a str,
    top: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    semantic_configuration: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_fields: Option<String>,
}

fn build_body(request: &SearchRequest) -> SearchBody<'_> {
    SearchBody {
        search: &request.query,
        top: request.top,
        query_type: request.semantic_config.as_ref().map(|_| "semantic"),
        semantic_configuration: request.semantic_config.as_deref(),
        search_fields: request
            .search_fields
            .as_ref()
            .map(|fields| fields.join(",")),
    }
}

/// Converts the service response into hits.
///
/// Each element of `value` carries the document fields plus `@search.score`
/// and optionally `@search.highlights`; the bookkeeping keys are moved out
/// of the document.
fn parse_search_response(response: &Value) -> Vec<SearchHit> {
    let Some(values) = response.get("value").and_then(Value::as_array) else {
        return Vec::new();
    };

    values
        .iter()
        .filter_map(|entry| {
            let object = entry.as_object()?;
            let score = object
                .get("@search.score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let highlights = object.get("@search.highlights").cloned();

            let document: serde_json::Map<String, Value> = object
                .iter()
                .filter(|(key, _)| !key.starts_with("@search."))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            let mut hit = SearchHit::new(score, Value::Object(document));
            hit.highlights = highlights;
            Some(hit)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_body_keyword_only() {
        let request = SearchRequest::new("snomed", "sepsis").with_top(5);
        let body = build_body(&request);

        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(encoded, json!({"search": "sepsis", "top": 5}));
    }

    #[test]
    fn test_build_body_semantic() {
        let request = SearchRequest::new("pcornet-icd-index", "hypertension")
            .with_top(10)
            .with_semantic_config("defaultSemanticConfig")
            .with_search_fields(vec!["STR".to_string(), "CODE".to_string()]);
        let body = build_body(&request);

        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(
            encoded,
            json!({
                "search": "hypertension",
                "top": 10,
                "queryType": "semantic",
                "semanticConfiguration": "defaultSemanticConfig",
                "searchFields": "STR,CODE",
            })
        );
    }

    #[test]
    fn test_parse_search_response() {
        let response = json!({
            "value": [
                {
                    "@search.score": 2.17,
                    "@search.highlights": {"STR": ["<em>hypertension</em>"]},
                    "id": "I10",
                    "CODE": "I10",
                    "STR": "Essential hypertension"
                },
                {
                    "@search.score": 1.02,
                    "CODE": "I15",
                    "STR": "Secondary hypertension"
                }
            ]
        });

        let hits = parse_search_response(&response);
        assert_eq!(hits.len(), 2);
        assert!((hits[0].score - 2.17).abs() < 1e-9);
        assert_eq!(hits[0].code(), Some("I10"));
        assert!(hits[0].highlights.is_some());
        assert!(hits[0].document.get("@search.score").is_none());
        assert_eq!(hits[1].code(), Some("I15"));
    }

    #[test]
    fn test_parse_search_response_empty_or_malformed() {
        assert!(parse_search_response(&json!({})).is_empty());
        assert!(parse_search_response(&json!({"value": []})).is_empty());
        assert!(parse_search_response(&json!({"value": "oops"})).is_empty());
    }

    #[test]
    fn test_url_building() {
        let client = AzureSearchClient::new("https://search.example.com/", "key", "2023-07-01-Preview");
        assert_eq!(
            client.url("pcornet-icd-index"),
            "https://search.example.com/indexes/pcornet-icd-index/docs/search?api-version=2023-07-01-Preview"
        );
    }
}
