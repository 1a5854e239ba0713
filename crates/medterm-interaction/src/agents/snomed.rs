//! SNOMED CT retrieval agent.
//!
//! Same shape as the ICD agent against the SNOMED index; citations come
//! back numbered (`[1]`, `[2]`) and are rewritten to concept codes.

use std::sync::Arc;

use medterm_core::MedtermError;
use medterm_core::extract::{hits_from_json, hits_to_json};
use medterm_core::search::{SearchHit, SearchIndex, SearchRequest};
use medterm_core::session::{DataItem, SessionStore};
use medterm_core::text::strip_html_keep_newlines;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{error, info};

use crate::agent::{AgentError, ChatModel, ChatRequest};
use crate::agents::AgentOutput;
use crate::prompts;
use crate::retry::{RetryPolicy, retry_with_backoff};

static NUMBERED_CITATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").unwrap());

/// Details of a single SNOMED concept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConceptDetails {
    pub code: String,
    pub concept_name: String,
    pub source: String,
    /// False when only the closest (not exact) match was found
    pub exact: bool,
}

/// Agent querying the SNOMED CT terminology index.
pub struct SnomedAgent {
    search: Arc<dyn SearchIndex>,
    model: Arc<dyn ChatModel>,
    retry: RetryPolicy,
    index: String,
    top_k: usize,
    temperature: f32,
    max_tokens: u32,
}

impl SnomedAgent {
    pub fn new(
        search: Arc<dyn SearchIndex>,
        model: Arc<dyn ChatModel>,
        index: impl Into<String>,
    ) -> Self {
        Self {
            search,
            model,
            retry: RetryPolicy::default(),
            index: index.into(),
            top_k: 10,
            temperature: 0.7,
            max_tokens: 1000,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Searches the SNOMED index and answers with code citations.
    pub async fn process(&self, query: &str) -> Result<AgentOutput, MedtermError> {
        let request = SearchRequest::new(&self.index, query).with_top(self.top_k);
        let hits = self.search.search(&request).await?;

        if hits.is_empty() {
            return Ok(AgentOutput::message_only(
                "No SNOMED concepts found for your query.",
            ));
        }

        let context = format_concept_context(&hits);
        let request = ChatRequest::system_user(
            prompts::SNOMED_SYSTEM_PROMPT,
            prompts::snomed_user_prompt(query, &context),
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = self.complete_with_retry(request).await?;
        let response = strip_html_keep_newlines(&response);
        let response = normalize_numbered_citations(&response, &hits);

        Ok(AgentOutput::new(hits_to_json(&hits), response))
    }

    /// Processes a query, replacing the session's data with the new hits.
    ///
    /// The latest SNOMED result set supersedes whatever the session held;
    /// failures degrade to a user-facing message.
    pub async fn process_interactive(
        &self,
        query: &str,
        session_id: &str,
        sessions: &mut SessionStore,
    ) -> AgentOutput {
        sessions.start_session(session_id);

        match self.process(query).await {
            Err(err) => {
                error!("Interactive SNOMED processing failed: {err}");
                AgentOutput::message_only(format!("An error occurred: {err}"))
            }
            Ok(output) => {
                let hits = hits_from_json(&output.data);
                let items: Vec<DataItem> = hits
                    .iter()
                    .filter_map(|hit| {
                        let code = hit.code()?;
                        let label = hit.label()?;
                        Some(
                            DataItem::new("snomed_code", code, label)
                                .with_metadata("full_document", hit.document.clone())
                                .with_source_query(query),
                        )
                    })
                    .collect();

                let count = items.len();
                sessions.replace_items(session_id, items);
                sessions.record_query(session_id, query);
                info!("Stored {count} SNOMED concepts in session {session_id}");

                output
            }
        }
    }

    /// Fetches details for one concept code, preferring an exact match.
    pub async fn concept_details(&self, concept_code: &str) -> Result<ConceptDetails, MedtermError> {
        let top = std::cmp::max(5, self.top_k / 2);
        let request = SearchRequest::new(&self.index, concept_code).with_top(top);
        let hits = self.search.search(&request).await?;

        if hits.is_empty() {
            return Err(MedtermError::not_found("snomed_concept", concept_code));
        }

        let exact = hits.iter().find(|hit| hit.code() == Some(concept_code));
        let (hit, is_exact) = match exact {
            Some(hit) => (hit, true),
            None => (&hits[0], false),
        };

        Ok(ConceptDetails {
            code: hit.code().unwrap_or(concept_code).to_string(),
            concept_name: hit.label().unwrap_or("").to_string(),
            source: hit.field_str("SAB").unwrap_or("").to_string(),
            exact: is_exact,
        })
    }

    async fn complete_with_retry(&self, request: ChatRequest) -> Result<String, AgentError> {
        retry_with_backoff(&self.retry, || self.model.complete(request.clone())).await
    }
}

/// Formats hits into the numbered context block the prompt refers to.
fn format_concept_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(idx, hit)| {
            format!(
                "[{}] SNOMED Code: {}\n    Concept: {}\n    Source: {}",
                idx + 1,
                hit.code().unwrap_or("N/A"),
                hit.label().unwrap_or("N/A"),
                hit.field_str("SAB").unwrap_or("N/A")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Rewrites `[1]`-style citations to the cited document's concept code.
///
/// Numbers without a matching document (including literal SNOMED codes in
/// brackets) are left untouched.
fn normalize_numbered_citations(response: &str, hits: &[SearchHit]) -> String {
    let codes: Vec<Option<&str>> = hits.iter().map(|hit| hit.code()).collect();

    NUMBERED_CITATION_RE
        .replace_all(response, |caps: &regex::Captures<'_>| {
            let index: usize = match caps[1].parse() {
                Ok(n) => n,
                Err(_) => return caps[0].to_string(),
            };
            match index.checked_sub(1).and_then(|i| codes.get(i)).copied().flatten() {
                Some(code) => format!("[{code}]"),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct CannedSearch {
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl SearchIndex for CannedSearch {
        async fn search(&self, _request: &SearchRequest) -> Result<Vec<SearchHit>, MedtermError> {
            Ok(self.hits.clone())
        }
    }

    struct CitingModel;

    #[async_trait]
    impl ChatModel for CitingModel {
        async fn complete(&self, _request: ChatRequest) -> Result<String, AgentError> {
            Ok("The preferred concept is described in [1], see also [2] and [9].".to_string())
        }
    }

    fn snomed_hit(code: &str, label: &str) -> SearchHit {
        SearchHit::new(1.0, json!({"CODE": code, "STR": label, "SAB": "SNOMEDCT_US"}))
    }

    fn agent(hits: Vec<SearchHit>) -> SnomedAgent {
        SnomedAgent::new(Arc::new(CannedSearch { hits }), Arc::new(CitingModel), "snomed")
            .with_retry(RetryPolicy::new(0, std::time::Duration::from_millis(1)))
    }

    #[test]
    fn test_numbered_citations_become_codes() {
        let hits = vec![snomed_hit("59621000", "Essential hypertension"), snomed_hit("38341003", "Hypertensive disorder")];
        let response = "See [1] and [2], but [7] stays.";

        let normalized = normalize_numbered_citations(response, &hits);
        assert_eq!(normalized, "See [59621000] and [38341003], but [7] stays.");
    }

    #[test]
    fn test_concept_context_is_numbered() {
        let context = format_concept_context(&[snomed_hit("59621000", "Essential hypertension")]);
        assert!(context.starts_with("[1] SNOMED Code: 59621000"));
        assert!(context.contains("Source: SNOMEDCT_US"));
    }

    #[tokio::test]
    async fn test_process_empty_results() {
        let output = agent(vec![]).process("very rare concept").await.unwrap();
        assert!(output.message.contains("No SNOMED concepts found"));
    }

    #[tokio::test]
    async fn test_process_normalizes_citations() {
        let hits = vec![snomed_hit("59621000", "Essential hypertension"), snomed_hit("38341003", "Hypertensive disorder")];
        let output = agent(hits).process("hypertension concepts").await.unwrap();

        assert!(output.message.contains("[59621000]"));
        assert!(output.message.contains("[38341003]"));
        // Citation [9] has no matching document and survives unchanged
        assert!(output.message.contains("[9]"));
    }

    #[tokio::test]
    async fn test_interactive_replaces_session_items() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = SessionStore::new(temp_dir.path()).unwrap();
        sessions.start_session("s1");
        sessions.add_item("s1", DataItem::new("snomed_code", "11111111", "stale concept"));

        let agent = agent(vec![snomed_hit("59621000", "Essential hypertension")]);
        agent.process_interactive("hypertension", "s1", &mut sessions).await;

        let context = sessions.get("s1").unwrap();
        assert_eq!(context.len(), 1);
        assert!(context.current_data.contains_key("59621000"));
        assert!(!context.current_data.contains_key("11111111"));
    }

    #[tokio::test]
    async fn test_concept_details_exact_and_closest() {
        let hits = vec![snomed_hit("59621000", "Essential hypertension"), snomed_hit("38341003", "Hypertensive disorder")];
        let agent = agent(hits);

        let exact = agent.concept_details("38341003").await.unwrap();
        assert!(exact.exact);
        assert_eq!(exact.concept_name, "Hypertensive disorder");

        let closest = agent.concept_details("99999999").await.unwrap();
        assert!(!closest.exact);
        assert_eq!(closest.code, "59621000");
    }

    #[tokio::test]
    async fn test_concept_details_not_found() {
        let agent = agent(vec![]);
        let err = agent.concept_details("12345678").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
