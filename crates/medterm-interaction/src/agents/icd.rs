//! ICD-10 retrieval agent with interactive-session support.
//!
//! Searches the ICD index, answers through the LLM with `[CODE]` citations,
//! and handles relationship/hierarchy queries plus session modification
//! requests (add/remove/format/filter).

use std::sync::Arc;

use medterm_core::MedtermError;
use medterm_core::extract::{hits_from_json, hits_to_json};
use medterm_core::intent::{self, ModificationKind};
use medterm_core::relations;
use medterm_core::search::{SearchHit, SearchIndex, SearchRequest};
use medterm_core::session::{DataItem, SessionStore};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{error, info, warn};

use crate::agent::{AgentError, ChatModel, ChatRequest};
use crate::agents::AgentOutput;
use crate::prompts;
use crate::retry::{RetryPolicy, retry_with_backoff};

// An ICD code, possibly already bracketed as a citation
static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[?\b([A-Z]\d{2}(?:\.\d+)?)\b\]?").unwrap());

/// Agent querying the ICD terminology index.
pub struct IcdAgent {
    search: Arc<dyn SearchIndex>,
    model: Arc<dyn ChatModel>,
    retry: RetryPolicy,
    index: String,
    top_k: usize,
    semantic_config: String,
    temperature: f32,
    max_tokens: u32,
}

impl IcdAgent {
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
            semantic_config: "defaultSemanticConfig".to_string(),
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

    pub fn with_semantic_config(mut self, config: impl Into<String>) -> Self {
        self.semantic_config = config.into();
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Searches the ICD index and answers with cited codes.
    ///
    /// Relationship/hierarchy phrasings take a dedicated path; an empty
    /// result set degrades to a "nothing found" message.
    pub async fn process(&self, query: &str) -> Result<AgentOutput, MedtermError> {
        if intent::is_relationship_query(query) {
            return self.process_relationship_query(query).await;
        }

        let request = SearchRequest::new(&self.index, query)
            .with_top(self.top_k)
            .with_semantic_config(&self.semantic_config);
        let hits = self.search.search(&request).await?;

        if hits.is_empty() {
            return Ok(AgentOutput::message_only("No ICD codes found for your query."));
        }

        let context = format_search_context(&hits);
        let response = self
            .ask(prompts::ICD_SYSTEM_PROMPT, prompts::icd_user_prompt(query, &context))
            .await?;
        let response = normalize_citations(&response, &hits);

        Ok(AgentOutput::new(hits_to_json(&hits), response))
    }

    /// Processes a query with session support.
    ///
    /// Modification requests mutate the session; ordinary queries run the
    /// search and store each hit as a session item. Failures degrade to a
    /// user-facing message, never an error.
    pub async fn process_interactive(
        &self,
        query: &str,
        session_id: &str,
        sessions: &mut SessionStore,
    ) -> AgentOutput {
        sessions.start_session(session_id);

        if intent::is_modification_request(query) {
            return self.handle_modification(query, session_id, sessions).await;
        }

        match self.process(query).await {
            Err(err) => {
                error!("Interactive ICD processing failed: {err}");
                AgentOutput::message_only(format!("An error occurred: {err}"))
            }
            Ok(output) => {
                self.store_hits_in_session(&output.data, query, session_id, sessions);
                sessions.record_query(session_id, query);

                let mut message = output.message.clone();
                let summary = sessions.data_summary(session_id);
                if !summary.contains("No data currently loaded")
                    && !summary.contains("No active session")
                {
                    message.push_str("\n\n---\n");
                    message.push_str(&summary);
                    message.push_str(
                        "\n\nYou can ask me to add, remove, or modify this information. \
                         Try 'add SNOMED codes' or 'show these as a table'.",
                    );
                }

                AgentOutput::new(output.data, message)
            }
        }
    }

    async fn process_relationship_query(&self, query: &str) -> Result<AgentOutput, MedtermError> {
        let code = first_icd_code(query);
        let query_lower = query.to_lowercase();

        if let Some(code) = code {
            if ["parent", "child", "hierarchy"]
                .iter()
                .any(|w| query_lower.contains(w))
            {
                return self.search_hierarchy(&code, query).await;
            }
            if ["snomed", "mapping", "maps to"]
                .iter()
                .any(|w| query_lower.contains(w))
            {
                return self.search_snomed_mapping(&code, query).await;
            }
        }

        self.search_general_relationships(query).await
    }

    async fn search_hierarchy(&self, code: &str, query: &str) -> Result<AgentOutput, MedtermError> {
        let request = SearchRequest::new(&self.index, code).with_top(20);
        let hits = self.search.search(&request).await?;
        let hierarchy = relations::hierarchy_for(&hits, code);

        let data = serde_json::to_string(&hierarchy).unwrap_or_else(|_| "{}".to_string());
        if hierarchy.parents.is_empty() && hierarchy.children.is_empty() {
            return Ok(AgentOutput::new(
                data,
                format!("No parent-child relationships found for code {code}."),
            ));
        }

        let mut context = format!("Query Code: {code}\n");
        if !hierarchy.parents.is_empty() {
            context.push_str("\nParent Codes:\n");
            for parent in &hierarchy.parents {
                context.push_str(&format!("- {}: {} [{}]\n", parent.code, parent.label, parent.sab));
            }
        }
        if !hierarchy.children.is_empty() {
            context.push_str("\nChild Codes:\n");
            for child in &hierarchy.children {
                context.push_str(&format!("- {}: {} [{}]\n", child.code, child.label, child.sab));
            }
        }

        let response = self
            .ask(
                prompts::HIERARCHY_SYSTEM_PROMPT,
                prompts::hierarchy_user_prompt(query, &context),
            )
            .await?;
        Ok(AgentOutput::new(data, response))
    }

    async fn search_snomed_mapping(
        &self,
        code: &str,
        query: &str,
    ) -> Result<AgentOutput, MedtermError> {
        let request = SearchRequest::new(&self.index, code).with_top(self.top_k);
        let hits = self.search.search(&request).await?;
        let mappings = relations::snomed_mappings_for(&hits, code);

        if mappings.is_empty() {
            return Ok(AgentOutput::new(
                json!({"mappings": []}).to_string(),
                format!("No SNOMED mappings found for ICD code {code}."),
            ));
        }

        let mut context = String::from("SNOMED Mappings:\n\n");
        for mapping in &mappings {
            context.push_str(&format!(
                "ICD Code: {} - {}\nSNOMED Code: {} - {}\nRelationship: {}\n\n",
                mapping.icd_code,
                mapping.icd_label,
                mapping.snomed_code,
                mapping.snomed_label,
                mapping.relationship
            ));
        }

        let response = self
            .ask(
                prompts::MAPPING_SYSTEM_PROMPT,
                prompts::mapping_user_prompt(query, &context),
            )
            .await?;
        Ok(AgentOutput::new(json!({ "mappings": mappings }).to_string(), response))
    }

    async fn search_general_relationships(
        &self,
        query: &str,
    ) -> Result<AgentOutput, MedtermError> {
        let request = SearchRequest::new(&self.index, query).with_top(15);
        let hits = self.search.search(&request).await?;
        let with_relationships = relations::hits_with_relationships(&hits);

        if with_relationships.is_empty() {
            return Ok(AgentOutput::message_only("No relationship data found for your query."));
        }

        let mut context = String::from("Relationship Data:\n\n");
        for (hit, entries) in &with_relationships {
            context.push_str(&format!(
                "Code: {} - {}\n",
                hit.code().unwrap_or("N/A"),
                hit.label().unwrap_or("N/A")
            ));
            context.push_str("Relationships:\n");
            for entry in entries {
                context.push_str(&format!(
                    "  {}: {} - {} [{}]\n",
                    entry.rel, entry.code, entry.label, entry.sab
                ));
            }
            context.push('\n');
        }

        let rel_hits: Vec<&SearchHit> = with_relationships.iter().map(|(hit, _)| *hit).collect();
        let data = serde_json::to_string(&rel_hits).unwrap_or_else(|_| "[]".to_string());

        let response = self
            .ask(
                prompts::RELATIONSHIP_SYSTEM_PROMPT,
                prompts::relationship_user_prompt(query, &context),
            )
            .await?;
        Ok(AgentOutput::new(data, response))
    }

    async fn handle_modification(
        &self,
        query: &str,
        session_id: &str,
        sessions: &mut SessionStore,
    ) -> AgentOutput {
        let data_types = intent::extract_data_types(query);

        let message = match intent::detect_modification_kind(query) {
            ModificationKind::Add => self.handle_add(query, session_id, &data_types, sessions).await,
            ModificationKind::Remove => handle_remove(query, session_id, &data_types, sessions),
            ModificationKind::Format => handle_format(query, session_id, sessions),
            ModificationKind::Filter => handle_filter(session_id, &data_types, sessions),
            ModificationKind::Other => handle_general(session_id, sessions),
        };

        AgentOutput::message_only(message)
    }

    /// Adds SNOMED mappings for the session's current ICD codes.
    async fn handle_add(
        &self,
        query: &str,
        session_id: &str,
        data_types: &[String],
        sessions: &mut SessionStore,
    ) -> String {
        if data_types.iter().any(|t| t == "snomed_code") {
            let current_icds: Vec<(String, String)> = sessions
                .items_by_type(session_id, "icd_code")
                .iter()
                .map(|item| (item.key.clone(), item.value.clone()))
                .collect();

            if current_icds.is_empty() {
                return "I can add SNOMED mappings once ICD codes are loaded in this session. \
                        Search for a condition first (e.g. 'find diabetes ICD codes'), \
                        then ask me to 'add SNOMED codes'."
                    .to_string();
            }

            let mut lines = vec!["**Adding SNOMED mappings for current ICD codes:**\n".to_string()];
            for (icd_code, icd_label) in current_icds {
                let request = SearchRequest::new(&self.index, &icd_code).with_top(self.top_k);
                let mappings = match self.search.search(&request).await {
                    Ok(hits) => relations::snomed_mappings_for(&hits, &icd_code),
                    Err(err) => {
                        warn!("SNOMED mapping lookup failed for {icd_code}: {err}");
                        lines.push(format!("**{icd_code}:** Error retrieving SNOMED mappings"));
                        continue;
                    }
                };

                if mappings.is_empty() {
                    lines.push(format!("**{icd_code}:** No SNOMED mappings found"));
                    continue;
                }

                lines.push(format!("**{icd_code} - {icd_label}:**"));
                for mapping in mappings.into_iter().take(3) {
                    let item = DataItem::new(
                        "snomed_code",
                        &mapping.snomed_code,
                        &mapping.snomed_label,
                    )
                    .with_metadata("relationship", json!(mapping.relationship))
                    .with_metadata("linked_icd", json!(icd_code))
                    .with_source_query(query);
                    sessions.add_item(session_id, item);

                    lines.push(format!(
                        "  - SNOMED {}: {}",
                        mapping.snomed_code, mapping.snomed_label
                    ));
                }
                lines.push(String::new());
            }

            return lines.join("\n");
        }

        if !data_types.is_empty() {
            return format!(
                "I can help you add {} information. For example: \
                 'add SNOMED codes' for the current results, or \
                 'add descriptions for I10 and I21'.",
                data_types.join(", ")
            );
        }

        "I can add medical coding information to the current session. \
         Let me know what you'd like to add (e.g. 'SNOMED codes' or 'descriptions for I10')."
            .to_string()
    }

    fn store_hits_in_session(
        &self,
        data: &str,
        query: &str,
        session_id: &str,
        sessions: &mut SessionStore,
    ) {
        let hits = hits_from_json(data);
        let mut stored = 0;
        for hit in &hits {
            let (Some(code), Some(label)) = (hit.code(), hit.label()) else {
                continue;
            };
            let item = DataItem::new("icd_code", code, label)
                .with_metadata("score", json!(hit.score))
                .with_metadata("document_id", json!(hit.doc_id().unwrap_or(code)))
                .with_metadata("full_document", hit.document.clone())
                .with_source_query(query);
            if sessions.add_item(session_id, item) {
                stored += 1;
            }
        }
        if stored > 0 {
            info!("Stored {stored} ICD codes in session {session_id}");
        }
    }

    async fn ask(&self, system: &str, user: String) -> Result<String, MedtermError> {
        let request = ChatRequest::system_user(system, user)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        let response = self.complete_with_retry(request).await?;
        Ok(response)
    }

    async fn complete_with_retry(&self, request: ChatRequest) -> Result<String, AgentError> {
        retry_with_backoff(&self.retry, || self.model.complete(request.clone())).await
    }
}

/// Formats hits into the LLM context block.
fn format_search_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "Document ID: {}\nTitle: {}\nContent: {}\nRelevance Score: {:.3}\n",
                hit.doc_id().unwrap_or("Unknown"),
                hit.field_str("title").or_else(|| hit.label()).unwrap_or(""),
                hit.field_str("content").unwrap_or(""),
                hit.score
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Brackets ICD codes that appear in the hits; other codes stay untouched.
///
/// Already-bracketed citations are left as they are, so the pass is
/// idempotent.
fn normalize_citations(response: &str, hits: &[SearchHit]) -> String {
    let valid_ids: std::collections::HashSet<&str> =
        hits.iter().filter_map(|hit| hit.doc_id()).collect();

    CITATION_RE
        .replace_all(response, |caps: &regex::Captures<'_>| {
            let code = &caps[1];
            if valid_ids.contains(code) {
                format!("[{code}]")
            } else {
                caps[0].to_string()
            }
        })
        .to_string()
}

/// First ICD-shaped token in the utterance, if any.
fn first_icd_code(query: &str) -> Option<String> {
    intent::extract_code_tokens(query)
        .into_iter()
        .find(|code| code.chars().next().is_some_and(|c| c.is_ascii_alphabetic()))
}

fn handle_remove(
    query: &str,
    session_id: &str,
    data_types: &[String],
    sessions: &mut SessionStore,
) -> String {
    let codes = intent::extract_code_tokens(query);
    let by_type_keys: Vec<String> = match sessions.get(session_id) {
        None => return "No data in current session to remove.".to_string(),
        Some(context) if context.is_empty() => {
            return "No data in current session to remove.".to_string();
        }
        Some(context) => context
            .current_data
            .values()
            .filter(|item| data_types.contains(&item.item_type))
            .map(|item| item.key.clone())
            .collect(),
    };

    let mut removed = Vec::new();
    for code in &codes {
        if sessions.remove_item(session_id, code) {
            removed.push(code.clone());
        }
    }

    // No explicit codes matched: fall back to removal by data type
    if removed.is_empty() && !data_types.is_empty() {
        for key in by_type_keys {
            if sessions.remove_item(session_id, &key) {
                removed.push(key);
            }
        }
    }

    if removed.is_empty() {
        "No items were removed. Please specify codes or data types to remove.".to_string()
    } else {
        format!(
            "Removed {} item(s): {}\n\n{}",
            removed.len(),
            removed.join(", "),
            sessions.data_summary(session_id)
        )
    }
}

fn handle_format(query: &str, session_id: &str, sessions: &SessionStore) -> String {
    let query_lower = query.to_lowercase();
    if query_lower.contains("json") {
        format!("**Data as JSON:**\n```json\n{}\n```", sessions.as_json(session_id))
    } else if query_lower.contains("table") {
        format!("**Data as Table:**\n\n{}", sessions.as_markdown_table(session_id))
    } else {
        sessions.data_summary(session_id)
    }
}

fn handle_filter(session_id: &str, data_types: &[String], sessions: &SessionStore) -> String {
    if data_types.is_empty() {
        return "Please specify what type of data to filter \
                (e.g. 'only show ICD codes' or 'just SNOMED codes')."
            .to_string();
    }

    let mut lines = vec!["**Filtered Data:**\n".to_string()];
    for data_type in data_types {
        let items = sessions.items_by_type(session_id, data_type);
        if items.is_empty() {
            lines.push(format!("No {}s found in session.", data_type.replace('_', " ")));
        } else {
            lines.push(format!("**{}s:**", data_type.replace('_', " ")));
            for item in items {
                lines.push(format!("- {}: {}", item.key, item.value));
            }
            lines.push(String::new());
        }
    }
    lines.join("\n")
}

fn handle_general(session_id: &str, sessions: &SessionStore) -> String {
    let summary = sessions.data_summary(session_id);
    let help = "\n**Available Interactive Commands:**\n\n\
        Add information: 'add SNOMED codes', 'include descriptions'\n\
        Remove information: 'remove I10', 'remove SNOMED codes'\n\
        Format data: 'show these as a table', 'format as JSON'\n\
        Filter data: 'only show ICD codes', 'just SNOMED codes'\n";
    format!("{summary}\n{help}")
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

    struct EchoModel;

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn complete(&self, _request: ChatRequest) -> Result<String, AgentError> {
            Ok("The most relevant code is I10 for this query.".to_string())
        }
    }

    fn icd_hit(code: &str, label: &str, score: f64) -> SearchHit {
        SearchHit::new(score, json!({"id": code, "CODE": code, "STR": label}))
    }

    fn agent(hits: Vec<SearchHit>) -> IcdAgent {
        IcdAgent::new(
            Arc::new(CannedSearch { hits }),
            Arc::new(EchoModel),
            "pcornet-icd-index",
        )
        .with_retry(RetryPolicy::new(0, std::time::Duration::from_millis(1)))
    }

    #[test]
    fn test_normalize_citations_brackets_valid_codes_only() {
        let hits = vec![icd_hit("I10", "Essential hypertension", 2.0)];
        let response = "Consider I10 but not E99 or [I10] again.";

        let normalized = normalize_citations(response, &hits);
        assert_eq!(normalized, "Consider [I10] but not E99 or [I10] again.");
    }

    #[test]
    fn test_first_icd_code_skips_snomed_tokens() {
        assert_eq!(first_icd_code("map 73211009 and E11.9"), Some("E11.9".to_string()));
        assert_eq!(first_icd_code("nothing numeric"), None);
    }

    #[tokio::test]
    async fn test_process_empty_results() {
        let output = agent(vec![]).process("rare condition").await.unwrap();
        assert_eq!(output.data, "[]");
        assert!(output.message.contains("No ICD codes found"));
    }

    #[tokio::test]
    async fn test_process_interactive_stores_hits_and_appends_summary() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = SessionStore::new(temp_dir.path()).unwrap();
        let agent = agent(vec![icd_hit("I10", "Essential hypertension", 2.0)]);

        let output = agent
            .process_interactive("find hypertension codes", "s1", &mut sessions)
            .await;

        assert!(output.message.contains("[I10]"));
        assert!(output.message.contains("Current Data in Session"));
        let context = sessions.get("s1").unwrap();
        assert!(context.current_data.contains_key("I10"));
        assert_eq!(context.query_history.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_request_with_code_token() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = SessionStore::new(temp_dir.path()).unwrap();
        let agent = agent(vec![icd_hit("I10", "Essential hypertension", 2.0)]);
        agent.process_interactive("find hypertension codes", "s1", &mut sessions).await;

        let output = agent.process_interactive("remove I10", "s1", &mut sessions).await;

        assert!(output.message.contains("Removed 1 item(s): I10"));
        assert!(sessions.get("s1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_with_empty_session_is_a_message_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = SessionStore::new(temp_dir.path()).unwrap();
        let agent = agent(vec![]);

        let output = agent.process_interactive("remove I10", "s1", &mut sessions).await;
        assert_eq!(output.message, "No data in current session to remove.");
    }

    #[tokio::test]
    async fn test_remove_by_data_type() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = SessionStore::new(temp_dir.path()).unwrap();
        sessions.start_session("s1");
        sessions.add_item("s1", DataItem::new("icd_code", "I10", "Hypertension"));
        sessions.add_item("s1", DataItem::new("snomed_code", "59621000", "Hypertension (disorder)"));
        let agent = agent(vec![]);

        let output = agent.process_interactive("remove snomed codes", "s1", &mut sessions).await;

        assert!(output.message.contains("Removed 1 item(s): 59621000"));
        assert!(sessions.get("s1").unwrap().current_data.contains_key("I10"));
    }

    #[tokio::test]
    async fn test_add_snomed_mappings_from_ohdsi() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = SessionStore::new(temp_dir.path()).unwrap();
        sessions.start_session("s1");
        sessions.add_item("s1", DataItem::new("icd_code", "I10", "Essential hypertension"));

        let mapping_hit = SearchHit::new(
            1.0,
            json!({
                "CODE": "I10",
                "STR": "Essential hypertension",
                "OHDSI": {"maps": [{"vocabulary_id": "SNOMED", "concept_code": "59621000", "concept_name": "Essential hypertension (disorder)"}]}
            }),
        );
        let agent = agent(vec![mapping_hit]);

        let output = agent.process_interactive("add SNOMED codes", "s1", &mut sessions).await;

        assert!(output.message.contains("SNOMED 59621000"));
        let context = sessions.get("s1").unwrap();
        assert!(context.current_data.contains_key("59621000"));
        assert_eq!(context.current_data["59621000"].item_type, "snomed_code");
    }

    #[tokio::test]
    async fn test_format_request_renders_table() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = SessionStore::new(temp_dir.path()).unwrap();
        sessions.start_session("s1");
        sessions.add_item("s1", DataItem::new("icd_code", "I10", "Hypertension"));
        let agent = agent(vec![]);

        let output = agent
            .process_interactive("format these as table", "s1", &mut sessions)
            .await;
        assert!(output.message.contains("| Type | Key | Value | Added At |"));
    }

    #[tokio::test]
    async fn test_hierarchy_query_without_relationship_data() {
        let agent = agent(vec![icd_hit("I10", "Essential hypertension", 2.0)]);
        let output = agent.process("what is the parent code of I10?").await.unwrap();
        assert!(output.message.contains("No parent-child relationships found for code I10"));
    }

    #[tokio::test]
    async fn test_hierarchy_query_with_rel_data() {
        let hit = SearchHit::new(
            1.0,
            json!({
                "CODE": "I10",
                "STR": "Essential hypertension",
                "REL": [{"REL": "PAR", "CODE": "I10-I16", "STR": "Hypertensive diseases", "SAB": "ICD10CM"}]
            }),
        );
        let agent = agent(vec![hit]);

        let output = agent.process("show the hierarchy for I10").await.unwrap();
        assert!(output.data.contains("I10-I16"));
    }
}
