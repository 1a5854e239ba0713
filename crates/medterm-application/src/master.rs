//! The master agent: routes queries to specialized agents, reuses session
//! state for follow-ups, and runs the concept-set workflow.
//!
//! Control flow per chat turn is linear: classify, retrieve (or reuse the
//! cached/session data), format via the LLM, store, return. All state is
//! owned by this struct and injected at construction; there are no globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use medterm_core::concept_set::{ConceptSetCache, ConceptSetEntry, TargetResolution, is_concept_set_followup};
use medterm_core::config::AppConfig;
use medterm_core::extract;
use medterm_core::history::{ConversationHistory, HistoryStats};
use medterm_core::intent::{self, AgentKind, KeywordClassifier, QueryClassifier};
use medterm_core::relevance::{RelevanceFilter, TextEmbedder};
use medterm_core::search::SearchIndex;
use medterm_core::session::{CleanupStats, DataItem, SessionStore};
use medterm_core::text::clean_html_tags;
use medterm_interaction::agent::{ChatModel, ChatRequest};
use medterm_interaction::agents::{ChatAgent, IcdAgent, SnomedAgent};
use medterm_interaction::prompts;
use medterm_interaction::retry::{RetryPolicy, retry_with_backoff};

/// Central agent routing user queries to specialized sub-agents.
pub struct MasterAgent {
    config: AppConfig,
    model: Arc<dyn ChatModel>,
    classifier: Box<dyn QueryClassifier>,
    chat_agent: ChatAgent,
    icd_agent: IcdAgent,
    snomed_agent: SnomedAgent,
    relevance: Option<RelevanceFilter>,
    sessions: SessionStore,
    history: ConversationHistory,
    concept_sets: ConceptSetCache,
    retry: RetryPolicy,
    current_session_id: Option<String>,
}

impl MasterAgent {
    /// Wires up the agents and state stores from configuration.
    ///
    /// `embedder` is optional: without one, relevance filtering degrades to
    /// passing all session items through.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage directories cannot be created.
    pub fn new(
        config: AppConfig,
        model: Arc<dyn ChatModel>,
        search: Arc<dyn SearchIndex>,
        embedder: Option<Arc<dyn TextEmbedder>>,
    ) -> Result<Self> {
        let sessions = SessionStore::new(config.sessions_dir())
            .context("Failed to initialize session store")?;

        let mut history =
            ConversationHistory::new(config.max_history_messages, config.history_file())
                .context("Failed to initialize conversation history")?;
        if let Err(err) = history.load() {
            warn!("Could not load previous conversation history: {err:#}");
        }

        let retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_secs(config.retry_initial_delay_secs),
        );

        let chat_agent = ChatAgent::new(
            model.clone(),
            retry,
            config.agent_temperature,
            config.agent_max_tokens,
        );
        let icd_agent = IcdAgent::new(search.clone(), model.clone(), &config.icd_index)
            .with_retry(retry)
            .with_top_k(config.search_top_k)
            .with_semantic_config(&config.semantic_config)
            .with_sampling(config.agent_temperature, config.agent_max_tokens);
        let snomed_agent = SnomedAgent::new(search, model.clone(), &config.snomed_index)
            .with_retry(retry)
            .with_top_k(config.search_top_k)
            .with_sampling(config.agent_temperature, config.agent_max_tokens);

        let relevance = embedder
            .map(|embedder| RelevanceFilter::new(embedder, config.relevance_threshold));
        if relevance.is_none() {
            info!("No embedder configured; relevance filtering disabled");
        }

        Ok(Self {
            config,
            model,
            classifier: Box::new(KeywordClassifier),
            chat_agent,
            icd_agent,
            snomed_agent,
            relevance,
            sessions,
            history,
            concept_sets: ConceptSetCache::new(),
            retry,
            current_session_id: None,
        })
    }

    /// Swaps the routing policy (used by tests and alternative deployments).
    pub fn with_classifier(mut self, classifier: Box<dyn QueryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Processes one chat turn for a session.
    ///
    /// `agent` forces a specific agent; `None` auto-classifies. All failure
    /// modes degrade to a user-facing message.
    pub async fn chat(&mut self, query: &str, agent: Option<AgentKind>, session_id: &str) -> String {
        // Chat switching: persist the previous session before activating the new one
        if self.current_session_id.as_deref() != Some(session_id) {
            info!(
                "Chat switch detected: {:?} -> {session_id}",
                self.current_session_id
            );
            if let Some(previous) = self.current_session_id.take() {
                if self.sessions.get(&previous).is_some() {
                    if let Err(err) = self.sessions.save(&previous) {
                        warn!("Failed to save session {previous} before switching: {err:#}");
                    }
                }
            }
            self.sessions.set_active(session_id);
            self.current_session_id = Some(session_id.to_string());
        }

        self.history.add_user_message(query);

        let agent_kind = match agent {
            Some(kind) => kind,
            None => {
                let kind = self.classifier.classify(query);
                info!("Agent classification: '{query}' -> {kind}");
                kind
            }
        };

        let has_session_data = self
            .sessions
            .get(session_id)
            .map(|context| !context.is_empty())
            .unwrap_or(false);

        // Follow-up questions reuse stored session data through the chat
        // agent; this lets format changes like "show as table" work without
        // a fresh search.
        let mut concept_set_verdict: Option<bool> = None;
        if has_session_data {
            let explicit_new_search = intent::is_explicit_new_search(query);
            let is_concept_set = self.is_concept_set_query(query).await;
            concept_set_verdict = Some(is_concept_set);
            debug!(
                "Follow-up check: explicit_new_search={explicit_new_search}, is_concept_set={is_concept_set}"
            );

            if !explicit_new_search && !is_concept_set {
                if let Some(context) = self.session_context(session_id, Some(query)).await {
                    info!("Follow-up confirmed: answering from session context");
                    let response = self.chat_agent.process(query, Some(&context)).await;
                    self.history.add_assistant_message(&response, AgentKind::Chat);
                    return response;
                }
                warn!("Follow-up detected but no context available");
            }
        }

        // Step 1: concept set query starts the workflow
        let is_concept_set = match concept_set_verdict {
            Some(verdict) => verdict,
            None => self.is_concept_set_query(query).await,
        };
        if is_concept_set {
            info!("Concept set query detected, starting workflow");
            let response = self.concept_set_workflow(query, session_id).await;
            self.history
                .add_assistant_message(&response, AgentKind::ConceptSet);
            return response;
        }

        // Step 2: follow-up modification of an existing concept set; only
        // consulted when the cache is non-empty to avoid false positives
        if !self.concept_sets.is_empty(session_id) && is_concept_set_followup(query) {
            info!("Concept set follow-up detected");
            let response = self.handle_concept_set_followup(query, session_id).await;
            self.history
                .add_assistant_message(&response, AgentKind::ConceptSetFollowup);
            return response;
        }

        // Standard routing
        match agent_kind {
            AgentKind::Icd => {
                let output = self
                    .icd_agent
                    .process_interactive(query, session_id, &mut self.sessions)
                    .await;
                self.history
                    .add_assistant_message(&output.message, AgentKind::Icd);
                output.message
            }
            AgentKind::Snomed => {
                let output = self
                    .snomed_agent
                    .process_interactive(query, session_id, &mut self.sessions)
                    .await;
                self.history
                    .add_assistant_message(&output.message, AgentKind::Snomed);
                output.message
            }
            _ => {
                let context = if has_session_data {
                    self.session_context(session_id, Some(query)).await
                } else {
                    None
                };
                let response = self.chat_agent.process(query, context.as_deref()).await;
                self.history.add_assistant_message(&response, AgentKind::Chat);
                response
            }
        }
    }

    /// Classifies concept-set intent with a tiny LLM call.
    ///
    /// Classification failure means "not a concept set" rather than an
    /// error surfaced to the user.
    async fn is_concept_set_query(&self, query: &str) -> bool {
        let request = ChatRequest::user(prompts::classification_prompt(query))
            .with_temperature(0.0)
            .with_max_tokens(5);

        match retry_with_backoff(&self.retry, || self.model.complete(request.clone())).await {
            Ok(response) => {
                let verdict = response.trim().to_lowercase();
                debug!("Concept set classification for '{query}': {verdict}");
                verdict.contains("true")
            }
            Err(err) => {
                error!("LLM classification failed: {err}");
                false
            }
        }
    }

    /// Builds the session context string for the chat agent, relevance-
    /// filtered against the query when an embedder is configured.
    ///
    /// Every stored document field rides along (OHDSI mappings, SAB, the
    /// rest), HTML-cleaned for display. Returns `None` when the session has
    /// no (relevant) data.
    async fn session_context(&self, session_id: &str, query: Option<&str>) -> Option<String> {
        let context = self.sessions.get(session_id)?;
        if context.is_empty() {
            debug!("No context data found in session {session_id}");
            return None;
        }

        let all_items: Vec<DataItem> = context.current_data.values().cloned().collect();
        let total = all_items.len();

        let relevant = match (query, &self.relevance) {
            (Some(query), Some(filter)) => {
                let filtered = filter.filter(query, all_items).await;
                info!(
                    "Semantic filtering: {total} total -> {} relevant (threshold {})",
                    filtered.len(),
                    filter.threshold()
                );
                filtered
            }
            _ => {
                debug!("No query filter - including all {total} session items");
                all_items
            }
        };

        if relevant.is_empty() {
            return None;
        }

        let lines: Vec<String> = relevant.iter().map(format_context_item).collect();
        Some(lines.join("\n\n"))
    }

    /// Extracts the primary condition and expands it to related terms,
    /// joined into a disjunctive search query.
    ///
    /// Falls back to the bare extraction, then to the raw query.
    async fn extract_and_expand(&self, query: &str) -> String {
        let extraction = ChatRequest::user(prompts::condition_extraction_prompt(query))
            .with_temperature(0.0)
            .with_max_tokens(20);
        let primary =
            match retry_with_backoff(&self.retry, || self.model.complete(extraction.clone())).await
            {
                Ok(response) => response.trim().to_lowercase(),
                Err(err) => {
                    warn!("Condition extraction failed, using raw query: {err}");
                    return query.to_string();
                }
            };
        info!("Extracted primary condition: '{primary}'");

        let expansion = ChatRequest::user(prompts::condition_expansion_prompt(&primary))
            .with_temperature(0.3)
            .with_max_tokens(150);
        match retry_with_backoff(&self.retry, || self.model.complete(expansion.clone())).await {
            Ok(expanded) => {
                let terms: Vec<String> = expanded
                    .split(',')
                    .map(|term| term.trim().to_lowercase())
                    .filter(|term| !term.is_empty())
                    .collect();
                if terms.is_empty() {
                    return primary;
                }
                info!(
                    "Expanded to {} related terms: {}",
                    terms.len(),
                    terms.join(", ")
                );
                terms.join(" OR ")
            }
            Err(err) => {
                warn!("Condition expansion failed, using primary condition: {err}");
                primary
            }
        }
    }

    /// Runs the multi-step concept-set workflow.
    async fn concept_set_workflow(&mut self, query: &str, session_id: &str) -> String {
        // Step 0: expand the medical query to related conditions
        let expanded = self.extract_and_expand(query).await;
        info!("Workflow searching with expanded query: '{expanded}'");

        // Step 1: ICD search over the expanded query
        let icd_result = match self.icd_agent.process(&expanded).await {
            Ok(output) => output,
            Err(err) => return format!("Error during ICD search: {err}"),
        };

        // Step 2+3: flatten raw hits into concept records
        let extracted = match extract::extract_concept_records(&icd_result.data) {
            Ok(records) => records,
            Err(err) => return format!("Error during data extraction: {err}"),
        };

        // Step 4: format the final response
        let formatted = self.chat_agent.format_concept_set(query, &extracted).await;

        // Step 5: cache the concept set for follow-up queries
        let name = expanded
            .split(" OR ")
            .next()
            .unwrap_or(&expanded)
            .to_string();
        self.concept_sets.store(
            session_id,
            ConceptSetEntry::new(name, extracted, formatted.clone(), query),
        );

        formatted
    }

    /// Applies a follow-up modification to a cached concept set.
    async fn handle_concept_set_followup(&self, query: &str, session_id: &str) -> String {
        match self.concept_sets.resolve_target(session_id, query) {
            TargetResolution::Empty => {
                "No concept set found to modify. Please create a concept set first.".to_string()
            }
            TargetResolution::NeedsClarification(names) => {
                let listing = names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| format!("{}. {name}", i + 1))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "I found {} concept sets in this session:\n\n{listing}\n\n\
                     Please specify which one you'd like to modify by mentioning the \
                     condition name, or say \"the most recent one\".",
                    names.len()
                )
            }
            TargetResolution::Resolved(target) => {
                info!(
                    "Processing follow-up for concept set '{}' ({} chars of data)",
                    target.name,
                    target.raw_data.len()
                );
                match self
                    .chat_agent
                    .rebuild_concept_set(&target.query, &target.raw_data, query)
                    .await
                {
                    Ok(response) => {
                        info!("Generated modified table ({} chars)", response.len());
                        response
                    }
                    Err(err) => {
                        error!("Failed to generate modified table: {err}");
                        format!(
                            "Unable to generate the modified table right now. \
                             Please try again in a moment.\n\nError: {err}"
                        )
                    }
                }
            }
        }
    }

    /// System information for diagnostics.
    pub fn info(&self) -> Value {
        json!({
            "endpoint": self.config.openai_endpoint,
            "deployment": self.config.chat_deployment,
            "api_version": self.config.openai_api_version,
            "specialized_agents": ["chat", "icd", "snomed"],
        })
    }

    /// Status of all agents.
    pub fn agent_status(&self) -> Value {
        json!({
            "master_agent": "active",
            "specialized_agents": {
                "chat": "active",
                "icd": "active",
                "snomed": "active",
            },
        })
    }

    /// Conversation history statistics.
    pub fn history_stats(&self) -> HistoryStats {
        self.history.stats()
    }

    /// Read access to the session store (listings, stats).
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Clears the in-memory conversation history.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Prunes old session files and evicts excess in-memory sessions using
    /// the configured limits.
    pub fn cleanup_sessions(&mut self) -> CleanupStats {
        self.sessions.cleanup(
            self.config.session_max_age_days,
            self.config.session_max_in_memory,
        )
    }

    /// Saves histories and sessions; failures are logged, never raised.
    pub fn shutdown(&mut self) {
        info!("Shutting down master agent");
        if let Err(err) = self.history.save() {
            warn!("Failed to save conversation history: {err:#}");
        }
        self.sessions.save_all();
        info!("Master agent shutdown complete");
    }
}

/// Renders one session item (with all its document fields) for the LLM.
fn format_context_item(item: &DataItem) -> String {
    let mut line = format!("[{}] {}", item.key, item.value);

    if item.metadata.contains_key("source") {
        if let Ok(metadata) = serde_json::to_string(&item.metadata) {
            line.push_str(&format!("\n  metadata: {metadata}"));
        }
    }

    if let Some(Value::Object(document)) = item.metadata.get("full_document") {
        if let Some(ohdsi) = document.get("OHDSI") {
            if !ohdsi.is_null() {
                line.push_str(&format!(
                    "\n  OHDSI: {}",
                    clean_html_tags(&value_display(ohdsi))
                ));
            }
        }
        if let Some(sab) = document.get("SAB").and_then(Value::as_str) {
            line.push_str(&format!("\n  SAB: {sab}"));
        }
        for (field, value) in document {
            if matches!(field.as_str(), "CODE" | "STR" | "id" | "OHDSI" | "SAB") || value.is_null()
            {
                continue;
            }
            line.push_str(&format!(
                "\n  {field}: {}",
                clean_html_tags(&value_display(value))
            ));
        }
    }

    line
}

fn value_display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
