//! General-purpose conversational agent.

use std::sync::Arc;

use medterm_core::text::strip_html_keep_newlines;
use tracing::error;

use crate::agent::{AgentError, ChatModel, ChatRequest};
use crate::prompts;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Token cap for concept-set rebuilds; the tables can run to thousands of
/// tokens once SNOMED mappings are included.
const MODIFICATION_MAX_TOKENS: u32 = 8000;
const MODIFICATION_TEMPERATURE: f32 = 0.3;

/// Conversational agent, optionally grounded in session context.
pub struct ChatAgent {
    model: Arc<dyn ChatModel>,
    retry: RetryPolicy,
    temperature: f32,
    max_tokens: u32,
}

impl ChatAgent {
    pub fn new(model: Arc<dyn ChatModel>, retry: RetryPolicy, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model,
            retry,
            temperature,
            max_tokens,
        }
    }

    /// Answers a chat message, grounding it in session context when given.
    ///
    /// Failures degrade to an error message instead of propagating; the
    /// response is scrubbed of stray HTML either way.
    pub async fn process(&self, user_input: &str, context: Option<&str>) -> String {
        let system = match context {
            Some(context) => {
                // Rough code count for the prompt: one bracketed key per item
                let code_count = context.matches('[').count();
                prompts::chat_context_system_prompt(context, code_count)
            }
            None => prompts::CHAT_SYSTEM_PROMPT.to_string(),
        };

        let request = ChatRequest::system_user(system, user_input)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        match self.complete_with_retry(request).await {
            Ok(response) => strip_html_keep_newlines(&response),
            Err(err) => {
                error!("Chat agent failed: {err}");
                format!("Error: {err}")
            }
        }
    }

    /// Formats extracted concept records per the user's original request.
    pub async fn format_concept_set(&self, original_query: &str, context_data: &str) -> String {
        let request = ChatRequest::user(prompts::formatting_prompt(original_query, context_data))
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        match self.complete_with_retry(request).await {
            Ok(response) => response,
            Err(err) => {
                error!("Concept set formatting failed: {err}");
                format!("Error formatting the concept set: {err}")
            }
        }
    }

    /// Rebuilds a concept-set table after a modification request.
    ///
    /// Runs with a much higher token cap than ordinary chat so large tables
    /// are never truncated. Errors propagate so the caller can phrase the
    /// degradation message.
    pub async fn rebuild_concept_set(
        &self,
        original_query: &str,
        raw_data: &str,
        request_text: &str,
    ) -> Result<String, AgentError> {
        let system = prompts::modification_prompt(original_query, raw_data, request_text);
        let request = ChatRequest::system_user(system, request_text)
            .with_temperature(MODIFICATION_TEMPERATURE)
            .with_max_tokens(MODIFICATION_MAX_TOKENS);

        self.complete_with_retry(request).await
    }

    async fn complete_with_retry(&self, request: ChatRequest) -> Result<String, AgentError> {
        retry_with_backoff(&self.retry, || self.model.complete(request.clone())).await
    }
}
