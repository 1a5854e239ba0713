//! Chat-completion abstraction and its error type.

use std::time::Duration;

use async_trait::async_trait;
use medterm_core::MedtermError;
use medterm_core::history::{ChatTurn, MessageRole};
use thiserror::Error;

/// Errors produced by LLM backends.
///
/// `Process` carries enough structure for the retry wrapper to decide
/// whether (and how long) to wait before retrying.
#[derive(Error, Debug)]
pub enum AgentError {
    /// HTTP-level failure with retry metadata
    #[error("{message}")]
    Process {
        status_code: Option<u16>,
        message: String,
        is_retryable: bool,
        retry_after: Option<Duration>,
    },

    /// The backend answered but the response was unusable
    #[error("Agent execution failed: {0}")]
    ExecutionFailed(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Creates a `Process` error with an explicit retry-after delay.
    pub fn process_error_with_retry_after(
        status_code: u16,
        message: impl Into<String>,
        is_retryable: bool,
        retry_after: Duration,
    ) -> Self {
        Self::Process {
            status_code: Some(status_code),
            message: message.into(),
            is_retryable,
            retry_after: Some(retry_after),
        }
    }

    /// Whether retrying this error may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Process {
                is_retryable: true,
                ..
            }
        )
    }

    /// Server-suggested delay before the next attempt, when provided.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Process { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status of the failed call, when known.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Process { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

impl From<AgentError> for MedtermError {
    fn from(err: AgentError) -> Self {
        MedtermError::llm(err.to_string())
    }
}

/// One chat-completion request: role-tagged messages plus sampling knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatTurn>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatTurn>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// A single user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(vec![ChatTurn::user(content)])
    }

    /// A system prompt followed by a user message.
    pub fn system_user(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(vec![ChatTurn::system(system), ChatTurn::user(user)])
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// The wire name of a role.
    pub fn role_name(role: MessageRole) -> &'static str {
        match role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Sends the request and returns the assistant's text.
    async fn complete(&self, request: ChatRequest) -> Result<String, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        let retryable = AgentError::Process {
            status_code: Some(429),
            message: "rate limited".into(),
            is_retryable: true,
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(retryable.is_retryable());
        assert_eq!(retryable.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(retryable.status_code(), Some(429));

        let fatal = AgentError::ExecutionFailed("bad payload".into());
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.retry_after(), None);
    }

    #[test]
    fn test_request_builders() {
        let request = ChatRequest::system_user("be terse", "hello")
            .with_temperature(0.0)
            .with_max_tokens(5);

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, MessageRole::System);
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(5));
    }
}
