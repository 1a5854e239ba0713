//! Azure OpenAI clients - direct REST implementations for chat completions
//! and embeddings.
//!
//! Both clients hit deployment-scoped endpoints with an `api-key` header;
//! no SDK dependency.

use std::time::Duration;

use async_trait::async_trait;
use medterm_core::MedtermError;
use medterm_core::config::AppConfig;
use medterm_core::relevance::TextEmbedder;
use reqwest::{Client, StatusCode, header::HeaderValue};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentError, ChatModel, ChatRequest};

/// Chat-completion client for an Azure OpenAI deployment.
#[derive(Clone)]
pub struct AzureOpenAIChat {
    client: Client,
    endpoint: String,
    api_key: String,
    api_version: String,
    deployment: String,
}

impl AzureOpenAIChat {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: trim_endpoint(endpoint.into()),
            api_key: api_key.into(),
            api_version: api_version.into(),
            deployment: deployment.into(),
        }
    }

    /// Builds the client from the application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.openai_endpoint,
            &config.openai_api_key,
            &config.openai_api_version,
            &config.chat_deployment,
        )
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    async fn send_request(&self, body: &ChatCompletionRequest) -> Result<String, AgentError> {
        let response = self
            .client
            .post(self.url())
            .header("api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|err| AgentError::Process {
                status_code: None,
                message: format!("Chat completion request failed: {err}"),
                is_retryable: err.is_connect() || err.is_timeout(),
                retry_after: None,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = parse_retry_after(response.headers().get("retry-after"));
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(map_http_error(status, body_text, retry_after));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| AgentError::Other(format!("Failed to parse chat response: {err}")))?;

        extract_text_response(parsed)
    }
}

#[async_trait]
impl ChatModel for AzureOpenAIChat {
    async fn complete(&self, request: ChatRequest) -> Result<String, AgentError> {
        let messages = request
            .messages
            .iter()
            .map(|turn| WireMessage {
                role: ChatRequest::role_name(turn.role),
                content: turn.content.clone(),
            })
            .collect();

        let body = ChatCompletionRequest {
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        self.send_request(&body).await
    }
}

/// Embedding client for an Azure OpenAI embeddings deployment.
#[derive(Clone)]
pub struct AzureOpenAIEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    api_version: String,
    deployment: String,
}

impl AzureOpenAIEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: trim_endpoint(endpoint.into()),
            api_key: api_key.into(),
            api_version: api_version.into(),
            deployment: deployment.into(),
        }
    }

    /// Builds the embedder from configuration.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when no embedding deployment is configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, MedtermError> {
        let deployment = config.embedding_deployment.clone().ok_or_else(|| {
            MedtermError::config("AZURE_OPENAI_EMBEDDING_DEPLOYMENT is not configured")
        })?;
        Ok(Self::new(
            &config.openai_endpoint,
            &config.openai_api_key,
            &config.openai_api_version,
            deployment,
        ))
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

#[async_trait]
impl TextEmbedder for AzureOpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MedtermError> {
        let response = self
            .client
            .post(self.url())
            .header("api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&EmbeddingRequest { input: text })
            .send()
            .await
            .map_err(|err| MedtermError::embedding(format!("Embedding request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MedtermError::embedding(format!(
                "Embedding request returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|err| {
            MedtermError::embedding(format!("Failed to parse embedding response: {err}"))
        })?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|entry| entry.embedding)
            .ok_or_else(|| MedtermError::embedding("Embedding response contained no vectors"))
    }
}

fn trim_endpoint(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
    #[allow(dead_code)]
    code: Option<String>,
}

fn extract_text_response(response: ChatCompletionResponse) -> Result<String, AgentError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| {
            AgentError::ExecutionFailed("Chat completion returned no content".into())
        })
}

fn map_http_error(status: StatusCode, body: String, retry_after: Option<Duration>) -> AgentError {
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or_else(|_| body.clone());

    let is_retryable = matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    );

    if let Some(delay) = retry_after {
        AgentError::process_error_with_retry_after(status.as_u16(), message, is_retryable, delay)
    } else {
        AgentError::Process {
            status_code: Some(status.as_u16()),
            message,
            is_retryable,
            retry_after: None,
        }
    }
}

fn parse_retry_after(header: Option<&HeaderValue>) -> Option<Duration> {
    let value = header?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // Retry-After HTTP-date parsing is omitted for simplicity
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let chat = AzureOpenAIChat::new(
            "https://aoai.example.com/",
            "key",
            "2024-02-15-preview",
            "gpt-chat",
        );
        assert_eq!(
            chat.url(),
            "https://aoai.example.com/openai/deployments/gpt-chat/chat/completions?api-version=2024-02-15-preview"
        );

        let embedder =
            AzureOpenAIEmbedder::new("https://aoai.example.com", "key", "v1", "text-embed");
        assert_eq!(
            embedder.url(),
            "https://aoai.example.com/openai/deployments/text-embed/embeddings?api-version=v1"
        );
    }

    #[test]
    fn test_map_http_error_rate_limit_is_retryable() {
        let err = map_http_error(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "Requests are being throttled", "code": "429"}}"#.to_string(),
            Some(Duration::from_secs(7)),
        );

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.to_string().contains("throttled"));
    }

    #[test]
    fn test_map_http_error_client_error_is_fatal() {
        let err = map_http_error(StatusCode::BAD_REQUEST, "plain text failure".to_string(), None);
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), Some(400));
        assert!(err.to_string().contains("plain text failure"));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let header = HeaderValue::from_static("12");
        assert_eq!(parse_retry_after(Some(&header)), Some(Duration::from_secs(12)));
        let bad = HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&bad)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_extract_text_response() {
        let response = ChatCompletionResponse {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: Some("hello".to_string()),
                },
            }],
        };
        assert_eq!(extract_text_response(response).unwrap(), "hello");

        let empty = ChatCompletionResponse { choices: vec![] };
        assert!(extract_text_response(empty).is_err());
    }
}
