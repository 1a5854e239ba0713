//! Environment-driven application configuration.
//!
//! All tunables come from environment variables. The binary loads a `.env`
//! file before calling [`AppConfig::from_env`]; the core never touches the
//! process environment outside that one entry point, which keeps the loader
//! testable via [`AppConfig::from_lookup`].

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::error::{MedtermError, Result};

/// All configuration parameters consumed by the assistant.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Azure OpenAI resource endpoint, e.g. `https://myresource.openai.azure.com`
    pub openai_endpoint: String,
    pub openai_api_key: String,
    pub openai_api_version: String,
    /// Chat completions deployment name
    pub chat_deployment: String,
    /// Embeddings deployment name; relevance filtering degrades to
    /// "return everything" when unset
    pub embedding_deployment: Option<String>,

    /// Azure AI Search service endpoint
    pub search_endpoint: String,
    pub search_api_key: String,
    pub search_api_version: String,
    /// Index holding ICD-10 documents
    pub icd_index: String,
    /// Index holding SNOMED CT documents
    pub snomed_index: String,
    /// Semantic ranking configuration applied to ICD searches
    pub semantic_config: String,
    pub search_top_k: usize,

    pub agent_temperature: f32,
    pub agent_max_tokens: u32,
    /// Minimum cosine similarity for a session item to count as relevant
    pub relevance_threshold: f32,
    pub max_retries: u32,
    pub retry_initial_delay_secs: u64,

    /// Root directory for persisted state (sessions, history)
    pub data_dir: PathBuf,
    pub max_history_messages: usize,
    pub session_max_age_days: u64,
    pub session_max_in_memory: usize,
}

impl AppConfig {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when a required variable (service endpoints,
    /// API keys, the chat deployment) is missing.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads the configuration through an arbitrary variable lookup.
    ///
    /// This is the testable seam behind [`AppConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup("MEDTERM_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };

        Ok(Self {
            openai_endpoint: required(&lookup, "AZURE_OPENAI_ENDPOINT")?,
            openai_api_key: required(&lookup, "AZURE_OPENAI_API_KEY")?,
            openai_api_version: or_default(
                &lookup,
                "AZURE_OPENAI_API_VERSION",
                "2024-02-15-preview",
            ),
            chat_deployment: required(&lookup, "AZURE_OPENAI_CHAT_DEPLOYMENT")?,
            embedding_deployment: lookup("AZURE_OPENAI_EMBEDDING_DEPLOYMENT"),
            search_endpoint: required(&lookup, "AZURE_SEARCH_ENDPOINT")?,
            search_api_key: required(&lookup, "AZURE_SEARCH_API_KEY")?,
            search_api_version: or_default(
                &lookup,
                "AZURE_SEARCH_API_VERSION",
                "2023-07-01-Preview",
            ),
            icd_index: or_default(&lookup, "PCORNET_ICD_INDEX_NAME", "pcornet-icd-index"),
            snomed_index: or_default(&lookup, "SNOMED_INDEX_NAME", "snomed"),
            semantic_config: or_default(
                &lookup,
                "AZURE_SEARCH_SEMANTIC_CONFIG",
                "defaultSemanticConfig",
            ),
            search_top_k: parsed(&lookup, "SEARCH_TOP_K", 10),
            agent_temperature: parsed(&lookup, "AGENT_TEMPERATURE", 0.7),
            agent_max_tokens: parsed(&lookup, "AGENT_MAX_TOKENS", 1000),
            relevance_threshold: parsed(&lookup, "SESSION_RELEVANCE_THRESHOLD", 0.3),
            max_retries: parsed(&lookup, "LLM_MAX_RETRIES", 3),
            retry_initial_delay_secs: parsed(&lookup, "LLM_RETRY_INITIAL_DELAY_SECS", 2),
            data_dir,
            max_history_messages: parsed(&lookup, "MAX_HISTORY_MESSAGES", 20),
            session_max_age_days: parsed(&lookup, "SESSION_MAX_AGE_DAYS", 7),
            session_max_in_memory: parsed(&lookup, "SESSION_MAX_IN_MEMORY", 10),
        })
    }

    /// Directory holding one JSON file per interactive session.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Path of the rolling conversation history file.
    pub fn history_file(&self) -> PathBuf {
        self.data_dir.join("conversation_history.json")
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MedtermError::config("Failed to determine home directory"))?;
    Ok(home.join(".medterm"))
}

fn required<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| MedtermError::config(format!("{name} is required but not set")))
}

fn or_default<F>(lookup: &F, name: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).unwrap_or_else(|| default.to_string())
}

fn parsed<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(name) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid value for {name}: '{raw}', using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("AZURE_OPENAI_ENDPOINT", "https://aoai.example.com"),
            ("AZURE_OPENAI_API_KEY", "openai-key"),
            ("AZURE_OPENAI_CHAT_DEPLOYMENT", "gpt-chat"),
            ("AZURE_SEARCH_ENDPOINT", "https://search.example.com"),
            ("AZURE_SEARCH_API_KEY", "search-key"),
            ("MEDTERM_DATA_DIR", "/tmp/medterm-test"),
        ])
    }

    fn config_from(vars: HashMap<&'static str, &'static str>) -> Result<AppConfig> {
        AppConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_applied() {
        let config = config_from(base_vars()).unwrap();

        assert_eq!(config.icd_index, "pcornet-icd-index");
        assert_eq!(config.snomed_index, "snomed");
        assert_eq!(config.search_top_k, 10);
        assert_eq!(config.max_retries, 3);
        assert!((config.relevance_threshold - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.max_history_messages, 20);
        assert!(config.embedding_deployment.is_none());
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = base_vars();
        vars.remove("AZURE_OPENAI_API_KEY");

        let err = config_from(vars).unwrap_err();
        assert!(err.to_string().contains("AZURE_OPENAI_API_KEY"));
    }

    #[test]
    fn test_invalid_numeric_falls_back_to_default() {
        let mut vars = base_vars();
        vars.insert("SEARCH_TOP_K", "lots");

        let config = config_from(vars).unwrap();
        assert_eq!(config.search_top_k, 10);
    }

    #[test]
    fn test_overrides() {
        let mut vars = base_vars();
        vars.insert("SEARCH_TOP_K", "25");
        vars.insert("SESSION_RELEVANCE_THRESHOLD", "0.55");
        vars.insert("AZURE_OPENAI_EMBEDDING_DEPLOYMENT", "text-embed");

        let config = config_from(vars).unwrap();
        assert_eq!(config.search_top_k, 25);
        assert!((config.relevance_threshold - 0.55).abs() < f32::EPSILON);
        assert_eq!(config.embedding_deployment.as_deref(), Some("text-embed"));
        assert_eq!(config.sessions_dir(), PathBuf::from("/tmp/medterm-test/sessions"));
    }
}
