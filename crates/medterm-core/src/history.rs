//! Rolling conversation history with JSON persistence.
//!
//! Keeps a bounded window of role-tagged messages; the window never exceeds
//! `max_messages` after an insert. The whole history round-trips through a
//! single JSON file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::intent::AgentKind;

/// Role of a conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A role/content pair ready to be sent to a chat-completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Which agent produced an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

/// Statistics over the current history window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub system_messages: usize,
    pub agent_usage: BTreeMap<String, usize>,
    pub oldest_message: Option<String>,
    pub newest_message: Option<String>,
}

/// On-disk envelope for the persisted history.
#[derive(Serialize, Deserialize)]
struct PersistedHistory {
    max_messages: usize,
    saved_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

/// Manages a bounded list of chat messages with JSON persistence.
pub struct ConversationHistory {
    max_messages: usize,
    storage_file: PathBuf,
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    /// Creates an empty history persisting to the given file.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn new(max_messages: usize, storage_file: impl AsRef<Path>) -> Result<Self> {
        let storage_file = storage_file.as_ref().to_path_buf();
        if let Some(parent) = storage_file.parent() {
            fs::create_dir_all(parent).context("Failed to create history directory")?;
        }

        Ok(Self {
            max_messages,
            storage_file,
            messages: Vec::new(),
        })
    }

    /// Adds a user message.
    pub fn add_user_message(&mut self, content: impl Into<String>) {
        let content = content.into();
        debug!("Added user message: {:.50}...", content);
        self.push(ChatMessage {
            role: MessageRole::User,
            content,
            timestamp: Utc::now(),
            agent: None,
            metadata: None,
        });
    }

    /// Adds an assistant message tagged with the producing agent.
    pub fn add_assistant_message(&mut self, content: impl Into<String>, agent: AgentKind) {
        let content = content.into();
        debug!("Added assistant message from {agent}: {:.50}...", content);
        self.push(ChatMessage {
            role: MessageRole::Assistant,
            content,
            timestamp: Utc::now(),
            agent: Some(agent),
            metadata: None,
        });
    }

    /// Adds a system message.
    pub fn add_system_message(&mut self, content: impl Into<String>) {
        self.push(ChatMessage {
            role: MessageRole::System,
            content: content.into(),
            timestamp: Utc::now(),
            agent: None,
            metadata: None,
        });
    }

    fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(..excess);
            debug!("Trimmed {excess} old messages from history");
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Converts the window into chat turns for an LLM call.
    ///
    /// Assistant turns are prefixed with their agent tag so the model can
    /// tell which specialist produced them.
    pub fn as_chat_turns(&self, include_system: bool) -> Vec<ChatTurn> {
        self.messages
            .iter()
            .filter(|message| include_system || message.role != MessageRole::System)
            .map(|message| {
                let content = match (message.role, message.agent) {
                    (MessageRole::Assistant, Some(agent)) => {
                        format!("[{agent} agent]: {}", message.content)
                    }
                    _ => message.content.clone(),
                };
                ChatTurn {
                    role: message.role,
                    content,
                }
            })
            .collect()
    }

    /// A human-readable rendering of the most recent messages.
    pub fn recent_context(&self, num_messages: usize) -> String {
        let start = self.messages.len().saturating_sub(num_messages);
        let recent = &self.messages[start..];
        if recent.is_empty() {
            return "No previous conversation context.".to_string();
        }

        let mut lines = vec!["Recent conversation context:".to_string()];
        for message in recent {
            let stamp = message.timestamp.format("%H:%M");
            match message.role {
                MessageRole::User => lines.push(format!("[{stamp}] User: {}", message.content)),
                MessageRole::Assistant => {
                    let agent = message
                        .agent
                        .map(|a| format!(" ({a})"))
                        .unwrap_or_default();
                    lines.push(format!("[{stamp}] Assistant{agent}: {}", message.content));
                }
                MessageRole::System => {}
            }
        }
        lines.join("\n")
    }

    /// Removes all messages from the in-memory window.
    pub fn clear(&mut self) {
        let count = self.messages.len();
        self.messages.clear();
        info!("Cleared {count} messages from conversation history");
    }

    /// Statistics over the current window.
    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats {
            total_messages: self.messages.len(),
            oldest_message: self.messages.first().map(|m| m.timestamp.to_rfc3339()),
            newest_message: self.messages.last().map(|m| m.timestamp.to_rfc3339()),
            ..HistoryStats::default()
        };

        for message in &self.messages {
            match message.role {
                MessageRole::User => stats.user_messages += 1,
                MessageRole::Assistant => {
                    stats.assistant_messages += 1;
                    if let Some(agent) = message.agent {
                        *stats.agent_usage.entry(agent.to_string()).or_insert(0) += 1;
                    }
                }
                MessageRole::System => stats.system_messages += 1,
            }
        }
        stats
    }

    /// Saves the history to its storage file.
    pub fn save(&self) -> Result<()> {
        let envelope = PersistedHistory {
            max_messages: self.max_messages,
            saved_at: Utc::now(),
            messages: self.messages.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)
            .context("Failed to serialize conversation history")?;
        fs::write(&self.storage_file, json).context(format!(
            "Failed to write history file: {:?}",
            self.storage_file
        ))?;

        info!(
            "Saved {} messages to {:?}",
            self.messages.len(),
            self.storage_file
        );
        Ok(())
    }

    /// Loads the history from disk, replacing the in-memory window.
    ///
    /// Returns `Ok(false)` when no file exists yet.
    pub fn load(&mut self) -> Result<bool> {
        if !self.storage_file.exists() {
            info!("No conversation history file at {:?}", self.storage_file);
            return Ok(false);
        }

        let json = fs::read_to_string(&self.storage_file).context(format!(
            "Failed to read history file: {:?}",
            self.storage_file
        ))?;
        let envelope: PersistedHistory =
            serde_json::from_str(&json).context("Failed to deserialize conversation history")?;

        self.max_messages = envelope.max_messages;
        self.messages = envelope.messages;
        info!("Loaded {} messages from {:?}", self.messages.len(), self.storage_file);
        Ok(true)
    }

    /// Deletes the persisted history file if present.
    pub fn delete_saved(&self) -> Result<()> {
        if self.storage_file.exists() {
            fs::remove_file(&self.storage_file).context(format!(
                "Failed to delete history file: {:?}",
                self.storage_file
            ))?;
            info!("Deleted conversation history file: {:?}", self.storage_file);
        }
        Ok(())
    }
}
