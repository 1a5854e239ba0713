//! Data model for interactive sessions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single typed entry held in an interactive session.
///
/// `key` is the unique identifier within the session (an ICD code such as
/// `I10`, a SNOMED code such as `59621000`), `value` is the display text.
/// The full search document, relevance score, and similar extras live in
/// `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    pub item_type: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub source_query: String,
}

impl DataItem {
    /// Creates a new item stamped with the current time.
    pub fn new(
        item_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            item_type: item_type.into(),
            key: key.into(),
            value: value.into(),
            metadata: BTreeMap::new(),
            added_at: Utc::now(),
            source_query: String::new(),
        }
    }

    /// Attaches a metadata field.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Records the query that produced this item.
    pub fn with_source_query(mut self, query: impl Into<String>) -> Self {
        self.source_query = query.into();
        self
    }

    /// Text form used for embedding-based relevance scoring.
    ///
    /// Combines code and description, plus the document `STR` field when the
    /// full search document was stored in metadata.
    pub fn searchable_text(&self) -> String {
        let mut text = format!("{} {}", self.key, self.value);
        if let Some(doc) = self.metadata.get("full_document") {
            if let Some(label) = doc.get("STR").and_then(Value::as_str) {
                text.push(' ');
                text.push_str(label);
            }
        }
        text
    }
}

/// Kinds of mutation recorded in a session's modification log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationAction {
    Add,
    Remove,
    ClearAll,
}

/// One entry of the per-session modification log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub action: ModificationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ModificationRecord {
    pub fn new(action: ModificationAction) -> Self {
        Self {
            action,
            item_type: None,
            key: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_item(action: ModificationAction, item_type: &str, key: &str) -> Self {
        Self {
            action,
            item_type: Some(item_type.to_string()),
            key: Some(key.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// The current state of one interactive session.
///
/// Items are keyed by their code so re-adding a code replaces the previous
/// entry; the `BTreeMap` keeps iteration (and thus rendered tables) stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveContext {
    pub session_id: String,
    #[serde(default)]
    pub current_data: BTreeMap<String, DataItem>,
    #[serde(default)]
    pub query_history: Vec<String>,
    #[serde(default)]
    pub modifications: Vec<ModificationRecord>,
    pub created_at: DateTime<Utc>,
}

impl InteractiveContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            current_data: BTreeMap::new(),
            query_history: Vec::new(),
            modifications: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.current_data.len()
    }

    /// All items of the given type.
    pub fn items_by_type(&self, item_type: &str) -> Vec<&DataItem> {
        self.current_data
            .values()
            .filter(|item| item.item_type == item_type)
            .collect()
    }

    /// Item counts grouped by type.
    pub fn type_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for item in self.current_data.values() {
            *counts.entry(item.item_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}
