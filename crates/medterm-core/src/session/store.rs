//! Persisting store for interactive sessions.
//!
//! Each session lives in memory as an [`InteractiveContext`] and is mirrored
//! to `<storage_dir>/<session_id>.json` after every mutation. Save failures
//! are logged and swallowed: the in-memory state stays authoritative for the
//! running process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::session::{DataItem, InteractiveContext, ModificationAction, ModificationRecord};
use crate::text::clean_html_tags;

/// Counters returned by [`SessionStore::cleanup`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub memory_sessions_before: usize,
    pub memory_sessions_cleared: usize,
    pub disk_files_total: usize,
    pub disk_files_deleted: usize,
}

/// Per-session breakdown inside [`SessionUsage`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionUsageEntry {
    pub items: usize,
    pub created_at: String,
    pub modifications: usize,
}

/// Memory usage statistics over every loaded session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUsage {
    pub sessions_in_memory: usize,
    pub total_items: usize,
    pub estimated_size_bytes: usize,
    pub sessions: HashMap<String, SessionUsageEntry>,
}

/// Statistics about a single session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub created_at: String,
    pub total_items: usize,
    pub item_types: std::collections::BTreeMap<String, usize>,
    pub queries_processed: usize,
    pub modifications_made: usize,
}

/// Manages interactive sessions and their persistence to the filesystem.
pub struct SessionStore {
    contexts: HashMap<String, InteractiveContext>,
    active_session_id: Option<String>,
    storage_dir: PathBuf,
}

impl SessionStore {
    /// Creates a store rooted at the given directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        fs::create_dir_all(&storage_dir).context("Failed to create session storage directory")?;

        Ok(Self {
            contexts: HashMap::new(),
            active_session_id: None,
            storage_dir,
        })
    }

    /// Creates a store at the default location (`~/.medterm/sessions`).
    pub fn default_location() -> Result<Self> {
        let home_dir = dirs::home_dir().context("Failed to get home directory")?;
        Self::new(home_dir.join(".medterm").join("sessions"))
    }

    /// Starts a session, loading it from disk when a saved file exists.
    ///
    /// The session becomes the active one.
    pub fn start_session(&mut self, session_id: &str) -> &InteractiveContext {
        if !self.contexts.contains_key(session_id) {
            match self.load(session_id) {
                Ok(true) => {}
                Ok(false) => {
                    self.contexts
                        .insert(session_id.to_string(), InteractiveContext::new(session_id));
                    info!("Started new interactive session: {session_id}");
                }
                Err(err) => {
                    warn!("Failed to load session {session_id}: {err:#}; starting fresh");
                    self.contexts
                        .insert(session_id.to_string(), InteractiveContext::new(session_id));
                }
            }
        }

        self.active_session_id = Some(session_id.to_string());
        &self.contexts[session_id]
    }

    /// Switches the active session, saving nothing; loads from disk if needed.
    pub fn set_active(&mut self, session_id: &str) {
        self.start_session(session_id);
    }

    /// The currently active session id, if any.
    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session_id.as_deref()
    }

    /// Returns a session context by id (in-memory only).
    pub fn get(&self, session_id: &str) -> Option<&InteractiveContext> {
        self.contexts.get(session_id)
    }

    /// Checks whether a session exists in memory or on disk.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.contexts.contains_key(session_id) || self.session_file_path(session_id).exists()
    }

    /// Appends a query to the session's history.
    pub fn record_query(&mut self, session_id: &str, query: &str) {
        if let Some(context) = self.contexts.get_mut(session_id) {
            context.query_history.push(query.to_string());
        }
    }

    /// Adds (or replaces) a data item, logging the mutation and auto-saving.
    ///
    /// Returns `false` when the session does not exist in memory.
    pub fn add_item(&mut self, session_id: &str, item: DataItem) -> bool {
        let Some(context) = self.contexts.get_mut(session_id) else {
            return false;
        };

        context.modifications.push(ModificationRecord::for_item(
            ModificationAction::Add,
            &item.item_type,
            &item.key,
        ));
        debug!("Added {} {} to session {session_id}", item.item_type, item.key);
        context.current_data.insert(item.key.clone(), item);

        self.auto_save(session_id);
        true
    }

    /// Removes a data item by key, logging the mutation and auto-saving.
    ///
    /// Returns `false` when the session or the key does not exist.
    pub fn remove_item(&mut self, session_id: &str, key: &str) -> bool {
        let Some(context) = self.contexts.get_mut(session_id) else {
            return false;
        };

        let Some(removed) = context.current_data.remove(key) else {
            return false;
        };

        context.modifications.push(ModificationRecord::for_item(
            ModificationAction::Remove,
            &removed.item_type,
            key,
        ));
        info!("Removed {key} from session {session_id}");

        self.auto_save(session_id);
        true
    }

    /// Clears every data item from a session, keeping the session itself.
    pub fn clear_items(&mut self, session_id: &str) -> bool {
        let Some(context) = self.contexts.get_mut(session_id) else {
            return false;
        };

        context.current_data.clear();
        context
            .modifications
            .push(ModificationRecord::new(ModificationAction::ClearAll));
        info!("Cleared session {session_id}");

        self.auto_save(session_id);
        true
    }

    /// Replaces the full item set of a session with new search results.
    ///
    /// Used by retrieval agents whose latest result set supersedes the
    /// previous one.
    pub fn replace_items(&mut self, session_id: &str, items: Vec<DataItem>) -> bool {
        let Some(context) = self.contexts.get_mut(session_id) else {
            return false;
        };

        context.current_data.clear();
        for item in items {
            context.current_data.insert(item.key.clone(), item);
        }

        self.auto_save(session_id);
        true
    }

    /// All items of a given type in a session.
    pub fn items_by_type(&self, session_id: &str, item_type: &str) -> Vec<&DataItem> {
        self.contexts
            .get(session_id)
            .map(|context| context.items_by_type(item_type))
            .unwrap_or_default()
    }

    /// A human-readable summary of the session's data, grouped by type.
    pub fn data_summary(&self, session_id: &str) -> String {
        let Some(context) = self.contexts.get(session_id) else {
            return "No active session found.".to_string();
        };
        if context.is_empty() {
            return "No data currently loaded in this session.".to_string();
        }

        let mut lines = vec!["**Current Data in Session:**".to_string()];
        for (item_type, _) in context.type_counts() {
            lines.push(format!("\n**{}s:**", title_case(&item_type)));
            for item in context.items_by_type(&item_type) {
                lines.push(format!("- {}: {}", item.key, clean_html_tags(&item.value)));
            }
        }
        lines.push(format!("\nTotal items: {}", context.len()));

        lines.join("\n")
    }

    /// The session's data rendered as a markdown table.
    pub fn as_markdown_table(&self, session_id: &str) -> String {
        let Some(context) = self.contexts.get(session_id) else {
            return "| Error | Session not found |".to_string();
        };
        if context.is_empty() {
            return "| Info | No data in session |".to_string();
        }

        let mut lines = vec![
            "| Type | Key | Value | Added At |".to_string(),
            "|------|-----|-------|----------|".to_string(),
        ];
        for item in context.current_data.values() {
            let mut value = clean_html_tags(&item.value);
            value = value.split_whitespace().collect::<Vec<_>>().join(" ");
            if value.len() > 150 {
                value.truncate(147);
                value.push_str("...");
            }
            lines.push(format!(
                "| {} | {} | {} | {} |",
                item.item_type,
                item.key,
                value,
                item.added_at.format("%H:%M:%S")
            ));
        }

        lines.join("\n")
    }

    /// The session's data exported as pretty JSON.
    pub fn as_json(&self, session_id: &str) -> String {
        let Some(context) = self.contexts.get(session_id) else {
            return r#"{"error": "Session not found"}"#.to_string();
        };

        let export = serde_json::json!({
            "session_id": context.session_id,
            "created_at": context.created_at.to_rfc3339(),
            "data_count": context.len(),
            "data": context.current_data,
        });
        serde_json::to_string_pretty(&export).unwrap_or_else(|err| {
            warn!("Failed to serialize session {session_id}: {err}");
            r#"{"error": "Serialization failed"}"#.to_string()
        })
    }

    /// Statistics about one session.
    pub fn session_stats(&self, session_id: &str) -> Option<SessionStats> {
        let context = self.contexts.get(session_id)?;
        Some(SessionStats {
            session_id: context.session_id.clone(),
            created_at: context.created_at.to_rfc3339(),
            total_items: context.len(),
            item_types: context.type_counts(),
            queries_processed: context.query_history.len(),
            modifications_made: context.modifications.len(),
        })
    }

    /// Saves a session to disk as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not in memory, serialization
    /// fails, or the file cannot be written.
    pub fn save(&self, session_id: &str) -> Result<()> {
        let context = self
            .contexts
            .get(session_id)
            .with_context(|| format!("Cannot save session {session_id}: not found in memory"))?;

        let file_path = self.session_file_path(session_id);
        let json =
            serde_json::to_string_pretty(context).context("Failed to serialize session data")?;
        fs::write(&file_path, json)
            .context(format!("Failed to write session file: {file_path:?}"))?;

        info!("Saved session {session_id} ({} items)", context.len());
        Ok(())
    }

    /// Loads a session from disk into memory.
    ///
    /// Returns `Ok(false)` when no file exists for the id.
    pub fn load(&mut self, session_id: &str) -> Result<bool> {
        let file_path = self.session_file_path(session_id);
        if !file_path.exists() {
            return Ok(false);
        }

        let json = fs::read_to_string(&file_path)
            .context(format!("Failed to read session file: {file_path:?}"))?;
        let context: InteractiveContext =
            serde_json::from_str(&json).context("Failed to deserialize session data")?;

        info!("Loaded session {session_id} ({} items)", context.len());
        self.contexts.insert(session_id.to_string(), context);
        Ok(true)
    }

    /// Saves every in-memory session; returns how many succeeded.
    pub fn save_all(&self) -> usize {
        let mut saved = 0;
        for session_id in self.contexts.keys() {
            match self.save(session_id) {
                Ok(()) => saved += 1,
                Err(err) => warn!("Failed to save session {session_id}: {err:#}"),
            }
        }
        info!("Saved {saved}/{} sessions to disk", self.contexts.len());
        saved
    }

    /// Lists the session ids that have a saved file.
    pub fn list_saved_sessions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in
            fs::read_dir(&self.storage_dir).context("Failed to read session storage directory")?
        {
            let path = entry.context("Failed to read directory entry")?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes a session from memory and optionally its file from disk.
    pub fn delete_session(&mut self, session_id: &str, delete_file: bool) -> Result<()> {
        self.contexts.remove(session_id);
        if self.active_session_id.as_deref() == Some(session_id) {
            self.active_session_id = None;
        }

        if delete_file {
            let file_path = self.session_file_path(session_id);
            if file_path.exists() {
                fs::remove_file(&file_path)
                    .context(format!("Failed to delete session file: {file_path:?}"))?;
                info!("Deleted session file for {session_id}");
            }
        }

        Ok(())
    }

    /// Prunes old session files and evicts excess in-memory sessions.
    ///
    /// Files older than `max_age_days` are deleted; only the
    /// `max_memory_sessions` most recently created contexts stay in memory
    /// (evicted ones are saved first).
    pub fn cleanup(&mut self, max_age_days: u64, max_memory_sessions: usize) -> CleanupStats {
        let mut stats = CleanupStats {
            memory_sessions_before: self.contexts.len(),
            ..CleanupStats::default()
        };

        if self.contexts.len() > max_memory_sessions {
            let mut by_age: Vec<(String, chrono::DateTime<chrono::Utc>)> = self
                .contexts
                .iter()
                .map(|(id, context)| (id.clone(), context.created_at))
                .collect();
            by_age.sort_by(|a, b| b.1.cmp(&a.1));

            for (session_id, _) in by_age.into_iter().skip(max_memory_sessions) {
                if let Err(err) = self.save(&session_id) {
                    warn!("Failed to save session {session_id} before eviction: {err:#}");
                }
                self.contexts.remove(&session_id);
                stats.memory_sessions_cleared += 1;
            }
            info!(
                "Evicted {} sessions from memory (kept {})",
                stats.memory_sessions_cleared,
                self.contexts.len()
            );
        }

        let cutoff = Duration::from_secs(max_age_days * 24 * 60 * 60);
        match fs::read_dir(&self.storage_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|s| s.to_str()) != Some("json") {
                        continue;
                    }
                    stats.disk_files_total += 1;

                    let age = entry
                        .metadata()
                        .and_then(|meta| meta.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                    if let Some(age) = age {
                        if age > cutoff {
                            if let Err(err) = fs::remove_file(&path) {
                                warn!("Failed to delete old session file {path:?}: {err}");
                            } else {
                                stats.disk_files_deleted += 1;
                                debug!("Deleted old session file: {path:?}");
                            }
                        }
                    }
                }
            }
            Err(err) => warn!("Session cleanup could not read storage dir: {err}"),
        }

        info!(
            "Session cleanup complete: memory cleared={}, disk deleted={}/{}",
            stats.memory_sessions_cleared, stats.disk_files_deleted, stats.disk_files_total
        );
        stats
    }

    /// Memory usage statistics over all loaded sessions.
    pub fn usage_stats(&self) -> SessionUsage {
        let mut total_items = 0;
        let mut estimated_size_bytes = 0;
        let mut sessions = HashMap::new();

        for (session_id, context) in &self.contexts {
            total_items += context.len();
            for item in context.current_data.values() {
                estimated_size_bytes += item.value.len();
                estimated_size_bytes += serde_json::to_string(&item.metadata)
                    .map(|s| s.len())
                    .unwrap_or(0);
            }
            sessions.insert(
                session_id.clone(),
                SessionUsageEntry {
                    items: context.len(),
                    created_at: context.created_at.to_rfc3339(),
                    modifications: context.modifications.len(),
                },
            );
        }

        SessionUsage {
            sessions_in_memory: self.contexts.len(),
            total_items,
            estimated_size_bytes,
            sessions,
        }
    }

    /// Saves after a mutation; failures are logged, never propagated.
    fn auto_save(&self, session_id: &str) {
        if let Err(err) = self.save(session_id) {
            warn!("Auto-save failed for session {session_id}: {err:#}");
        }
    }

    fn session_file_path(&self, session_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{session_id}.json"))
    }
}

fn title_case(item_type: &str) -> String {
    item_type
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(item_type: &str, key: &str, value: &str) -> DataItem {
        DataItem::new(item_type, key, value)
            .with_metadata("full_document", json!({"CODE": key, "STR": value}))
            .with_source_query("test query")
    }

    #[test]
    fn test_round_trip_preserves_content() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SessionStore::new(temp_dir.path()).unwrap();

        store.start_session("s1");
        store.add_item("s1", item("icd_code", "I10", "Essential hypertension"));
        store.add_item("s1", item("snomed_code", "59621000", "Essential hypertension (disorder)"));
        store.record_query("s1", "hypertension codes");
        store.save("s1").unwrap();

        let mut reloaded = SessionStore::new(temp_dir.path()).unwrap();
        assert!(reloaded.load("s1").unwrap());

        let original = store.get("s1").unwrap();
        let restored = reloaded.get("s1").unwrap();
        assert_eq!(restored.current_data, original.current_data);
        assert_eq!(restored.query_history, original.query_history);
        assert_eq!(restored.modifications, original.modifications);
    }

    #[test]
    fn test_start_session_loads_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut store = SessionStore::new(temp_dir.path()).unwrap();
            store.start_session("persisted");
            store.add_item("persisted", item("icd_code", "E11", "Type 2 diabetes"));
        }

        let mut store = SessionStore::new(temp_dir.path()).unwrap();
        let context = store.start_session("persisted");
        assert_eq!(context.len(), 1);
        assert!(context.current_data.contains_key("E11"));
    }

    #[test]
    fn test_add_remove_and_modification_log() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SessionStore::new(temp_dir.path()).unwrap();
        store.start_session("s1");

        assert!(store.add_item("s1", item("icd_code", "I10", "Hypertension")));
        assert!(store.remove_item("s1", "I10"));
        assert!(!store.remove_item("s1", "I10"));
        assert!(!store.add_item("missing", item("icd_code", "I10", "Hypertension")));

        let context = store.get("s1").unwrap();
        assert!(context.is_empty());
        assert_eq!(context.modifications.len(), 2);
        assert_eq!(context.modifications[0].action, ModificationAction::Add);
        assert_eq!(context.modifications[1].action, ModificationAction::Remove);
    }

    #[test]
    fn test_replace_items_supersedes_previous_set() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SessionStore::new(temp_dir.path()).unwrap();
        store.start_session("s1");
        store.add_item("s1", item("snomed_code", "11111111", "old"));

        store.replace_items(
            "s1",
            vec![item("snomed_code", "22222222", "new a"), item("snomed_code", "33333333", "new b")],
        );

        let context = store.get("s1").unwrap();
        assert_eq!(context.len(), 2);
        assert!(!context.current_data.contains_key("11111111"));
    }

    #[test]
    fn test_memory_eviction_keeps_most_recent() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SessionStore::new(temp_dir.path()).unwrap();
        for i in 0..5 {
            store.start_session(&format!("s{i}"));
        }

        let stats = store.cleanup(30, 2);

        assert_eq!(stats.memory_sessions_before, 5);
        assert_eq!(stats.memory_sessions_cleared, 3);
        assert_eq!(store.usage_stats().sessions_in_memory, 2);
        // Evicted sessions were saved on the way out
        assert!(store.list_saved_sessions().unwrap().len() >= 3);
    }

    #[test]
    fn test_summary_and_table_formats() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SessionStore::new(temp_dir.path()).unwrap();
        store.start_session("s1");
        store.add_item("s1", item("icd_code", "I10", "Hypertension<br>primary"));

        let summary = store.data_summary("s1");
        assert!(summary.contains("Icd Codes"));
        assert!(summary.contains("I10: Hypertension, primary"));
        assert!(summary.contains("Total items: 1"));

        let table = store.as_markdown_table("s1");
        assert!(table.starts_with("| Type | Key | Value | Added At |"));
        assert!(table.contains("| icd_code | I10 |"));
        assert!(!table.contains("<br>"));

        assert_eq!(store.data_summary("nope"), "No active session found.");
    }

    #[test]
    fn test_json_export_contains_items() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SessionStore::new(temp_dir.path()).unwrap();
        store.start_session("s1");
        store.add_item("s1", item("icd_code", "I10", "Hypertension"));

        let exported = store.as_json("s1");
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(value["data_count"], json!(1));
        assert_eq!(value["data"]["I10"]["key"], json!("I10"));
    }

    #[test]
    fn test_has_session_checks_disk() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut store = SessionStore::new(temp_dir.path()).unwrap();
            store.start_session("on-disk");
            store.save("on-disk").unwrap();
        }

        let store = SessionStore::new(temp_dir.path()).unwrap();
        assert!(store.has_session("on-disk"));
        assert!(!store.has_session("never-existed"));
    }

    #[test]
    fn test_session_stats() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SessionStore::new(temp_dir.path()).unwrap();
        store.start_session("s1");
        store.add_item("s1", item("icd_code", "I10", "Hypertension"));
        store.record_query("s1", "find hypertension");

        let stats = store.session_stats("s1").unwrap();
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.queries_processed, 1);
        assert_eq!(stats.modifications_made, 1);
        assert!(store.session_stats("missing").is_none());
    }
}
