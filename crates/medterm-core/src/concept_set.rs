//! In-memory cache of concept sets produced during a session, plus the
//! follow-up detection and target disambiguation around it.
//!
//! Entries live only for the process lifetime; persistence is intentionally
//! absent (a restart simply means rebuilding the set from a fresh search).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// One concept set built for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptSetEntry {
    /// Primary condition the set was built for, used as its name
    pub name: String,
    /// Flattened `Code: …, Label: …, Score: …` records from the search
    pub raw_data: String,
    /// The formatted table shown to the user
    pub formatted: String,
    /// The user's original request
    pub query: String,
    pub created_at: DateTime<Utc>,
}

impl ConceptSetEntry {
    pub fn new(
        name: impl Into<String>,
        raw_data: impl Into<String>,
        formatted: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            raw_data: raw_data.into(),
            formatted: formatted.into(),
            query: query.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of resolving which concept set a follow-up refers to.
#[derive(Debug, PartialEq)]
pub enum TargetResolution<'a> {
    /// Exactly one set matched (or only one exists)
    Resolved(&'a ConceptSetEntry),
    /// Several candidates and nothing in the utterance picks one;
    /// names are ordered most recent first
    NeedsClarification(Vec<String>),
    /// The session has no concept sets at all
    Empty,
}

/// Per-session cache of concept sets. Never shared across sessions.
#[derive(Debug, Default)]
pub struct ConceptSetCache {
    sets: HashMap<String, Vec<ConceptSetEntry>>,
}

const RECENCY_PHRASES: &[&str] = &["most recent", "latest", "last one", "recent one"];

const FOLLOWUP_PATTERNS: &[&str] = &[
    "remove",
    "exclude",
    "filter out",
    "hide",
    "delete",
    "add column",
    "show column",
    "include column",
    "add field",
    "only show",
    "just show",
    "only include",
    "show only",
    "without",
    "except",
    "excluding",
    "modify",
    "change",
    "update",
    "edit",
    "from that table",
    "from the table",
    "from table",
    "from that",
    "from the concept set",
    "from concept set",
];

impl ConceptSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a concept set for a session.
    pub fn store(&mut self, session_id: &str, entry: ConceptSetEntry) {
        let entries = self.sets.entry(session_id.to_string()).or_default();
        entries.push(entry);
        info!(
            "Stored concept set '{}' for session {session_id} (total: {})",
            entries.last().map(|e| e.name.as_str()).unwrap_or(""),
            entries.len()
        );
    }

    /// All concept sets for a session, most recent first.
    ///
    /// Timestamp ties fall back to insertion order, newest insertion first.
    pub fn for_session(&self, session_id: &str) -> Vec<&ConceptSetEntry> {
        let mut indexed: Vec<(usize, &ConceptSetEntry)> = self
            .sets
            .get(session_id)
            .map(|entries| entries.iter().enumerate().collect())
            .unwrap_or_default();
        indexed.sort_by(|a, b| (b.1.created_at, b.0).cmp(&(a.1.created_at, a.0)));
        indexed.into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn is_empty(&self, session_id: &str) -> bool {
        self.sets.get(session_id).map_or(true, Vec::is_empty)
    }

    /// Identifies which concept set a follow-up utterance targets.
    ///
    /// Resolution order: a single existing set wins outright; a recency
    /// phrase picks the newest; a name mentioned in the utterance picks that
    /// set; otherwise the caller must ask the user instead of guessing.
    pub fn resolve_target(&self, session_id: &str, query: &str) -> TargetResolution<'_> {
        let entries = self.for_session(session_id);
        if entries.is_empty() {
            return TargetResolution::Empty;
        }

        if entries.len() == 1 {
            debug!("Using only available concept set: '{}'", entries[0].name);
            return TargetResolution::Resolved(entries[0]);
        }

        let query_lower = query.to_lowercase();

        if RECENCY_PHRASES.iter().any(|p| query_lower.contains(p)) {
            debug!("Using most recent concept set: '{}'", entries[0].name);
            return TargetResolution::Resolved(entries[0]);
        }

        for &entry in &entries {
            if query_lower.contains(&entry.name.to_lowercase()) {
                debug!("Identified target concept set: '{}'", entry.name);
                return TargetResolution::Resolved(entry);
            }
        }

        debug!(
            "Ambiguous follow-up: {} concept sets, none mentioned",
            entries.len()
        );
        TargetResolution::NeedsClarification(
            entries.iter().map(|entry| entry.name.clone()).collect(),
        )
    }
}

/// Detects an utterance that modifies an existing concept set.
///
/// Only meaningful when the session's cache is non-empty; callers check that
/// first to avoid false positives on ordinary sentences.
pub fn is_concept_set_followup(query: &str) -> bool {
    let query_lower = query.to_lowercase();
    FOLLOWUP_PATTERNS.iter().any(|p| query_lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ConceptSetEntry {
        ConceptSetEntry::new(name, "Code: X, Label: Y, Score: 1.0", "| X | Y |", format!("{name} codes"))
    }

    #[test]
    fn test_followup_patterns() {
        assert!(is_concept_set_followup("remove the fibromyalgia codes"));
        assert!(is_concept_set_followup("add column with SNOMED ids"));
        assert!(is_concept_set_followup("show only the first ten"));
        assert!(is_concept_set_followup("drop R52 from that table"));
        assert!(!is_concept_set_followup("create a diabetes concept set"));
        assert!(!is_concept_set_followup("what is hypertension?"));
    }

    #[test]
    fn test_single_set_resolves_without_clarification() {
        let mut cache = ConceptSetCache::new();
        cache.store("s1", entry("diabetes"));

        match cache.resolve_target("s1", "remove the E11 codes") {
            TargetResolution::Resolved(e) => assert_eq!(e.name, "diabetes"),
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn test_ambiguous_followup_lists_all_candidates() {
        let mut cache = ConceptSetCache::new();
        cache.store("s1", entry("diabetes"));
        cache.store("s1", entry("hypertension"));

        match cache.resolve_target("s1", "remove the first three codes") {
            TargetResolution::NeedsClarification(names) => {
                assert_eq!(names.len(), 2);
                assert!(names.contains(&"diabetes".to_string()));
                assert!(names.contains(&"hypertension".to_string()));
            }
            other => panic!("expected clarification, got {other:?}"),
        }
    }

    #[test]
    fn test_name_mention_resolves() {
        let mut cache = ConceptSetCache::new();
        cache.store("s1", entry("diabetes"));
        cache.store("s1", entry("hypertension"));

        match cache.resolve_target("s1", "remove I10 from the Hypertension set") {
            TargetResolution::Resolved(e) => assert_eq!(e.name, "hypertension"),
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn test_recency_phrase_resolves_to_newest() {
        let mut cache = ConceptSetCache::new();
        cache.store("s1", entry("diabetes"));
        cache.store("s1", entry("hypertension"));

        match cache.resolve_target("s1", "edit the most recent one") {
            TargetResolution::Resolved(e) => assert_eq!(e.name, "hypertension"),
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn test_sessions_are_isolated() {
        let mut cache = ConceptSetCache::new();
        cache.store("s1", entry("diabetes"));

        assert!(cache.is_empty("s2"));
        assert_eq!(cache.resolve_target("s2", "remove E11"), TargetResolution::Empty);
    }
}
